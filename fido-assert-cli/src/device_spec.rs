//! Parsing of `--device` specs into scripted mock authenticators.
//!
//! Format: `NAME=KIND[:OUTCOME[@MS]]...`
//!
//! On a modern device, outcomes answer CTAP2 exchanges until one of them
//! forces the fallback (`mismatch` or `unsupported`); the rest answer U2F
//! exchanges. A device with no outcomes signs on its native protocol.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use fido_assert_core::{
    Capability, DeviceHandle, MockDevice, MockReply, ProtocolVersion, ResponseCode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Modern,
    Legacy,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Timeout,
    Unsupported,
    Invalid,
    Mismatch,
    Transport,
    Empty,
    Io,
}

impl Outcome {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => Self::Success,
            "timeout" => Self::Timeout,
            "unsupported" => Self::Unsupported,
            "invalid" => Self::Invalid,
            "mismatch" => Self::Mismatch,
            "transport" => Self::Transport,
            "empty" => Self::Empty,
            "io" => Self::Io,
            _ => return None,
        })
    }

    fn forces_fallback(self) -> bool {
        matches!(self, Self::Mismatch | Self::Unsupported)
    }

    fn reply(self) -> MockReply {
        match self {
            Self::Success => MockReply::Success,
            Self::Timeout => MockReply::Code(ResponseCode::UserActionTimeout),
            Self::Unsupported => MockReply::Code(ResponseCode::UnsupportedOption),
            Self::Invalid => MockReply::Code(ResponseCode::InvalidCredential),
            Self::Mismatch => MockReply::Code(ResponseCode::ProtocolMismatch),
            Self::Transport => MockReply::Code(ResponseCode::TransportError),
            Self::Empty => MockReply::EmptySuccess,
            Self::Io => MockReply::Io("simulated I/O failure".into()),
        }
    }
}

/// One scripted exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub protocol: ProtocolVersion,
    pub outcome: Outcome,
    pub delay: Duration,
}

/// A parsed `--device` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub steps: Vec<Step>,
}

impl DeviceSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| format!("Invalid device spec '{spec}': {reason}");

        let Some((name, rest)) = spec.split_once('=') else {
            bail!(invalid("expected NAME=KIND"));
        };
        let name = name.trim();
        if name.is_empty() {
            bail!(invalid("device name is empty"));
        }

        let mut parts = rest.split(':');
        let kind = match parts.next().unwrap_or_default() {
            "modern" => DeviceKind::Modern,
            "legacy" => DeviceKind::Legacy,
            "unreachable" => DeviceKind::Unreachable,
            other => bail!(invalid(&format!("unknown kind '{other}'"))),
        };

        let mut protocol = match kind {
            DeviceKind::Modern => ProtocolVersion::Modern,
            _ => ProtocolVersion::Legacy,
        };
        let mut steps = Vec::new();
        for part in parts {
            let (outcome, delay) = match part.split_once('@') {
                Some((outcome, ms)) => {
                    let ms: u64 = ms
                        .parse()
                        .with_context(|| invalid(&format!("bad delay '{ms}'")))?;
                    (outcome, Duration::from_millis(ms))
                }
                None => (part, Duration::ZERO),
            };
            let outcome = Outcome::parse(outcome)
                .with_context(|| invalid(&format!("unknown outcome '{outcome}'")))?;

            steps.push(Step {
                protocol,
                outcome,
                delay,
            });
            if outcome.forces_fallback() {
                protocol = ProtocolVersion::Legacy;
            }
        }

        if kind == DeviceKind::Unreachable && !steps.is_empty() {
            bail!(invalid("unreachable devices take no outcomes"));
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            steps,
        })
    }

    pub fn into_handle(self) -> DeviceHandle {
        let device = match self.kind {
            DeviceKind::Unreachable => MockDevice::unreachable(),
            DeviceKind::Modern if self.steps.is_empty() => MockDevice::modern_success(),
            DeviceKind::Legacy if self.steps.is_empty() => MockDevice::legacy_success(),
            DeviceKind::Modern => self.script(MockDevice::new(Capability::SupportsModernProtocol)),
            DeviceKind::Legacy => self.script(MockDevice::new(Capability::LegacyOnly)),
        };
        DeviceHandle::new(self.name, device)
    }

    fn script(&self, device: MockDevice) -> MockDevice {
        self.steps.iter().fold(device, |device, step| {
            device.script(step.protocol, step.outcome.reply(), step.delay)
        })
    }
}

/// Parse every `--device` argument into a handle.
pub fn parse_devices(specs: &[String]) -> Result<Vec<DeviceHandle>> {
    specs
        .iter()
        .map(|spec| DeviceSpec::parse(spec).map(DeviceSpec::into_handle))
        .collect()
}
