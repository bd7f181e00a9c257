//! Device transport seam.
//!
//! The core never talks to USB, BLE or NFC directly. Each physical
//! authenticator is reached through a [`DeviceTransport`], which answers a
//! capability probe and performs one structured exchange per protocol
//! attempt.
//!
//! ## Implementations
//!
//! - [`MockDevice`] - scripted replies, for tests and simulations
//! - [`FramedDevice`] - CTAP2/U2F encoding over any request/response byte channel

#[cfg(feature = "framed")]
mod framed;
mod mock;

#[cfg(feature = "framed")]
pub use framed::{FrameChannel, FrameKind, FramedDevice, FramedDeviceConfig};
pub use mock::{MockDevice, MockProbe, MockReply};

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::{ClientDataHash, CredentialDescriptor, ExtensionMap, UserVerification};
use crate::response::AssertionResponse;

/// Stable identifier of one attached authenticator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which command protocols a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Binary command protocol (CTAP2), with legacy fallback available.
    SupportsModernProtocol,
    /// Challenge/response protocol only (U2F / CTAP1).
    LegacyOnly,
}

/// Wire protocol used for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    Modern,
    Legacy,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modern => write!(f, "ctap2"),
            Self::Legacy => write!(f, "u2f"),
        }
    }
}

/// Classification of a device reply. Drives every task transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    UserActionTimeout,
    UnsupportedOption,
    InvalidCredential,
    ProtocolMismatch,
    TransportError,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::UserActionTimeout => "user action timeout",
            Self::UnsupportedOption => "unsupported option",
            Self::InvalidCredential => "invalid credential",
            Self::ProtocolMismatch => "protocol mismatch",
            Self::TransportError => "transport error",
        };
        f.write_str(name)
    }
}

/// Modern (CTAP2) get-assertion parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModernSignRequest {
    pub rp_id: String,
    pub client_data_hash: ClientDataHash,
    pub allow_list: Vec<CredentialDescriptor>,
    pub user_verification: UserVerification,
    pub extensions: Option<ExtensionMap>,
}

/// Legacy (U2F) authenticate parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacySignRequest {
    /// Try each key handle in order; sign with the first one the device knows.
    Sign {
        application: [u8; 32],
        challenge: [u8; 32],
        key_handles: Vec<Vec<u8>>,
    },
    /// Empty allow list: collect a touch without any credential to match.
    PresenceCheck,
}

/// Structured request for one exchange. The variant fixes the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolRequest {
    Modern(ModernSignRequest),
    Legacy(LegacySignRequest),
}

impl ProtocolRequest {
    pub fn protocol(&self) -> ProtocolVersion {
        match self {
            Self::Modern(_) => ProtocolVersion::Modern,
            Self::Legacy(_) => ProtocolVersion::Legacy,
        }
    }
}

/// Result of one exchange: a code, plus the assertion when one was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReply {
    pub code: ResponseCode,
    pub response: Option<AssertionResponse>,
}

impl DeviceReply {
    pub fn success(response: AssertionResponse) -> Self {
        Self {
            code: ResponseCode::Success,
            response: Some(response),
        }
    }

    pub fn failure(code: ResponseCode) -> Self {
        Self {
            code,
            response: None,
        }
    }
}

/// Transport to one physical authenticator.
///
/// Implementations must be thread-safe (`Send + Sync`). An exchange may
/// block for as long as the user takes to touch the device; it is never
/// forcibly interrupted by the core.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Discover which protocols the device speaks.
    async fn probe_capability(&self) -> Result<Capability>;

    /// Perform one protocol exchange.
    ///
    /// `Err` means the exchange itself could not be carried out and is
    /// treated as [`ResponseCode::TransportError`].
    async fn exchange(&self, request: &ProtocolRequest) -> Result<DeviceReply>;
}

/// Exclusive reference to one attached authenticator.
///
/// Not `Clone`: whoever holds the handle is the only party that may talk
/// to the device.
pub struct DeviceHandle {
    id: DeviceId,
    capability: Option<Capability>,
    transport: Box<dyn DeviceTransport>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<DeviceId>, transport: impl DeviceTransport + 'static) -> Self {
        Self {
            id: id.into(),
            capability: None,
            transport: Box::new(transport),
        }
    }

    /// Record a capability that was discovered before the task starts,
    /// so the task skips its own probe.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn capability(&self) -> Option<Capability> {
        self.capability
    }

    pub(crate) fn remember_capability(&mut self, capability: Capability) {
        self.capability = Some(capability);
    }

    pub fn transport(&self) -> &dyn DeviceTransport {
        self.transport.as_ref()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("capability", &self.capability)
            .field("transport", &"<DeviceTransport>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_request_version() {
        let legacy = ProtocolRequest::Legacy(LegacySignRequest::PresenceCheck);
        assert_eq!(legacy.protocol(), ProtocolVersion::Legacy);
    }

    #[test]
    fn test_device_id_conversions_agree() {
        let owned = DeviceId::from(String::from("nfc-0"));
        assert_eq!(owned, DeviceId::from("nfc-0"));
        assert_eq!(owned.to_string(), "nfc-0");
    }

    #[test]
    fn test_device_handle_capability() {
        let handle = DeviceHandle::new("usb-1", MockDevice::modern_success())
            .with_capability(Capability::LegacyOnly);
        assert_eq!(handle.id().as_str(), "usb-1");
        assert_eq!(handle.capability(), Some(Capability::LegacyOnly));
    }

    #[test]
    fn test_response_code_display() {
        assert_eq!(ResponseCode::ProtocolMismatch.to_string(), "protocol mismatch");
        assert_eq!(ProtocolVersion::Modern.to_string(), "ctap2");
    }
}
