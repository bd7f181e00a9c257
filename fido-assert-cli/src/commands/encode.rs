//! Encode command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use fido_assert_core::codec::{ctap2, u2f};
use fido_assert_core::{
    AssertionRequest, DeviceHandle, LegacySignRequest, MockDevice, ProtocolRequest,
    ProtocolVersion, SignOperation,
};
use tracing::{debug, warn};

use crate::utils::build_request;
use crate::{ProtocolArg, RequestArgs};

/// One labelled wire frame.
struct Frame {
    label: String,
    bytes: Vec<u8>,
}

/// Frames a device would receive for `request` over `protocol`.
fn frames(request: &AssertionRequest, protocol: ProtocolVersion) -> Result<Vec<Frame>> {
    // Nothing is exchanged; the handle only gives the operation a device id.
    let device = DeviceHandle::new("encode", MockDevice::unreachable());

    match SignOperation::new(&device, protocol).build_request(request) {
        ProtocolRequest::Modern(wire) => {
            let bytes =
                ctap2::encode_get_assertion(&wire).context("Failed to encode CTAP2 request")?;
            Ok(vec![Frame {
                label: "authenticatorGetAssertion".into(),
                bytes,
            }])
        }
        ProtocolRequest::Legacy(LegacySignRequest::PresenceCheck) => Ok(vec![Frame {
            label: "presence check".into(),
            bytes: u2f::encode_presence_check()?,
        }]),
        ProtocolRequest::Legacy(LegacySignRequest::Sign {
            application,
            challenge,
            key_handles,
        }) => legacy_frames(&application, &challenge, &key_handles),
    }
}

/// A check-only frame followed by the signing APDU, per key handle.
fn legacy_frames(
    application: &[u8; 32],
    challenge: &[u8; 32],
    key_handles: &[Vec<u8>],
) -> Result<Vec<Frame>> {
    let mut frames = Vec::with_capacity(key_handles.len() * 2);
    for key_handle in key_handles {
        let handle = hex::encode(key_handle);
        if key_handle.len() > u2f::MAX_KEY_HANDLE_LEN {
            warn!(len = key_handle.len(), "Key handle too long for U2F, skipped");
            continue;
        }
        for (check_only, kind) in [(true, "check-only"), (false, "sign")] {
            let bytes = u2f::encode_authenticate(application, challenge, key_handle, check_only)
                .with_context(|| format!("Failed to encode U2F request for {handle}"))?;
            frames.push(Frame {
                label: format!("{kind} {handle}"),
                bytes,
            });
        }
    }
    Ok(frames)
}

/// Execute the encode command.
pub fn execute(args: RequestArgs, protocol: ProtocolArg, quiet: bool) -> Result<()> {
    let request = build_request(&args)?;
    let frames = frames(&request, protocol.into())?;
    debug!(?protocol, frames = frames.len(), "Encoded request");

    for frame in &frames {
        if quiet {
            println!("{}", hex::encode(&frame.bytes));
        } else {
            println!(
                "{} {}",
                format!("{}:", frame.label).dimmed(),
                hex::encode(&frame.bytes)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UvArg;

    fn request(credentials: &[&str]) -> AssertionRequest {
        build_request(&RequestArgs {
            rp_id: "example.com".into(),
            client_data_hash: None,
            credentials: credentials.iter().map(|c| c.to_string()).collect(),
            uv: UvArg::Preferred,
        })
        .unwrap()
    }

    #[test]
    fn test_modern_frame_starts_with_command_byte() {
        let frames = frames(&request(&["01"]), ProtocolVersion::Modern).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes[0], ctap2::CMD_GET_ASSERTION);
    }

    #[test]
    fn test_modern_frame_matches_sign_operation() {
        let request = request(&["c0ffee"]);
        let device = DeviceHandle::new("usb-0", MockDevice::unreachable());
        let ProtocolRequest::Modern(wire) =
            SignOperation::new(&device, ProtocolVersion::Modern).build_request(&request)
        else {
            panic!("expected a modern request");
        };

        let frames = frames(&request, ProtocolVersion::Modern).unwrap();
        assert_eq!(frames[0].bytes, ctap2::encode_get_assertion(&wire).unwrap());
    }

    #[test]
    fn test_legacy_frames_pair_check_and_sign() {
        let frames = frames(&request(&["01", "0203"]), ProtocolVersion::Legacy).unwrap();
        let labels: Vec<_> = frames.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["check-only 01", "sign 01", "check-only 0203", "sign 0203"]
        );
        assert_eq!(frames[0].bytes[2], u2f::P1_CHECK_ONLY);
        assert_eq!(frames[1].bytes[2], u2f::P1_ENFORCE_PRESENCE);
    }

    #[test]
    fn test_legacy_without_credentials_is_presence_check() {
        let frames = frames(&request(&[]), ProtocolVersion::Legacy).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].label, "presence check");
        assert_eq!(frames[0].bytes[1], u2f::INS_REGISTER);
    }

    #[test]
    fn test_legacy_skips_overlong_handle() {
        let long = "07".repeat(300);
        let frames = frames(&request(&[long.as_str(), "09"]), ProtocolVersion::Legacy).unwrap();
        let labels: Vec<_> = frames.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["check-only 09", "sign 09"]);
    }
}
