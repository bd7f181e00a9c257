//! FIDO Assert Core - per-device get-assertion tasks and the device race
//!
//! This crate drives a WebAuthn "get assertion" (sign) operation across every
//! connected authenticator at once and hands back exactly one response.
//!
//! # Features
//!
//! - Per-device state machine: modern (CTAP2) first, legacy (U2F) fallback
//! - Race coordinator: first processed success wins, the rest are cancelled
//! - Hot-plug attach/detach, transport retry with backoff, aggregate deadline
//! - CTAP2 CBOR and U2F APDU codecs behind a byte-frame transport adapter
//! - Scripted mock authenticator for tests and simulations
//!
//! # Example
//!
//! ```no_run
//! use fido_assert_core::{
//!     AssertionRace, AssertionRequest, ClientDataHash, CredentialDescriptor, DeviceHandle,
//!     MockDevice, RaceConfig,
//! };
//!
//! # async fn example() -> fido_assert_core::Result<()> {
//! let request = AssertionRequest::builder("example.com", ClientDataHash::new([0u8; 32]))
//!     .allow_credential(CredentialDescriptor::new(vec![0xC1, 0xC2]))
//!     .build()?;
//!
//! let devices = vec![
//!     DeviceHandle::new("usb-0", MockDevice::modern_success()),
//!     DeviceHandle::new("nfc-0", MockDevice::legacy_success()),
//! ];
//!
//! let pending = AssertionRace::new(RaceConfig::default()).submit(request, devices);
//! match pending.wait().await {
//!     Ok(response) => println!("signed with {:02x?}", response.credential_id),
//!     Err(e) => eprintln!("request failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod config;
pub mod device;
pub mod error;
pub mod operation;
pub mod race;
pub mod request;
pub mod response;
pub mod task;

// Re-export main types for convenience
pub use device::{
    Capability, DeviceHandle, DeviceId, DeviceReply, DeviceTransport, LegacySignRequest,
    MockDevice, MockProbe, MockReply, ModernSignRequest, ProtocolRequest, ProtocolVersion,
    ResponseCode,
};
pub use error::{FidoError, RequestError, Result};
pub use operation::SignOperation;
pub use race::{AssertionRace, PendingAssertion, RaceConfig, RaceController, RaceResult};
pub use request::{
    rp_id_hash, AssertionRequest, AssertionRequestBuilder, ClientDataHash,
    CredentialDescriptor, ExtensionMap, TransportHint, UserVerification,
};
pub use response::{AssertionResponse, AuthenticatorData, UserEntity};
pub use task::{
    AcceptedReport, AssertionTask, Attempt, Completion, TaskFailure, TaskOutcome, TaskReport,
    TaskState,
};

// Byte-frame transport adapter
#[cfg(feature = "framed")]
pub use device::{FrameChannel, FrameKind, FramedDevice, FramedDeviceConfig};

#[cfg(test)]
mod tests {
    use super::*;

    fn request(allow: Vec<u8>) -> AssertionRequest {
        AssertionRequest::builder("example.com", ClientDataHash::new([9; 32]))
            .allow_credential(CredentialDescriptor::new(allow))
            .build()
            .expect("valid request")
    }

    /// End to end: a modern device that rejects the request shape and a
    /// legacy device race; the fallback path produces the single response.
    #[tokio::test]
    async fn test_full_race_workflow() {
        let modern = MockDevice::new(Capability::SupportsModernProtocol)
            .modern(MockReply::Code(ResponseCode::ProtocolMismatch))
            .legacy(MockReply::Success);
        let legacy = MockDevice::new(Capability::LegacyOnly)
            .legacy(MockReply::Code(ResponseCode::InvalidCredential));
        let modern_probe = modern.probe();

        let pending = AssertionRace::default().submit(
            request(vec![0x42]),
            vec![
                DeviceHandle::new("modern", modern),
                DeviceHandle::new("legacy", legacy),
            ],
        );
        let response = pending.wait().await.expect("race should succeed");

        assert_eq!(response.credential_id, vec![0x42]);
        assert_eq!(response.auth_data.rp_id_hash, rp_id_hash("example.com"));
        assert!(!response.signature.is_empty());
        assert!(response.user.is_none());
        assert_eq!(
            modern_probe.exchanges(),
            vec![ProtocolVersion::Modern, ProtocolVersion::Legacy]
        );
    }

    #[tokio::test]
    async fn test_race_without_match() {
        let devices = (0..3)
            .map(|i| {
                DeviceHandle::new(
                    format!("dev-{i}"),
                    MockDevice::new(Capability::SupportsModernProtocol)
                        .modern(MockReply::Code(ResponseCode::InvalidCredential)),
                )
            })
            .collect();

        let result = AssertionRace::default()
            .submit(request(vec![1]), devices)
            .wait()
            .await;
        assert_eq!(result.unwrap_err(), RequestError::NoEligibleDevice);
    }
}
