//! One protocol-specific exchange with one device.
//!
//! [`SignOperation`] turns the shared [`AssertionRequest`] into the wire
//! request for its protocol, runs a single exchange and checks the reply
//! before the task state machine sees it. Whatever happens, the result is
//! a [`DeviceReply`]: I/O errors and malformed replies are folded into
//! [`ResponseCode::TransportError`].

use std::time::Instant;

use tracing::{debug, instrument, warn};

use crate::device::{
    DeviceHandle, DeviceReply, LegacySignRequest, ModernSignRequest, ProtocolRequest,
    ProtocolVersion, ResponseCode,
};
use crate::request::AssertionRequest;

/// A sign exchange bound to one device and one protocol version.
pub struct SignOperation<'a> {
    device: &'a DeviceHandle,
    protocol: ProtocolVersion,
}

impl<'a> SignOperation<'a> {
    pub fn new(device: &'a DeviceHandle, protocol: ProtocolVersion) -> Self {
        Self { device, protocol }
    }

    /// Wire-level request for this protocol.
    ///
    /// Extensions are modern-only. A legacy request with an empty allow
    /// list has nothing to sign with and becomes a presence check.
    pub fn build_request(&self, request: &AssertionRequest) -> ProtocolRequest {
        match self.protocol {
            ProtocolVersion::Modern => ProtocolRequest::Modern(ModernSignRequest {
                rp_id: request.rp_id().to_string(),
                client_data_hash: *request.client_data_hash(),
                allow_list: request.allow_list().to_vec(),
                user_verification: request.user_verification(),
                extensions: request.extensions_for(self.device.id()).cloned(),
            }),
            ProtocolVersion::Legacy if request.allow_list().is_empty() => {
                ProtocolRequest::Legacy(LegacySignRequest::PresenceCheck)
            }
            ProtocolVersion::Legacy => ProtocolRequest::Legacy(LegacySignRequest::Sign {
                application: request.rp_id_hash(),
                challenge: *request.client_data_hash().as_bytes(),
                key_handles: request.allow_list().iter().map(|c| c.id.clone()).collect(),
            }),
        }
    }

    /// Run the exchange and validate the reply.
    #[instrument(
        level = "debug",
        skip_all,
        fields(device = %self.device.id(), protocol = %self.protocol)
    )]
    pub async fn execute(&self, request: &AssertionRequest) -> DeviceReply {
        let wire = self.build_request(request);
        let start = Instant::now();

        let reply = match self.device.transport().exchange(&wire).await {
            Ok(reply) => reply,
            Err(e) => {
                let latency_ms = start.elapsed().as_millis();
                warn!(error = %e, latency_ms = latency_ms as u64, "Exchange failed");
                return DeviceReply::failure(ResponseCode::TransportError);
            }
        };

        let latency_ms = start.elapsed().as_millis();
        debug!(code = %reply.code, latency_ms = latency_ms as u64, "Device replied");

        self.validate(request, &wire, reply)
    }

    fn validate(
        &self,
        request: &AssertionRequest,
        wire: &ProtocolRequest,
        reply: DeviceReply,
    ) -> DeviceReply {
        if reply.code != ResponseCode::Success {
            return DeviceReply::failure(reply.code);
        }

        // A touch on a presence check proves nothing about credentials.
        if matches!(wire, ProtocolRequest::Legacy(LegacySignRequest::PresenceCheck)) {
            debug!("Presence check touched, no credential to match");
            return DeviceReply::failure(ResponseCode::InvalidCredential);
        }

        let Some(mut response) = reply.response else {
            return reject("success reported without an assertion");
        };

        if response.signature.is_empty() {
            return reject("empty signature");
        }
        if response.auth_data.rp_id_hash != request.rp_id_hash() {
            return reject("relying party hash mismatch");
        }
        if !request.allow_list().is_empty() && !request.allows(&response.credential_id) {
            return reject("credential not in allow list");
        }
        if self.protocol == ProtocolVersion::Legacy && response.user.take().is_some() {
            debug!("Dropped user entity from legacy response");
        }

        DeviceReply::success(response)
    }
}

fn reject(reason: &str) -> DeviceReply {
    warn!(reason, "Rejected device response");
    DeviceReply::failure(ResponseCode::TransportError)
}
