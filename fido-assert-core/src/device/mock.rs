//! Mock authenticator for testing and simulation.
//! WARNING: signatures are deterministic digests, not real ECDSA!

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Semaphore};
use tracing::debug;

use super::{
    Capability, DeviceReply, DeviceTransport, LegacySignRequest, ProtocolRequest,
    ProtocolVersion, ResponseCode,
};
use crate::error::{FidoError, Result};
use crate::request::rp_id_hash;
use crate::response::{AssertionResponse, AuthenticatorData, UserEntity, FLAG_USER_PRESENT};

/// One scripted answer to an exchange.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Sign with the first allowed credential (or the resident one).
    Success,
    /// Reply with a fixed assertion.
    Response(AssertionResponse),
    /// Reply with a failure code and no assertion.
    Code(ResponseCode),
    /// Claim success but return no assertion.
    EmptySuccess,
    /// The exchange itself fails at the I/O level.
    Io(String),
}

#[derive(Debug, Clone)]
struct Scripted {
    reply: MockReply,
    delay: Duration,
}

#[derive(Debug, Default)]
struct MockState {
    modern: VecDeque<Scripted>,
    legacy: VecDeque<Scripted>,
    requests: Vec<ProtocolRequest>,
    probes: usize,
    counter: u32,
}

#[derive(Debug, Clone)]
struct Resident {
    credential_id: Vec<u8>,
    user: UserEntity,
}

/// Scripted authenticator.
///
/// Replies are consumed per protocol in the order they were added. An
/// exchange with nothing scripted for its protocol answers
/// [`ResponseCode::TransportError`].
pub struct MockDevice {
    capability: Option<Capability>,
    seed: u64,
    resident: Option<Resident>,
    state: Arc<Mutex<MockState>>,
    gate: Option<Arc<Semaphore>>,
    started: Arc<watch::Sender<usize>>,
}

impl MockDevice {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability: Some(capability),
            seed: 0xDEADBEEF_CAFEBABE,
            resident: None,
            state: Arc::new(Mutex::new(MockState::default())),
            gate: None,
            started: Arc::new(watch::channel(0).0),
        }
    }

    /// A device whose capability probe fails.
    pub fn unreachable() -> Self {
        Self {
            capability: None,
            ..Self::new(Capability::LegacyOnly)
        }
    }

    /// Modern device that signs on the first exchange.
    pub fn modern_success() -> Self {
        Self::new(Capability::SupportsModernProtocol).modern(MockReply::Success)
    }

    /// Legacy-only device that signs on the first exchange.
    pub fn legacy_success() -> Self {
        Self::new(Capability::LegacyOnly).legacy(MockReply::Success)
    }

    /// Seed for the deterministic signature digest.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Store a discoverable credential, used when the allow list is empty.
    pub fn with_resident_credential(mut self, credential_id: Vec<u8>, user: UserEntity) -> Self {
        self.resident = Some(Resident {
            credential_id,
            user,
        });
        self
    }

    pub fn modern(self, reply: MockReply) -> Self {
        self.script(ProtocolVersion::Modern, reply, Duration::ZERO)
    }

    pub fn legacy(self, reply: MockReply) -> Self {
        self.script(ProtocolVersion::Legacy, reply, Duration::ZERO)
    }

    /// Script a reply that arrives after `delay`.
    pub fn script(self, protocol: ProtocolVersion, reply: MockReply, delay: Duration) -> Self {
        {
            let mut state = lock(&self.state);
            let queue = match protocol {
                ProtocolVersion::Modern => &mut state.modern,
                ProtocolVersion::Legacy => &mut state.legacy,
            };
            queue.push_back(Scripted { reply, delay });
        }
        self
    }

    /// Hold every exchange until [`MockProbe::release`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Observer that stays usable after the device moves into a task.
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            state: Arc::clone(&self.state),
            gate: self.gate.clone(),
            started: self.started.subscribe(),
        }
    }

    fn build_assertion(
        &self,
        request: &ProtocolRequest,
        counter: u32,
    ) -> Option<AssertionResponse> {
        let (credential_id, rp_hash, challenge, user) = match request {
            ProtocolRequest::Modern(req) => match req.allow_list.first() {
                Some(cred) => (
                    cred.id.clone(),
                    rp_id_hash(&req.rp_id),
                    *req.client_data_hash.as_bytes(),
                    None,
                ),
                None => {
                    let resident = self.resident.as_ref()?;
                    (
                        resident.credential_id.clone(),
                        rp_id_hash(&req.rp_id),
                        *req.client_data_hash.as_bytes(),
                        Some(resident.user.clone()),
                    )
                }
            },
            ProtocolRequest::Legacy(LegacySignRequest::Sign {
                application,
                challenge,
                key_handles,
            }) => (key_handles.first()?.clone(), *application, *challenge, None),
            ProtocolRequest::Legacy(LegacySignRequest::PresenceCheck) => return None,
        };

        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(&credential_id);
        hasher.update(challenge);
        let signature = hasher.finalize().to_vec();

        Some(AssertionResponse {
            credential_id,
            auth_data: AuthenticatorData::new(rp_hash, FLAG_USER_PRESENT, counter),
            signature,
            user,
        })
    }
}

#[async_trait]
impl DeviceTransport for MockDevice {
    async fn probe_capability(&self) -> Result<Capability> {
        lock(&self.state).probes += 1;
        self.capability
            .ok_or_else(|| FidoError::TransportError("mock device unreachable".into()))
    }

    async fn exchange(&self, request: &ProtocolRequest) -> Result<DeviceReply> {
        let (scripted, counter) = {
            let mut state = lock(&self.state);
            state.requests.push(request.clone());
            state.counter += 1;
            let counter = state.counter;
            let scripted = match request.protocol() {
                ProtocolVersion::Modern => state.modern.pop_front(),
                ProtocolVersion::Legacy => state.legacy.pop_front(),
            };
            (scripted, counter)
        };
        self.started.send_modify(|n| *n += 1);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| FidoError::TransportError(format!("mock gate closed: {e}")))?
                .forget();
        }

        let Some(scripted) = scripted else {
            debug!(protocol = %request.protocol(), "No reply scripted");
            return Ok(DeviceReply::failure(ResponseCode::TransportError));
        };

        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }

        match scripted.reply {
            MockReply::Success => Ok(match self.build_assertion(request, counter) {
                Some(response) => DeviceReply::success(response),
                // Presence check touched, or nothing to sign with.
                None => DeviceReply::failure(ResponseCode::Success),
            }),
            MockReply::Response(response) => Ok(DeviceReply::success(response)),
            MockReply::Code(code) => Ok(DeviceReply::failure(code)),
            MockReply::EmptySuccess => Ok(DeviceReply::failure(ResponseCode::Success)),
            MockReply::Io(reason) => Err(FidoError::TransportError(reason)),
        }
    }
}

/// Inspection and control handle for a [`MockDevice`].
#[derive(Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
    gate: Option<Arc<Semaphore>>,
    started: watch::Receiver<usize>,
}

impl MockProbe {
    /// Protocols of every exchange so far, in order.
    pub fn exchanges(&self) -> Vec<ProtocolVersion> {
        lock(&self.state)
            .requests
            .iter()
            .map(ProtocolRequest::protocol)
            .collect()
    }

    pub fn requests(&self) -> Vec<ProtocolRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn exchange_count(&self) -> usize {
        lock(&self.state).requests.len()
    }

    pub fn probe_count(&self) -> usize {
        lock(&self.state).probes
    }

    /// Let one held exchange complete.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Wait until at least `count` exchanges have begun.
    pub async fn wait_for_exchanges(&self, count: usize) {
        let mut started = self.started.clone();
        // The sender lives inside the device; if it is gone no more
        // exchanges can start.
        let _ = started.wait_for(|n| *n >= count).await;
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ModernSignRequest;
    use crate::request::{ClientDataHash, CredentialDescriptor, UserVerification};

    fn modern_request(allow: Vec<Vec<u8>>) -> ProtocolRequest {
        ProtocolRequest::Modern(ModernSignRequest {
            rp_id: "example.com".into(),
            client_data_hash: ClientDataHash::new([3; 32]),
            allow_list: allow.into_iter().map(CredentialDescriptor::new).collect(),
            user_verification: UserVerification::Preferred,
            extensions: None,
        })
    }

    #[tokio::test]
    async fn test_mock_success_signs_first_allowed_credential() {
        let device = MockDevice::modern_success();
        let reply = device.exchange(&modern_request(vec![vec![9, 9]])).await.unwrap();

        assert_eq!(reply.code, ResponseCode::Success);
        let response = reply.response.unwrap();
        assert_eq!(response.credential_id, vec![9, 9]);
        assert_eq!(response.auth_data.rp_id_hash, rp_id_hash("example.com"));
        assert!(!response.signature.is_empty());
        assert!(response.user.is_none());
    }

    #[tokio::test]
    async fn test_mock_signature_is_deterministic() {
        let a = MockDevice::modern_success().with_seed(42);
        let b = MockDevice::modern_success().with_seed(42);
        let request = modern_request(vec![vec![1]]);

        let sig_a = a.exchange(&request).await.unwrap().response.unwrap().signature;
        let sig_b = b.exchange(&request).await.unwrap().response.unwrap().signature;
        assert_eq!(sig_a, sig_b);
    }

    #[tokio::test]
    async fn test_mock_resident_credential() {
        let user = UserEntity {
            id: vec![0x55],
            name: Some("alice".into()),
        };
        let device = MockDevice::modern_success().with_resident_credential(vec![7], user.clone());
        let response = device
            .exchange(&modern_request(Vec::new()))
            .await
            .unwrap()
            .response
            .unwrap();

        assert_eq!(response.credential_id, vec![7]);
        assert_eq!(response.user, Some(user));
    }

    #[tokio::test]
    async fn test_mock_records_exchanges_and_runs_out() {
        let device = MockDevice::new(Capability::SupportsModernProtocol)
            .modern(MockReply::Code(ResponseCode::ProtocolMismatch));
        let probe = device.probe();
        let request = modern_request(vec![vec![1]]);

        let first = device.exchange(&request).await.unwrap();
        let second = device.exchange(&request).await.unwrap();

        assert_eq!(first.code, ResponseCode::ProtocolMismatch);
        assert_eq!(second.code, ResponseCode::TransportError);
        assert_eq!(probe.exchanges(), vec![ProtocolVersion::Modern; 2]);
    }

    #[tokio::test]
    async fn test_unreachable_probe_fails() {
        let device = MockDevice::unreachable();
        assert!(device.probe_capability().await.is_err());
        assert_eq!(device.probe().probe_count(), 1);
    }
}
