//! [`DeviceTransport`] over a raw request/response frame channel.
//!
//! Modern exchanges are a single CTAP2 command. Legacy exchanges follow the
//! U2F flow: every allowed key handle is first tried with a check-only
//! sign, then the recognised handle is signed for real, polling until the
//! user touches the key or the user-action timeout expires.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{
    Capability, DeviceReply, DeviceTransport, LegacySignRequest, ModernSignRequest,
    ProtocolRequest, ResponseCode,
};
use crate::codec::{ctap2, u2f};
use crate::config::env_parse;
use crate::error::Result;
use crate::response::{AssertionResponse, AuthenticatorData};

/// Framing of one request on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// CTAP2 command byte followed by a CBOR payload.
    Cbor,
    /// U2F raw-message APDU.
    Apdu,
}

/// One request frame in, one response frame out.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    async fn transact(&self, kind: FrameKind, frame: &[u8]) -> Result<Vec<u8>>;
}

/// Timing of the legacy presence polling loop.
#[derive(Debug, Clone)]
pub struct FramedDeviceConfig {
    pub presence_poll_interval: Duration,
    pub user_action_timeout: Duration,
}

impl Default for FramedDeviceConfig {
    fn default() -> Self {
        Self {
            presence_poll_interval: Duration::from_millis(200),
            user_action_timeout: Duration::from_secs(30),
        }
    }
}

impl FramedDeviceConfig {
    /// Load from `FIDO_PRESENCE_POLL_MS` and `FIDO_USER_ACTION_TIMEOUT_SECS`,
    /// falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let presence_poll_interval = env_parse("FIDO_PRESENCE_POLL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.presence_poll_interval);
        let user_action_timeout = env_parse("FIDO_USER_ACTION_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.user_action_timeout);

        Self {
            presence_poll_interval,
            user_action_timeout,
        }
    }
}

/// Authenticator reached through a [`FrameChannel`].
pub struct FramedDevice<C> {
    channel: C,
    config: FramedDeviceConfig,
}

impl<C: FrameChannel> FramedDevice<C> {
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, FramedDeviceConfig::default())
    }

    pub fn with_config(channel: C, config: FramedDeviceConfig) -> Self {
        Self { channel, config }
    }

    async fn apdu(&self, frame: &[u8]) -> Result<(u16, Vec<u8>)> {
        let reply = self.channel.transact(FrameKind::Apdu, frame).await?;
        let (sw, body) = u2f::split_status(&reply)?;
        Ok((sw, body.to_vec()))
    }

    async fn modern(&self, request: &ModernSignRequest) -> Result<DeviceReply> {
        let frame = ctap2::encode_get_assertion(request)?;
        let reply = self.channel.transact(FrameKind::Cbor, &frame).await?;
        let implied_credential = match request.allow_list.as_slice() {
            [only] => Some(only.id.as_slice()),
            _ => None,
        };
        ctap2::decode_get_assertion(&reply, implied_credential)
    }

    /// Find the first key handle the device recognises.
    ///
    /// Handles too long for a U2F frame are skipped like unknown ones.
    async fn find_key_handle<'a>(
        &self,
        application: &[u8; 32],
        challenge: &[u8; 32],
        key_handles: &'a [Vec<u8>],
    ) -> Result<std::result::Result<&'a [u8], ResponseCode>> {
        for key_handle in key_handles {
            if key_handle.len() > u2f::MAX_KEY_HANDLE_LEN {
                debug!(len = key_handle.len(), "Skipping key handle too long for U2F");
                continue;
            }
            let frame = u2f::encode_authenticate(application, challenge, key_handle, true)?;
            match self.apdu(&frame).await?.0 {
                u2f::SW_CONDITIONS_NOT_SATISFIED | u2f::SW_NO_ERROR => return Ok(Ok(key_handle)),
                u2f::SW_WRONG_DATA => continue,
                sw => return Ok(Err(u2f::status_to_code(sw))),
            }
        }
        Ok(Err(ResponseCode::InvalidCredential))
    }

    /// Resend `frame` until the device stops asking for a touch.
    async fn poll_presence(&self, frame: &[u8]) -> Result<(u16, Vec<u8>)> {
        let deadline = Instant::now() + self.config.user_action_timeout;
        loop {
            let (sw, body) = self.apdu(frame).await?;
            if sw != u2f::SW_CONDITIONS_NOT_SATISFIED || Instant::now() >= deadline {
                return Ok((sw, body));
            }
            tokio::time::sleep(self.config.presence_poll_interval).await;
        }
    }

    async fn legacy(&self, request: &LegacySignRequest) -> Result<DeviceReply> {
        let (application, challenge, key_handles) = match request {
            LegacySignRequest::Sign {
                application,
                challenge,
                key_handles,
            } => (application, challenge, key_handles),
            LegacySignRequest::PresenceCheck => {
                let (sw, _) = self.poll_presence(&u2f::encode_presence_check()?).await?;
                return Ok(DeviceReply::failure(u2f::status_to_code(sw)));
            }
        };

        let key_handle = match self
            .find_key_handle(application, challenge, key_handles)
            .await?
        {
            Ok(key_handle) => key_handle,
            Err(code) => {
                debug!(code = %code, "No key handle accepted");
                return Ok(DeviceReply::failure(code));
            }
        };

        let frame = u2f::encode_authenticate(application, challenge, key_handle, false)?;
        let (sw, body) = self.poll_presence(&frame).await?;
        if sw != u2f::SW_NO_ERROR {
            return Ok(DeviceReply::failure(u2f::status_to_code(sw)));
        }

        let signed = u2f::decode_authenticate(&body)?;
        Ok(DeviceReply::success(AssertionResponse {
            credential_id: key_handle.to_vec(),
            auth_data: AuthenticatorData::new(*application, signed.flags, signed.counter),
            signature: signed.signature,
            user: None,
        }))
    }
}

#[async_trait]
impl<C: FrameChannel> DeviceTransport for FramedDevice<C> {
    #[instrument(level = "debug", skip(self))]
    async fn probe_capability(&self) -> Result<Capability> {
        let reply = self
            .channel
            .transact(FrameKind::Cbor, &ctap2::encode_get_info())
            .await?;

        Ok(match reply.first() {
            Some(&ctap2::STATUS_OK) => Capability::SupportsModernProtocol,
            _ => Capability::LegacyOnly,
        })
    }

    #[instrument(level = "debug", skip_all, fields(protocol = %request.protocol()))]
    async fn exchange(&self, request: &ProtocolRequest) -> Result<DeviceReply> {
        let start = std::time::Instant::now();
        let result = match request {
            ProtocolRequest::Modern(req) => self.modern(req).await,
            ProtocolRequest::Legacy(req) => self.legacy(req).await,
        };

        let latency_ms = start.elapsed().as_millis();
        match &result {
            Ok(reply) => {
                debug!(code = %reply.code, latency_ms = latency_ms as u64, "Exchange finished")
            }
            Err(e) => warn!(error = %e, latency_ms = latency_ms as u64, "Exchange failed"),
        }
        result
    }
}
