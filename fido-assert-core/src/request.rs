//! The immutable sign request shared by every device in a race.

use std::collections::BTreeMap;

use ciborium::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::device::DeviceId;
use crate::error::{FidoError, Result};

/// Length of the client data hash in bytes (SHA-256).
pub const CLIENT_DATA_HASH_LEN: usize = 32;

/// A validated client data hash (always exactly 32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDataHash([u8; CLIENT_DATA_HASH_LEN]);

impl ClientDataHash {
    pub fn new(hash: [u8; CLIENT_DATA_HASH_LEN]) -> Self {
        Self(hash)
    }

    /// Create a ClientDataHash from a slice.
    ///
    /// Returns `FidoError::InvalidClientDataHash` if the slice is not exactly 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let hash: [u8; CLIENT_DATA_HASH_LEN] = slice
            .try_into()
            .map_err(|_| FidoError::InvalidClientDataHash(slice.len()))?;
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_DATA_HASH_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for ClientDataHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; CLIENT_DATA_HASH_LEN]> for ClientDataHash {
    fn from(hash: [u8; CLIENT_DATA_HASH_LEN]) -> Self {
        Self::new(hash)
    }
}

/// Transport hint attached to an allowed credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    Usb,
    Nfc,
    Ble,
    Internal,
}

impl TransportHint {
    /// WebAuthn string form, used on the CTAP2 wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Nfc => "nfc",
            Self::Ble => "ble",
            Self::Internal => "internal",
        }
    }
}

/// An entry of the allow list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDescriptor {
    pub id: Vec<u8>,
    pub transports: Vec<TransportHint>,
}

impl CredentialDescriptor {
    /// Descriptor with no transport hints.
    pub fn new(id: Vec<u8>) -> Self {
        Self {
            id,
            transports: Vec::new(),
        }
    }

    pub fn with_transports(id: Vec<u8>, transports: Vec<TransportHint>) -> Self {
        Self { id, transports }
    }
}

/// User-verification requirement of the relying party.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVerification {
    Required,
    #[default]
    Preferred,
    Discouraged,
}

/// Extension inputs for one device, keyed by extension identifier.
pub type ExtensionMap = BTreeMap<String, Value>;

/// Description of one get-assertion (sign) operation.
///
/// Built once by the caller and read concurrently by every task in the
/// race, so it exposes no mutators.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionRequest {
    rp_id: String,
    client_data_hash: ClientDataHash,
    allow_list: Vec<CredentialDescriptor>,
    user_verification: UserVerification,
    extensions: BTreeMap<DeviceId, ExtensionMap>,
}

impl AssertionRequest {
    pub fn builder(
        rp_id: impl Into<String>,
        client_data_hash: ClientDataHash,
    ) -> AssertionRequestBuilder {
        AssertionRequestBuilder {
            rp_id: rp_id.into(),
            client_data_hash,
            allow_list: Vec::new(),
            user_verification: UserVerification::default(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    /// SHA-256 of the relying-party id; also the legacy application parameter.
    pub fn rp_id_hash(&self) -> [u8; 32] {
        rp_id_hash(&self.rp_id)
    }

    pub fn client_data_hash(&self) -> &ClientDataHash {
        &self.client_data_hash
    }

    pub fn allow_list(&self) -> &[CredentialDescriptor] {
        &self.allow_list
    }

    pub fn user_verification(&self) -> UserVerification {
        self.user_verification
    }

    /// Extension inputs destined for `device`, if any.
    pub fn extensions_for(&self, device: &DeviceId) -> Option<&ExtensionMap> {
        self.extensions.get(device).filter(|m| !m.is_empty())
    }

    /// Whether `credential_id` appears in the allow list.
    pub fn allows(&self, credential_id: &[u8]) -> bool {
        self.allow_list.iter().any(|c| c.id == credential_id)
    }
}

/// Builder for [`AssertionRequest`].
#[derive(Debug, Clone)]
pub struct AssertionRequestBuilder {
    rp_id: String,
    client_data_hash: ClientDataHash,
    allow_list: Vec<CredentialDescriptor>,
    user_verification: UserVerification,
    extensions: BTreeMap<DeviceId, ExtensionMap>,
}

impl AssertionRequestBuilder {
    pub fn allow_credential(mut self, credential: CredentialDescriptor) -> Self {
        self.allow_list.push(credential);
        self
    }

    pub fn allow_credentials(
        mut self,
        credentials: impl IntoIterator<Item = CredentialDescriptor>,
    ) -> Self {
        self.allow_list.extend(credentials);
        self
    }

    pub fn user_verification(mut self, requirement: UserVerification) -> Self {
        self.user_verification = requirement;
        self
    }

    /// Attach an extension input that only `device` will receive.
    pub fn extension(mut self, device: DeviceId, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .entry(device)
            .or_default()
            .insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<AssertionRequest> {
        if self.rp_id.trim().is_empty() {
            return Err(FidoError::InvalidRequest(
                "relying party id must not be empty".into(),
            ));
        }
        if self.allow_list.iter().any(|c| c.id.is_empty()) {
            return Err(FidoError::InvalidRequest(
                "allow list contains an empty credential id".into(),
            ));
        }

        Ok(AssertionRequest {
            rp_id: self.rp_id,
            client_data_hash: self.client_data_hash,
            allow_list: self.allow_list,
            user_verification: self.user_verification,
            extensions: self.extensions,
        })
    }
}

/// SHA-256 of a relying-party id.
pub fn rp_id_hash(rp_id: &str) -> [u8; 32] {
    Sha256::digest(rp_id.as_bytes()).into()
}
