//! Assertion results returned by an authenticator.

use serde::{Deserialize, Serialize};

use crate::error::{FidoError, Result};

/// Serialized length of the fixed authenticator data prefix.
pub const AUTH_DATA_MIN_LEN: usize = 32 + 1 + 4;

/// User present flag bit.
pub const FLAG_USER_PRESENT: u8 = 0x01;
/// User verified flag bit.
pub const FLAG_USER_VERIFIED: u8 = 0x04;

/// Fixed prefix of the authenticator data signed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub counter: u32,
}

impl AuthenticatorData {
    pub fn new(rp_id_hash: [u8; 32], flags: u8, counter: u32) -> Self {
        Self {
            rp_id_hash,
            flags,
            counter,
        }
    }

    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }

    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_USER_VERIFIED != 0
    }

    /// Layout: rp id hash (32) | flags (1) | counter (4, big endian).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(AUTH_DATA_MIN_LEN);
        bytes.extend_from_slice(&self.rp_id_hash);
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.counter.to_be_bytes());
        bytes
    }

    /// Parse the fixed prefix. Trailing extension data is ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < AUTH_DATA_MIN_LEN {
            return Err(FidoError::MalformedResponse(format!(
                "authenticator data too short: {} bytes",
                bytes.len()
            )));
        }

        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&bytes[..32]);
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&bytes[33..37]);

        Ok(Self {
            rp_id_hash,
            flags: bytes[32],
            counter: u32::from_be_bytes(counter),
        })
    }
}

/// User entity returned by devices that hold resident credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntity {
    pub id: Vec<u8>,
    pub name: Option<String>,
}

/// Successful get-assertion result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResponse {
    pub credential_id: Vec<u8>,
    pub auth_data: AuthenticatorData,
    pub signature: Vec<u8>,
    /// Only present for resident-credential responses.
    pub user: Option<UserEntity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_response_serialization() {
        let response = AssertionResponse {
            credential_id: vec![1, 2, 3],
            auth_data: AuthenticatorData::new([0x5A; 32], FLAG_USER_PRESENT, 7),
            signature: vec![0x30, 0x45],
            user: Some(UserEntity {
                id: vec![9],
                name: Some("alice".into()),
            }),
        };

        let json = serde_json::to_string(&response).expect("serialize");
        let parsed: AssertionResponse = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, response);
        assert!(parsed.auth_data.user_present());
    }

    #[test]
    fn test_auth_data_layout() {
        let data = AuthenticatorData::new([0xAB; 32], FLAG_USER_PRESENT, 43);
        let bytes = data.to_bytes();

        assert_eq!(bytes.len(), AUTH_DATA_MIN_LEN);
        assert_eq!(bytes[32], 0x01);
        assert_eq!(&bytes[33..37], &[0, 0, 0, 43]);
        assert_eq!(AuthenticatorData::from_bytes(&bytes).unwrap(), data);
    }

    #[test]
    fn test_auth_data_ignores_extension_bytes() {
        let mut bytes = AuthenticatorData::new([1; 32], 0x05, 7).to_bytes();
        bytes.extend_from_slice(&[0xA0]);

        let parsed = AuthenticatorData::from_bytes(&bytes).unwrap();
        assert!(parsed.user_present());
        assert!(parsed.user_verified());
        assert_eq!(parsed.counter, 7);
    }

    #[test]
    fn test_auth_data_too_short() {
        let result = AuthenticatorData::from_bytes(&[0u8; 36]);
        assert!(matches!(result, Err(FidoError::MalformedResponse(_))));
    }
}
