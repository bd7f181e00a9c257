//! Common utility functions shared across CLI commands.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use fido_assert_core::{
    AssertionRequest, ClientDataHash, CredentialDescriptor, UserVerification,
};

use crate::{RequestArgs, UvArg};

/// Decode a hex argument, naming the flag it came from on failure.
pub fn decode_hex(flag: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim()).with_context(|| format!("Invalid hex for {flag}: '{value}'"))
}

/// Build the sign request from the shared command line arguments.
pub fn build_request(args: &RequestArgs) -> Result<AssertionRequest> {
    let client_data_hash = match &args.client_data_hash {
        Some(value) => {
            let bytes = decode_hex("--client-data-hash", value)?;
            if bytes.len() != 32 {
                bail!(
                    "Invalid hex for --client-data-hash: expected 32 bytes, got {}",
                    bytes.len()
                );
            }
            ClientDataHash::from_slice(&bytes)?
        }
        None => ClientDataHash::new([0u8; 32]),
    };

    let credentials = args
        .credentials
        .iter()
        .map(|c| decode_hex("--credential", c).map(CredentialDescriptor::new))
        .collect::<Result<Vec<_>>>()?;

    let user_verification = match args.uv {
        UvArg::Required => UserVerification::Required,
        UvArg::Preferred => UserVerification::Preferred,
        UvArg::Discouraged => UserVerification::Discouraged,
    };

    AssertionRequest::builder(args.rp_id.as_str(), client_data_hash)
        .allow_credentials(credentials)
        .user_verification(user_verification)
        .build()
        .context("Invalid request")
}

/// Base64url without padding, the encoding WebAuthn uses for binary fields.
pub fn b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}
