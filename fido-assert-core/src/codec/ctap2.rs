//! CTAP2 command frames.
//!
//! Reference: <https://fidoalliance.org/specs/fido-v2.0-ps-20190130/fido-client-to-authenticator-protocol-v2.0-ps-20190130.html#authenticatorGetAssertion>

use ciborium::Value;

use super::{as_bytes, as_text, encode_value, int_map, text_map, MapReader};
use crate::device::{DeviceReply, ModernSignRequest, ResponseCode};
use crate::error::{FidoError, Result};
use crate::request::UserVerification;
use crate::response::{AssertionResponse, AuthenticatorData, UserEntity};

/// authenticatorGetAssertion command byte.
pub const CMD_GET_ASSERTION: u8 = 0x02;
/// authenticatorGetInfo command byte.
pub const CMD_GET_INFO: u8 = 0x04;

pub const STATUS_OK: u8 = 0x00;
pub const ERR_INVALID_COMMAND: u8 = 0x01;
pub const ERR_INVALID_PARAMETER: u8 = 0x02;
pub const ERR_INVALID_LENGTH: u8 = 0x03;
pub const ERR_CBOR_UNEXPECTED_TYPE: u8 = 0x11;
pub const ERR_UNSUPPORTED_EXTENSION: u8 = 0x16;
pub const ERR_INVALID_CREDENTIAL: u8 = 0x22;
pub const ERR_OPERATION_DENIED: u8 = 0x27;
pub const ERR_UNSUPPORTED_OPTION: u8 = 0x2B;
pub const ERR_INVALID_OPTION: u8 = 0x2C;
pub const ERR_NO_CREDENTIALS: u8 = 0x2E;
pub const ERR_USER_ACTION_TIMEOUT: u8 = 0x2F;

/// Classify a CTAP2 status byte.
pub fn status_to_code(status: u8) -> ResponseCode {
    match status {
        STATUS_OK => ResponseCode::Success,
        ERR_INVALID_COMMAND | ERR_INVALID_PARAMETER | ERR_INVALID_LENGTH
        | ERR_CBOR_UNEXPECTED_TYPE => ResponseCode::ProtocolMismatch,
        ERR_UNSUPPORTED_EXTENSION | ERR_UNSUPPORTED_OPTION | ERR_INVALID_OPTION => {
            ResponseCode::UnsupportedOption
        }
        ERR_INVALID_CREDENTIAL | ERR_NO_CREDENTIALS => ResponseCode::InvalidCredential,
        ERR_USER_ACTION_TIMEOUT | ERR_OPERATION_DENIED => ResponseCode::UserActionTimeout,
        _ => ResponseCode::TransportError,
    }
}

/// The single-byte GetInfo probe.
pub fn encode_get_info() -> Vec<u8> {
    vec![CMD_GET_INFO]
}

/// Encode an authenticatorGetAssertion command frame.
pub fn encode_get_assertion(request: &ModernSignRequest) -> Result<Vec<u8>> {
    let allow_list = (!request.allow_list.is_empty()).then(|| {
        Value::Array(
            request
                .allow_list
                .iter()
                .map(|cred| {
                    let mut entries = vec![
                        ("id", Value::Bytes(cred.id.clone())),
                        ("type", Value::Text("public-key".into())),
                    ];
                    if !cred.transports.is_empty() {
                        entries.push((
                            "transports",
                            Value::Array(
                                cred.transports
                                    .iter()
                                    .map(|t| Value::Text(t.as_str().into()))
                                    .collect(),
                            ),
                        ));
                    }
                    text_map(entries)
                })
                .collect(),
        )
    });

    let extensions = request.extensions.as_ref().map(|extensions| {
        Value::Map(
            extensions
                .iter()
                .map(|(k, v)| (Value::Text(k.clone()), v.clone()))
                .collect(),
        )
    });

    let options = match request.user_verification {
        UserVerification::Required => Some(text_map([("uv", Value::Bool(true))])),
        UserVerification::Preferred | UserVerification::Discouraged => None,
    };

    let map = int_map([
        (1, Some(Value::Text(request.rp_id.clone()))),
        (
            2,
            Some(Value::Bytes(request.client_data_hash.as_bytes().to_vec())),
        ),
        (3, allow_list),
        (4, extensions),
        (5, options),
    ]);

    let mut frame = vec![CMD_GET_ASSERTION];
    frame.extend(encode_value(&map)?);
    Ok(frame)
}

/// Decode an authenticatorGetAssertion response frame.
///
/// A non-zero status becomes a failure reply. A zero status with no
/// payload becomes a success reply without an assertion, which the
/// executor rejects.
///
/// Authenticators may omit the credential member when the request named
/// exactly one credential; `implied_credential` is that credential id.
pub fn decode_get_assertion(
    frame: &[u8],
    implied_credential: Option<&[u8]>,
) -> Result<DeviceReply> {
    let (&status, payload) = frame
        .split_first()
        .ok_or_else(|| FidoError::MalformedResponse("empty CTAP2 response".into()))?;

    let code = status_to_code(status);
    if code != ResponseCode::Success {
        return Ok(DeviceReply::failure(code));
    }
    if payload.is_empty() {
        return Ok(DeviceReply::failure(ResponseCode::Success));
    }

    let map = MapReader::from_bytes(payload)?;

    let credential_id = match map.int(1) {
        Some(value) => {
            let credential = MapReader::from_value(value.clone())?;
            as_bytes(
                credential
                    .text("id")
                    .ok_or_else(|| FidoError::MalformedResponse("credential without id".into()))?,
                "credential.id",
            )?
        }
        None => implied_credential.map(<[u8]>::to_vec).ok_or_else(|| {
            FidoError::MalformedResponse(
                "credential omitted without a single allowed credential".into(),
            )
        })?,
    };

    let auth_data = AuthenticatorData::from_bytes(&as_bytes(map.required_int(2)?, "authData")?)?;
    let signature = as_bytes(map.required_int(3)?, "signature")?;

    let user = match map.int(4) {
        Some(value) => {
            let user = MapReader::from_value(value.clone())?;
            let id = as_bytes(
                user.text("id")
                    .ok_or_else(|| FidoError::MalformedResponse("user without id".into()))?,
                "user.id",
            )?;
            let name = user.text("name").map(|v| as_text(v, "user.name")).transpose()?;
            Some(UserEntity { id, name })
        }
        None => None,
    };

    Ok(DeviceReply::success(AssertionResponse {
        credential_id,
        auth_data,
        signature,
        user,
    }))
}

/// Encode a success response frame, as an authenticator would.
pub fn encode_get_assertion_response(response: &AssertionResponse) -> Result<Vec<u8>> {
    let user = response.user.as_ref().map(|user| {
        let mut entries = vec![("id", Value::Bytes(user.id.clone()))];
        if let Some(name) = &user.name {
            entries.push(("name", Value::Text(name.clone())));
        }
        text_map(entries)
    });

    let map = int_map([
        (
            1,
            Some(text_map([
                ("id", Value::Bytes(response.credential_id.clone())),
                ("type", Value::Text("public-key".into())),
            ])),
        ),
        (2, Some(Value::Bytes(response.auth_data.to_bytes()))),
        (3, Some(Value::Bytes(response.signature.clone()))),
        (4, user),
    ]);

    let mut frame = vec![STATUS_OK];
    frame.extend(encode_value(&map)?);
    Ok(frame)
}
