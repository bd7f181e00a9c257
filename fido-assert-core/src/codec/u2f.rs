//! U2F (CTAP1) raw-message APDUs.
//!
//! Requests use the extended-length encoding:
//! `CLA INS P1 P2 | 00 Lc_hi Lc_lo | data | Le_hi Le_lo`.
//! Responses end with a two-byte status word.

use crate::device::ResponseCode;
use crate::error::{FidoError, Result};

pub const INS_REGISTER: u8 = 0x01;
pub const INS_AUTHENTICATE: u8 = 0x02;

/// Check whether the key handle belongs to this device; never signs.
pub const P1_CHECK_ONLY: u8 = 0x07;
/// Require a touch and sign.
pub const P1_ENFORCE_PRESENCE: u8 = 0x03;

pub const SW_NO_ERROR: u16 = 0x9000;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_WRONG_DATA: u16 = 0x6A80;
pub const SW_WRONG_LENGTH: u16 = 0x6700;
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
pub const SW_CLA_NOT_SUPPORTED: u16 = 0x6E00;

/// Application parameter of the throwaway registration used to collect a
/// touch when there is nothing to sign with.
pub const PRESENCE_APPLICATION: [u8; 32] = [0x41; 32];
/// Challenge parameter of the throwaway registration.
pub const PRESENCE_CHALLENGE: [u8; 32] = [0x42; 32];

/// Longest key handle the one-byte length field can carry.
pub const MAX_KEY_HANDLE_LEN: usize = u8::MAX as usize;

fn encode_apdu(ins: u8, p1: u8, data: &[u8]) -> Result<Vec<u8>> {
    let lc = u16::try_from(data.len())
        .map_err(|_| FidoError::EncodingError(format!("APDU body too long: {}", data.len())))?;

    let mut apdu = Vec::with_capacity(data.len() + 9);
    apdu.extend_from_slice(&[0x00, ins, p1, 0x00, 0x00]);
    apdu.extend_from_slice(&lc.to_be_bytes());
    apdu.extend_from_slice(data);
    apdu.extend_from_slice(&[0x00, 0x00]);
    Ok(apdu)
}

/// Encode an authenticate (sign) request for one key handle.
pub fn encode_authenticate(
    application: &[u8; 32],
    challenge: &[u8; 32],
    key_handle: &[u8],
    check_only: bool,
) -> Result<Vec<u8>> {
    let handle_len = u8::try_from(key_handle.len()).map_err(|_| {
        FidoError::EncodingError(format!("key handle too long: {} bytes", key_handle.len()))
    })?;

    let mut data = Vec::with_capacity(65 + key_handle.len());
    data.extend_from_slice(challenge);
    data.extend_from_slice(application);
    data.push(handle_len);
    data.extend_from_slice(key_handle);

    let p1 = if check_only {
        P1_CHECK_ONLY
    } else {
        P1_ENFORCE_PRESENCE
    };
    encode_apdu(INS_AUTHENTICATE, p1, &data)
}

/// Encode the throwaway registration that only collects a touch.
pub fn encode_presence_check() -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(&PRESENCE_CHALLENGE);
    data.extend_from_slice(&PRESENCE_APPLICATION);
    encode_apdu(INS_REGISTER, 0x00, &data)
}

/// Split a response APDU into its status word and body.
pub fn split_status(frame: &[u8]) -> Result<(u16, &[u8])> {
    if frame.len() < 2 {
        return Err(FidoError::MalformedResponse(format!(
            "APDU response too short: {} bytes",
            frame.len()
        )));
    }
    let (body, sw) = frame.split_at(frame.len() - 2);
    Ok((u16::from_be_bytes([sw[0], sw[1]]), body))
}

/// Signed authenticate response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub flags: u8,
    pub counter: u32,
    pub signature: Vec<u8>,
}

/// Decode the body of a successful authenticate response.
pub fn decode_authenticate(body: &[u8]) -> Result<AuthenticateResponse> {
    if body.len() < 6 {
        return Err(FidoError::MalformedResponse(format!(
            "authenticate response too short: {} bytes",
            body.len()
        )));
    }
    Ok(AuthenticateResponse {
        flags: body[0],
        counter: u32::from_be_bytes([body[1], body[2], body[3], body[4]]),
        signature: body[5..].to_vec(),
    })
}

/// Encode a successful authenticate response, as a device would.
pub fn encode_authenticate_response(response: &AuthenticateResponse) -> Vec<u8> {
    let mut frame = Vec::with_capacity(response.signature.len() + 7);
    frame.push(response.flags);
    frame.extend_from_slice(&response.counter.to_be_bytes());
    frame.extend_from_slice(&response.signature);
    frame.extend_from_slice(&SW_NO_ERROR.to_be_bytes());
    frame
}

/// Classify a status word that ended an exchange.
pub fn status_to_code(sw: u16) -> ResponseCode {
    match sw {
        SW_NO_ERROR => ResponseCode::Success,
        SW_WRONG_DATA => ResponseCode::InvalidCredential,
        SW_CONDITIONS_NOT_SATISFIED => ResponseCode::UserActionTimeout,
        SW_INS_NOT_SUPPORTED | SW_CLA_NOT_SUPPORTED | SW_WRONG_LENGTH => {
            ResponseCode::ProtocolMismatch
        }
        _ => ResponseCode::TransportError,
    }
}
