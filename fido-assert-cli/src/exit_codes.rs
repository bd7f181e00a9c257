//! Exit codes following sysexits.h conventions.
//!
//! Race outcomes get their own codes so scripts can tell "no key holds
//! this credential" apart from "every key failed".

use fido_assert_core::RequestError;

/// Assertion obtained.
pub const SUCCESS: i32 = 0;

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Command line usage error (invalid arguments or device specs).
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// No device holds an allowed credential.
/// Maps to EX_DATAERR from sysexits.h.
pub const NO_ELIGIBLE_DEVICE: i32 = 65;

/// Every device failed.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const ALL_DEVICES_FAILED: i32 = 69;

/// Race deadline exceeded.
/// Maps to EX_TEMPFAIL from sysexits.h.
pub const TIMEOUT: i32 = 75;

/// Cancelled (128 + SIGINT).
pub const CANCELLED: i32 = 130;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        let code = match err.downcast_ref::<RequestError>() {
            Some(RequestError::NoEligibleDevice) => NO_ELIGIBLE_DEVICE,
            Some(RequestError::AllDevicesFailed) => ALL_DEVICES_FAILED,
            Some(RequestError::Timeout) => TIMEOUT,
            Some(RequestError::UserCancelled) => CANCELLED,
            None if message.contains("Invalid device spec")
                || message.contains("Invalid hex")
                || message.contains("Invalid request") =>
            {
                USAGE_ERROR
            }
            None => GENERAL_ERROR,
        };

        Self {
            code,
            message: Some(message),
        }
    }
}
