//! Closed error taxonomy shared by every public operation on [`crate::session::Session`].
//!
//! Modeled on the reference wallet's layered `thiserror` enums
//! (`wallet_common::account::errors::Error`, `wallet_common::jwt::JwtError`):
//! a flat enum with `#[error(...)]` messages and `#[from]` conversions from
//! lower-layer failures, rather than a generic `anyhow`-style catch-all.

use std::error::Error as StdError;

/// The three kinds of failure a `Session` operation can report.
///
/// `WrongState` and `WrongParam` never mutate session state. `Encryption`
/// resets an in-progress activation back to `Empty`, but leaves an already
/// `Activated` session untouched (the caller must discard partial output).
#[derive(Debug, thiserror::Error)]
pub enum PowerAuthError {
    /// Operation invalid for the current state machine state.
    #[error("wrong state: {0}")]
    WrongState(String),

    /// Missing or malformed input.
    #[error("wrong parameter: {0}")]
    WrongParam(String),

    /// Cryptographic failure: bad padding, MAC mismatch, PRNG failure, ECDH
    /// failure, CRC mismatch (treated as tamper), invalid Base64 in a
    /// security-sensitive path, and similar.
    #[error("cryptographic failure: {0}")]
    Encryption(String),
}

pub type Result<T> = std::result::Result<T, PowerAuthError>;

impl PowerAuthError {
    pub fn wrong_state(msg: impl Into<String>) -> Self {
        Self::WrongState(msg.into())
    }

    pub fn wrong_param(msg: impl Into<String>) -> Self {
        Self::WrongParam(msg.into())
    }

    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }
}

/// Internal invariant violation. Aborts via `debug_assert!` in debug builds;
/// in release, the violated invariant is reported as `WrongParam` instead
/// of panicking.
pub fn invariant(condition: bool, msg: &str) -> Result<()> {
    debug_assert!(condition, "{msg}");
    if condition {
        Ok(())
    } else {
        Err(PowerAuthError::wrong_param(format!("invariant violated: {msg}")))
    }
}

pub(crate) fn map_dyn_err(context: &str, err: impl StdError) -> PowerAuthError {
    PowerAuthError::Encryption(format!("{context}: {err}"))
}
