//! # Radio Error Handling
//!
//! Two error families are kept apart:
//!
//! - [`ConfigError`]: the caller asked for something invalid. Always produced
//!   before any transport write, so the chip state is unchanged.
//! - [`RadioError`]: something went wrong while talking to the chip, or the
//!   session is in the wrong state for the operation.
//!
//! Transport failures ([`HalError`]) are wrapped by `RadioError`.

use crate::radio::hal::HalError;
use crate::radio::modulation::Protocol;
use thiserror::Error;

/// Errors raised by the session and the run-time controllers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RadioError {
    /// The chip did not come up during `begin`. Fatal; no session exists.
    #[error("Radio failed to start: {0}")]
    BeginFailure(String),

    /// A command or register write failed. The session remains usable.
    #[error("Register write failed: {0}")]
    RegisterWriteFailure(#[source] HalError),

    /// A status, register or FIFO read failed.
    #[error("Register read failed: {0}")]
    RegisterReadFailure(#[source] HalError),

    /// Attempted to read past the declared payload length.
    #[error("FIFO underrun: requested {requested} bytes, {remaining} remaining")]
    FifoUnderrun { requested: usize, remaining: usize },

    /// TxDone was not observed before the deadline.
    #[error("TX did not complete within {waited_ms} ms")]
    TxTimeout { waited_ms: u64 },

    /// The session has been ended.
    #[error("Radio session closed")]
    SessionClosed,

    /// An operation needs configuration that has not been applied yet.
    #[error("Not configured: {0}")]
    NotConfigured(&'static str),

    /// `run` was called before `configure`.
    #[error("CAD parameters not configured")]
    CadNotArmed,

    #[error("Payload of {len} bytes exceeds {max} bytes")]
    PayloadTooLong { len: usize, max: usize },

    /// Implicit header / fixed length packets must match the configured length.
    #[error("Payload of {len} bytes does not match configured length {expected}")]
    PayloadLengthMismatch { len: usize, expected: usize },
}

impl RadioError {
    /// Whether the session can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            RadioError::BeginFailure(_) | RadioError::SessionClosed => false,
            RadioError::RegisterWriteFailure(_)
            | RadioError::RegisterReadFailure(_)
            | RadioError::FifoUnderrun { .. }
            | RadioError::TxTimeout { .. }
            | RadioError::NotConfigured(_)
            | RadioError::CadNotArmed
            | RadioError::PayloadTooLong { .. }
            | RadioError::PayloadLengthMismatch { .. } => true,
        }
    }
}

/// Errors raised while validating and applying configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Parameters for one modem applied to a session running the other.
    #[error("Protocol mismatch: session runs {expected}, parameters are for {found}")]
    ProtocolMismatch { expected: Protocol, found: Protocol },

    /// Framing that cannot be received, e.g. implicit header with no length.
    #[error("Invalid packet shape: {0}")]
    InvalidPacketShape(String),

    /// A value outside the range the chip supports.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Radio(#[from] RadioError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(!RadioError::BeginFailure("busy".into()).is_recoverable());
        assert!(!RadioError::SessionClosed.is_recoverable());
        assert!(RadioError::TxTimeout { waited_ms: 5000 }.is_recoverable());
        assert!(RadioError::FifoUnderrun { requested: 1, remaining: 0 }.is_recoverable());
        assert!(RadioError::RegisterWriteFailure(HalError::Spi).is_recoverable());
    }

    #[test]
    fn test_messages() {
        let err = ConfigError::ProtocolMismatch {
            expected: Protocol::LoRa,
            found: Protocol::Fsk,
        };
        assert_eq!(
            err.to_string(),
            "Protocol mismatch: session runs LoRa, parameters are for FSK"
        );

        let err: ConfigError = RadioError::SessionClosed.into();
        assert_eq!(err.to_string(), "Radio session closed");
    }
}
