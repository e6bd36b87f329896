use derive_more::Display;
use num_derive::{FromPrimitive, ToPrimitive};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Display)]
pub enum EngineError {
    #[display("configuration error: {_0}")]
    Config(String),
    #[display("dispatch run lock is held by another invocation")]
    RunLockBusy,
    #[display("{_0}")]
    Internal(anyhow::Error),
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(error: anyhow::Error) -> Self {
        EngineError::Internal(error)
    }
}

/// Batch-fatal conditions. The numeric discriminator travels with the
/// unwound batch and is what the completion logic switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive, ToPrimitive)]
pub enum BatchSignal {
    /// Campaign left `processing`/`sending` under our feet.
    StatusChanged = 1,
    /// Every candidate delivery server is excluded or over quota.
    NoServerAvailable = 2,
    /// A lock required for sending could not be taken in time.
    LockUnavailable = 3,
    /// The delivery server itself is unusable, not just one send.
    TransportUnreachable = 4,
    /// Collaborator store failed mid-batch.
    StorageFailed = 5,
    /// Customer ran out of quota mid-batch (sequential mode safety net).
    QuotaReached = 6,
}

/// Typed signal that unwinds a subscriber batch.
#[derive(Debug, Display)]
#[display("batch aborted ({signal}): {message}")]
pub struct BatchAbort {
    pub signal: BatchSignal,
    pub message: String,
}

impl std::error::Error for BatchAbort {}

impl BatchAbort {
    pub fn new(signal: BatchSignal, message: impl Into<String>) -> Self {
        Self {
            signal,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        num_traits::ToPrimitive::to_i32(&self.signal).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_signal_codes_round_trip() {
        for signal in [
            BatchSignal::StatusChanged,
            BatchSignal::NoServerAvailable,
            BatchSignal::LockUnavailable,
            BatchSignal::TransportUnreachable,
            BatchSignal::StorageFailed,
            BatchSignal::QuotaReached,
        ] {
            let code = BatchAbort::new(signal, "x").code();
            assert_eq!(BatchSignal::from_i32(code), Some(signal));
        }
    }

    #[test]
    fn test_abort_display_carries_signal() {
        let abort = BatchAbort::new(BatchSignal::NoServerAvailable, "pool exhausted");
        let text = abort.to_string();
        assert!(text.contains("NoServerAvailable"));
        assert!(text.contains("pool exhausted"));
    }
}
