use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a [`TransportSink`](crate::transport::TransportSink) or transport stream.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("transport closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Determine if the failed operation may succeed if retried on the same transport.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// All errors generated by the forward channel.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    ChannelClosed,

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("backpressure sustained for {waited_ms}ms without the receiver draining")]
    BackpressureExceeded { waited_ms: u64 },

    #[error("failed to encode or decode channel frame: {0}")]
    Codec(String),

    #[error("peer did not acknowledge close within the configured timeout")]
    CloseTimeout,

    #[error("reorder buffer overflowed waiting for frame {expected} with {held} frames held")]
    ReorderOverflow { expected: u64, held: usize },
}

impl ChannelError {
    /// Determine if an error leaves the process without a usable channel.
    ///
    /// Terminal errors are the only channel failures allowed to take the process down: a
    /// permanently broken transport, a buffer that stayed full past the backpressure limit,
    /// and a gap in the inbound sequence that never closed.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            ChannelError::Transport(error) => !error.is_transient(),
            ChannelError::BackpressureExceeded { .. } => true,
            ChannelError::ReorderOverflow { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_is_terminal() {
        struct TestCase {
            input: ChannelError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: is not terminal w/ ChannelError::ChannelClosed
                input: ChannelError::ChannelClosed,
                expected: false,
            },
            TestCase {
                // TC1: is not terminal w/ transient transport failure
                input: ChannelError::from(TransportError::Transient("would block".to_string())),
                expected: false,
            },
            TestCase {
                // TC2: is terminal w/ closed transport
                input: ChannelError::from(TransportError::Closed("socket reset".to_string())),
                expected: true,
            },
            TestCase {
                // TC3: is terminal w/ sustained backpressure
                input: ChannelError::BackpressureExceeded { waited_ms: 30_000 },
                expected: true,
            },
            TestCase {
                // TC4: is not terminal w/ codec failure
                input: ChannelError::Codec("expected value at line 1".to_string()),
                expected: false,
            },
            TestCase {
                // TC5: is not terminal w/ close timeout
                input: ChannelError::CloseTimeout,
                expected: false,
            },
            TestCase {
                // TC6: is terminal w/ reorder buffer overflow
                input: ChannelError::ReorderOverflow {
                    expected: 1,
                    held: 3,
                },
                expected: true,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_terminal();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
