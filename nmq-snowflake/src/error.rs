//! Snowflake error types.

use thiserror::Error;

/// Errors raised while building a generator, minting ids or parsing encoded ids.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnowflakeError {
    #[error("node number must be between 0 and {max}, got {node}")]
    NodeOutOfRange { node: i64, max: i64 },

    #[error("invalid bit layout: node_bits ({node_bits}) + step_bits ({step_bits}) must not exceed {max}")]
    InvalidBitLayout {
        node_bits: u8,
        step_bits: u8,
        max: u8,
    },

    #[error("epoch {epoch_ms} is in the future (now {now_ms})")]
    EpochInFuture { epoch_ms: i64, now_ms: i64 },

    #[error("clock moved backwards: last timestamp {last}, now {now}")]
    ClockMovedBackwards { last: i64, now: i64 },

    #[error("clock did not advance within {waited_ms} ms")]
    ClockStalled { waited_ms: u64 },

    #[error("timestamp {elapsed_ms} ms past the epoch does not fit in {bits} bits")]
    TimestampOverflow { elapsed_ms: i64, bits: u8 },

    #[error("generator halted")]
    Halted,

    #[error("invalid base32 id")]
    InvalidBase32,

    #[error("invalid base58 id")]
    InvalidBase58,

    #[error("invalid base64 id")]
    InvalidBase64,

    #[error("invalid {radix}-radix id: {input:?}")]
    InvalidRadix { radix: u32, input: String },

    #[error("id overflows 64 bits")]
    Overflow,
}

impl SnowflakeError {
    /// Returns whether retrying `generate` may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnowflakeError::ClockMovedBackwards { .. } | SnowflakeError::ClockStalled { .. }
        )
    }
}
