use strand_core::PositionError;
use thiserror::Error;

use crate::MapError;

/// Errors building or writing a log buffer.
#[derive(Error, Debug)]
pub enum LogBufferError {
    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("log buffer is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid MTU {mtu_length} for term length {term_length}")]
    InvalidMtu { mtu_length: i32, term_length: i32 },

    #[error("message of {length} bytes exceeds maximum of {max}")]
    MessageTooLong { length: usize, max: usize },

    #[error("cannot claim {length} bytes in a term of {term_length}")]
    InvalidClaimLength { length: i32, term_length: i32 },

    #[error("all {0} consumer slots are taken")]
    NoConsumerSlot(usize),

    #[error("join does not match log: {0}")]
    JoinMismatch(&'static str),
}
