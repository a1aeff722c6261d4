use std::time::Duration;

use strand_core::{CodecError, ErrorCode};
use strand_shm::{CncError, LogBufferError, RingError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Cnc(#[from] CncError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Log(#[from] LogBufferError),

    #[error("malformed driver response: {0}")]
    Codec(#[from] CodecError),

    /// The to-driver ring had no room; the command was not sent.
    #[error("to-driver ring is full")]
    CommandRingFull,

    #[error("no response from driver to command {correlation_id} within {timeout:?}")]
    DriverTimeout { correlation_id: i64, timeout: Duration },

    #[error("driver heartbeat is {age_ms} ms old")]
    DriverInactive { age_ms: i64 },

    #[error("driver rejected command {correlation_id} ({code:?}): {message}")]
    Registration {
        correlation_id: i64,
        code: ErrorCode,
        message: String,
    },

    #[error("driver timed out client {0}")]
    ClientTimedOut(i64),

    #[error("no command with correlation id {0}")]
    UnknownCorrelation(i64),

    #[error("correlation id {0} belongs to a different kind of resource")]
    WrongResourceKind(i64),

    #[error("client is closed")]
    Closed,

    #[error("cannot start conductor thread: {0}")]
    ConductorThread(#[source] std::io::Error),
}
