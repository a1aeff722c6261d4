use std::io;
use std::path::PathBuf;

use strand_shm::{CncError, LogBufferError};
use thiserror::Error;

use crate::ChannelUriError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Channel(#[from] ChannelUriError),

    #[error(transparent)]
    Log(#[from] LogBufferError),

    #[error(transparent)]
    Cnc(#[from] CncError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("join parameters are only accepted for exclusive publications")]
    JoinRequiresExclusive,
}
