//! The command-and-control file shared by a driver and its clients.
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬───────────────────────┐
//! │ header (128 B)   │ to-driver ring       │ to-clients ring       │
//! └──────────────────┴──────────────────────┴───────────────────────┘
//! ```
//!
//! Header fields: version (i32 @0), to-driver ring length (i32 @4),
//! to-clients ring length (i32 @8), client liveness timeout in ns
//! (i64 @16), driver pid (i64 @24).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strand_core::AtomicBuffer;
use thiserror::Error;

use crate::ring::{ring_length, CommandRing, RingError};
use crate::{MapError, MappedRegion};

/// File name of the cnc file inside the driver directory.
pub const CNC_FILE: &str = "cnc.dat";
/// Layout version written by the driver and checked by clients.
pub const CNC_VERSION: i32 = 1;
pub const CNC_HEADER_LENGTH: usize = 128;

const VERSION_OFFSET: usize = 0;
const TO_DRIVER_LENGTH_OFFSET: usize = 4;
const TO_CLIENTS_LENGTH_OFFSET: usize = 8;
const CLIENT_LIVENESS_TIMEOUT_OFFSET: usize = 16;
const DRIVER_PID_OFFSET: usize = 24;

#[derive(Error, Debug)]
pub enum CncError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("cnc file version {actual}, expected {expected}")]
    VersionMismatch { expected: i32, actual: i32 },

    #[error("cnc file {path} is {actual} bytes, header describes {expected}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
}

/// Sizes and timeouts written into a new cnc file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CncConfig {
    /// Record capacity of the to-driver ring; a power of two.
    pub to_driver_capacity: usize,
    /// Record capacity of the to-clients ring; a power of two.
    pub to_clients_capacity: usize,
    pub client_liveness_timeout: Duration,
}

impl Default for CncConfig {
    fn default() -> Self {
        Self {
            to_driver_capacity: 1024 * 1024,
            to_clients_capacity: 1024 * 1024,
            client_liveness_timeout: Duration::from_secs(10),
        }
    }
}

/// Path of the cnc file inside `dir`.
pub fn cnc_path(dir: &Path) -> PathBuf {
    dir.join(CNC_FILE)
}

/// A mapped cnc file.
#[derive(Debug, Clone)]
pub struct CncFile {
    buffer: AtomicBuffer,
    to_driver: CommandRing,
    to_clients: CommandRing,
}

impl CncFile {
    /// Create `dir/cnc.dat`. Used by the driver.
    pub fn create(dir: &Path, config: &CncConfig) -> Result<Self, CncError> {
        let to_driver_length = ring_length(config.to_driver_capacity);
        let to_clients_length = ring_length(config.to_clients_capacity);
        if !config.to_driver_capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(config.to_driver_capacity).into());
        }
        if !config.to_clients_capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(config.to_clients_capacity).into());
        }

        let path = cnc_path(dir);
        let length = CNC_HEADER_LENGTH + to_driver_length + to_clients_length;
        let buffer = AtomicBuffer::new(Arc::new(MappedRegion::create(&path, length)?));

        buffer.put_i32(TO_DRIVER_LENGTH_OFFSET, to_driver_length as i32);
        buffer.put_i32(TO_CLIENTS_LENGTH_OFFSET, to_clients_length as i32);
        buffer.put_i64(
            CLIENT_LIVENESS_TIMEOUT_OFFSET,
            config.client_liveness_timeout.as_nanos() as i64,
        );
        buffer.put_i64(DRIVER_PID_OFFSET, i64::from(std::process::id()));
        buffer.put_i32_ordered(VERSION_OFFSET, CNC_VERSION);

        tracing::debug!("created {} ({} bytes)", path.display(), length);
        Self::wrap(buffer, &path)
    }

    /// Map an existing `dir/cnc.dat`. Used by clients.
    pub fn open(dir: &Path) -> Result<Self, CncError> {
        let path = cnc_path(dir);
        let buffer = AtomicBuffer::new(Arc::new(MappedRegion::open(&path)?));
        let version = buffer.get_i32_volatile(VERSION_OFFSET);
        if version != CNC_VERSION {
            return Err(CncError::VersionMismatch {
                expected: CNC_VERSION,
                actual: version,
            });
        }
        Self::wrap(buffer, &path)
    }

    fn wrap(buffer: AtomicBuffer, path: &Path) -> Result<Self, CncError> {
        if buffer.capacity() < CNC_HEADER_LENGTH {
            return Err(CncError::Truncated {
                path: path.to_path_buf(),
                expected: CNC_HEADER_LENGTH,
                actual: buffer.capacity(),
            });
        }
        let to_driver_length = buffer.get_i32(TO_DRIVER_LENGTH_OFFSET).max(0) as usize;
        let to_clients_length = buffer.get_i32(TO_CLIENTS_LENGTH_OFFSET).max(0) as usize;
        let expected = CNC_HEADER_LENGTH + to_driver_length + to_clients_length;
        if buffer.capacity() < expected {
            return Err(CncError::Truncated {
                path: path.to_path_buf(),
                expected,
                actual: buffer.capacity(),
            });
        }

        let to_driver = CommandRing::new(buffer.view(CNC_HEADER_LENGTH, to_driver_length))?;
        let to_clients = CommandRing::new(buffer.view(CNC_HEADER_LENGTH + to_driver_length, to_clients_length))?;
        Ok(Self {
            buffer,
            to_driver,
            to_clients,
        })
    }

    /// Commands from clients to the driver. Many writers, one reader.
    pub fn to_driver(&self) -> &CommandRing {
        &self.to_driver
    }

    /// Responses and notifications from the driver to clients.
    pub fn to_clients(&self) -> &CommandRing {
        &self.to_clients
    }

    /// How long the driver waits for a keepalive before dropping a client.
    pub fn client_liveness_timeout(&self) -> Duration {
        Duration::from_nanos(self.buffer.get_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET).max(0) as u64)
    }

    /// Process id of the driver that created the file.
    pub fn driver_pid(&self) -> i64 {
        self.buffer.get_i64(DRIVER_PID_OFFSET)
    }
}
