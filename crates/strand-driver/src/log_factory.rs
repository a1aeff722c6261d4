//! Creating and removing publication log files.

use std::io;
use std::path::{Path, PathBuf};

use strand_shm::{ExclusivePublicationJoin, LogBufferPartitions, LogParams};

use crate::{ChannelUri, DriverError};

/// Subdirectory of the driver directory holding publication logs.
pub const PUBLICATIONS_DIR: &str = "publications";
pub const LOG_FILE_SUFFIX: &str = "logbuffer";

/// Log settings used when a channel does not carry its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDefaults {
    pub term_length: i32,
    pub mtu_length: i32,
}

impl Default for LogDefaults {
    fn default() -> Self {
        Self {
            term_length: 16 * 1024 * 1024,
            mtu_length: 1408,
        }
    }
}

/// What identifies a new publication log.
#[derive(Debug, Clone, Copy)]
pub struct LogRequest<'a> {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: &'a ChannelUri,
    pub exclusive: bool,
}

#[derive(Debug)]
pub struct CreatedLog {
    pub path: PathBuf,
    pub log: LogBufferPartitions,
    /// Where the first message will be written.
    pub position: i64,
}

#[derive(Debug, Clone)]
pub struct LogFactory {
    dir: PathBuf,
    defaults: LogDefaults,
}

impl LogFactory {
    pub fn new(dir: &Path, defaults: LogDefaults) -> Self {
        Self {
            dir: dir.join(PUBLICATIONS_DIR),
            defaults,
        }
    }

    /// Where the log for publication `registration_id` lives.
    pub fn log_path(&self, registration_id: i64) -> PathBuf {
        self.dir.join(format!("{registration_id}.{LOG_FILE_SUFFIX}"))
    }

    /// Create and initialise the log file for a publication, starting it at
    /// the channel's join point if it has one.
    pub fn create(&self, request: &LogRequest<'_>) -> Result<CreatedLog, DriverError> {
        let channel = request.channel;
        let term_length = channel.term_length()?.unwrap_or(self.defaults.term_length);
        let mtu_length = channel.mtu_length()?.unwrap_or(self.defaults.mtu_length);
        let join_params = channel.join_params()?;
        if join_params.is_some() && !request.exclusive {
            return Err(DriverError::JoinRequiresExclusive);
        }

        // Validate the join before anything touches the filesystem.
        let join = join_params
            .map(|p| ExclusivePublicationJoin::new(p.initial_term_id, p.term_id, p.term_offset, term_length, mtu_length))
            .transpose()?;

        let params = LogParams {
            term_length,
            mtu_length,
            initial_term_id: join.map_or(0, |j| j.initial_term_id()),
            session_id: request.session_id,
            stream_id: request.stream_id,
            registration_id: request.registration_id,
        };
        params.validate()?;

        let path = self.log_path(request.registration_id);
        let log = LogBufferPartitions::create_file(&path, &params)?;
        let position = match join {
            Some(join) => join.apply(&log)?.position,
            None => 0,
        };

        tracing::debug!(
            "created log {} (term length {}, mtu {}, position {})",
            path.display(),
            term_length,
            mtu_length,
            position
        );
        Ok(CreatedLog { path, log, position })
    }

    /// Delete a publication's log file. Clients that still map it keep
    /// their mapping.
    pub fn remove(&self, registration_id: i64) -> Result<(), DriverError> {
        let path = self.log_path(registration_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DriverError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use strand_core::TERM_MIN_LENGTH;
    use strand_shm::LogBufferError;

    use super::*;

    fn factory(dir: &Path) -> LogFactory {
        LogFactory::new(
            dir,
            LogDefaults {
                term_length: TERM_MIN_LENGTH,
                mtu_length: 1408,
            },
        )
    }

    fn request(channel: &ChannelUri, exclusive: bool) -> LogRequest<'_> {
        LogRequest {
            registration_id: 1001,
            session_id: 5,
            stream_id: 7,
            channel,
            exclusive,
        }
    }

    #[test]
    fn test_create_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let channel = ChannelUri::parse("strand:ipc").unwrap();

        let created = factory.create(&request(&channel, false)).unwrap();
        assert_eq!(created.path, dir.path().join("publications").join("1001.logbuffer"));
        assert_eq!(created.position, 0);
        assert_eq!(created.log.term_length(), TERM_MIN_LENGTH);
        assert_eq!(created.log.metadata().session_id(), 5);

        let mapped = LogBufferPartitions::map_file(&created.path).unwrap();
        assert_eq!(mapped.metadata().stream_id(), 7);

        factory.remove(1001).unwrap();
        assert!(!created.path.exists());
        factory.remove(1001).unwrap();
    }

    #[test]
    fn test_create_at_join_point() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let channel =
            ChannelUri::parse("strand:ipc?term-length=128k|init-term-id=10|term-id=12|term-offset=1024").unwrap();

        let created = factory.create(&request(&channel, true)).unwrap();
        assert_eq!(created.log.term_length(), 128 * 1024);
        assert_eq!(created.position, 2 * 128 * 1024 + 1024);
        assert_eq!(created.log.producer_position(), created.position);
    }

    #[test]
    fn test_join_needs_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ChannelUri::parse("strand:ipc?init-term-id=0|term-id=0|term-offset=0").unwrap();
        assert!(matches!(
            factory(dir.path()).create(&request(&channel, false)),
            Err(DriverError::JoinRequiresExclusive)
        ));
    }

    #[test]
    fn test_bad_join_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let channel = ChannelUri::parse("strand:ipc?init-term-id=10|term-id=9|term-offset=0").unwrap();
        assert!(matches!(
            factory.create(&request(&channel, true)),
            Err(DriverError::Log(LogBufferError::Position(_)))
        ));
        assert!(!factory.log_path(1001).exists());
    }
}
