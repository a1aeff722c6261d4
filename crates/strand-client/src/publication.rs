use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use strand_shm::{LogBufferPartitions, OfferOutcome, PublicationWriter};

use crate::conductor::ClientShared;
use crate::ClientError;

struct PublicationState {
    correlation_id: i64,
    registration_id: i64,
    channel: String,
    stream_id: i32,
    session_id: i32,
    exclusive: bool,
    log_file: PathBuf,
    writer: PublicationWriter,
    closed: AtomicBool,
    client: Weak<ClientShared>,
}

/// A handle for offering messages on a channel and stream.
///
/// Clones share the same log. Shared publications may be offered to from
/// many threads. An exclusive publication must only ever have one thread
/// offering at a time; this is not checked.
#[derive(Clone)]
pub struct Publication {
    state: Arc<PublicationState>,
}

pub(crate) struct PublicationInit {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub channel: String,
    pub stream_id: i32,
    pub session_id: i32,
    pub exclusive: bool,
    pub log_file: PathBuf,
}

impl Publication {
    /// Map the log the driver created.
    pub(crate) fn open(init: PublicationInit, client: Weak<ClientShared>) -> Result<Self, ClientError> {
        let log = LogBufferPartitions::map_file(&init.log_file)?;
        let writer = PublicationWriter::new(Arc::new(log));
        Ok(Self {
            state: Arc::new(PublicationState {
                correlation_id: init.correlation_id,
                registration_id: init.registration_id,
                channel: init.channel,
                stream_id: init.stream_id,
                session_id: init.session_id,
                exclusive: init.exclusive,
                log_file: init.log_file,
                writer,
                closed: AtomicBool::new(false),
                client,
            }),
        })
    }

    /// Correlation id of the command that added this publication.
    pub fn correlation_id(&self) -> i64 {
        self.state.correlation_id
    }

    /// Id the driver gave the publication. Shared publications of one
    /// channel and stream report the same id.
    pub fn registration_id(&self) -> i64 {
        self.state.registration_id
    }

    /// The channel string it was added with.
    pub fn channel(&self) -> &str {
        &self.state.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.state.stream_id
    }

    /// Session id stamped on every frame.
    pub fn session_id(&self) -> i32 {
        self.state.session_id
    }

    /// Whether this publication is the only writer of its log.
    pub fn is_exclusive(&self) -> bool {
        self.state.exclusive
    }

    /// Path of the mapped log buffer.
    pub fn log_file(&self) -> &Path {
        &self.state.log_file
    }

    pub fn initial_term_id(&self) -> i32 {
        self.state.writer.log().initial_term_id()
    }

    pub fn term_length(&self) -> i32 {
        self.state.writer.log().term_length()
    }

    pub fn mtu_length(&self) -> i32 {
        self.state.writer.log().mtu_length()
    }

    /// Largest message [`offer`](Self::offer) accepts.
    pub fn max_message_length(&self) -> usize {
        self.state.writer.max_message_length()
    }

    /// The stream position the next message will be written at.
    pub fn position(&self) -> i64 {
        self.state.writer.position()
    }

    /// Whether the publication, or the client it came from, has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Append one message. `Rotated` and `PartitionNotFree` mean nothing was
    /// written and the offer should be retried.
    pub fn offer(&self, payload: &[u8]) -> Result<OfferOutcome, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(self.state.writer.offer(payload)?)
    }

    /// Release this publication. The driver is told best effort; the log
    /// stays mapped until every clone is dropped.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(client) = self.state.client.upgrade() {
            client.release_publication(self.state.correlation_id, self.state.registration_id);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("registration_id", &self.state.registration_id)
            .field("channel", &self.state.channel)
            .field("stream_id", &self.state.stream_id)
            .field("session_id", &self.state.session_id)
            .field("exclusive", &self.state.exclusive)
            .field("position", &self.position())
            .finish()
    }
}
