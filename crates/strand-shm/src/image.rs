//! A subscriber's view of one publication's log.

use std::sync::Arc;

use strand_core::FrameHeader;

use crate::log_buffer::ConsumerSlot;
use crate::term_reader;
use crate::{LogBufferError, LogBufferPartitions};

/// Reads frames from a log and reports progress through a consumer slot,
/// which keeps the producer from reusing partitions still being read.
#[derive(Debug)]
pub struct Image {
    log: Arc<LogBufferPartitions>,
    slot: ConsumerSlot,
    position: i64,
    correlation_id: i64,
}

impl Image {
    /// Register a consumer at `join_position` and start reading from there.
    pub fn new(log: Arc<LogBufferPartitions>, join_position: i64, correlation_id: i64) -> Result<Self, LogBufferError> {
        let slot = log.register_consumer(join_position)?;
        Ok(Self {
            log,
            slot,
            position: join_position,
            correlation_id,
        })
    }

    /// Join at whatever the producer has reached so far.
    pub fn at_producer_position(log: Arc<LogBufferPartitions>, correlation_id: i64) -> Result<Self, LogBufferError> {
        let position = log.producer_position();
        Self::new(log, position, correlation_id)
    }

    /// Position of the next byte to be read.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Correlation id the driver gave this image.
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn session_id(&self) -> i32 {
        self.log.metadata().session_id()
    }

    pub fn stream_id(&self) -> i32 {
        self.log.metadata().stream_id()
    }

    /// The log being read.
    pub fn log(&self) -> &Arc<LogBufferPartitions> {
        &self.log
    }

    /// Deliver up to `fragment_limit` fragments to `handler`.
    pub fn poll<F>(&mut self, handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], &FrameHeader),
    {
        let codec = *self.log.codec();
        let index = codec.partition_for_position(self.position);
        let term_offset = codec.term_offset_for(self.position);
        let term_id = codec.term_id_for(self.position);

        let outcome = term_reader::read(
            self.log.term_buffer(index),
            term_offset,
            term_id,
            fragment_limit,
            handler,
        );

        if outcome.offset > term_offset {
            self.position += i64::from(outcome.offset - term_offset);
            self.log.update_consumer(self.slot, self.position);
        }
        outcome.fragments_read
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.log.release_consumer(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use strand_core::{AtomicBuffer, TERM_MIN_LENGTH};

    use super::*;
    use crate::layout::{compute_log_length, LogParams};
    use crate::writer::{OfferOutcome, PublicationWriter};

    fn writer() -> PublicationWriter {
        let params = LogParams {
            term_length: TERM_MIN_LENGTH,
            mtu_length: 4096,
            initial_term_id: 3,
            session_id: 9,
            stream_id: 7,
            registration_id: 1001,
        };
        let log = LogBufferPartitions::create(AtomicBuffer::allocate(compute_log_length(TERM_MIN_LENGTH)), &params)
            .unwrap();
        PublicationWriter::new(Arc::new(log))
    }

    fn offer(writer: &PublicationWriter, payload: &[u8]) {
        loop {
            match writer.offer(payload).unwrap() {
                OfferOutcome::Published { .. } => return,
                OfferOutcome::Rotated => continue,
                OfferOutcome::PartitionNotFree => panic!("consumer fell behind"),
            }
        }
    }

    #[test]
    fn test_poll_tracks_position() {
        let writer = writer();
        let mut image = Image::at_producer_position(writer.log().clone(), 42).unwrap();
        offer(&writer, b"first");
        offer(&writer, b"second");

        let mut seen = Vec::new();
        let read = image.poll(|payload, _| seen.push(payload.to_vec()), 10);
        assert_eq!(read, 2);
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(image.position(), writer.position());
        assert_eq!(writer.log().min_consumer_position(), Some(image.position()));
        assert_eq!(image.stream_id(), 7);
    }

    #[test]
    fn test_poll_follows_rotation() {
        let writer = writer();
        let mut image = Image::at_producer_position(writer.log().clone(), 1).unwrap();
        let payload = [5u8; 4000];

        let mut received = 0;
        for _ in 0..100 {
            offer(&writer, &payload);
            // Padding at the end of a term is consumed by a poll that
            // delivers nothing, so keep polling until caught up.
            while image.position() < writer.position() {
                received += image.poll(|p, _| assert_eq!(p.len(), 4000), 10);
            }
        }
        assert!(writer.log().active_term_count() > 3);
        assert_eq!(received, 100);
    }

    #[test]
    fn test_drop_releases_slot() {
        let writer = writer();
        let image = Image::new(writer.log().clone(), 0, 1).unwrap();
        assert_eq!(writer.log().min_consumer_position(), Some(0));
        drop(image);
        assert_eq!(writer.log().min_consumer_position(), None);
    }
}
