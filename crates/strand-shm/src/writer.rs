//! Appending whole messages to a log buffer.

use std::sync::Arc;

use strand_core::frame::{max_message_length, max_payload_length};
use strand_core::position::{active_partition_index, term_count_for};
use strand_core::{HeaderTemplate, PARTITION_COUNT};

use crate::log_buffer::{ClaimOutcome, RotateOutcome};
use crate::term_appender::{append_message, append_padding, framed_length};
use crate::{LogBufferError, LogBufferPartitions};

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The message is committed; `position` is just past its last frame.
    Published { position: i64 },
    /// The term filled up and the log moved to the next one. Offer again.
    Rotated,
    /// A consumer is too far behind for the log to move on. Offer again
    /// once it catches up.
    PartitionNotFree,
}

/// Writes messages into a log buffer on behalf of one publication.
///
/// Safe to share between threads, and any number of writers may append to
/// the same log: claims are lock free, and rotation is serialized by the
/// lock word in the log's own metadata.
#[derive(Debug)]
pub struct PublicationWriter {
    log: Arc<LogBufferPartitions>,
    template: HeaderTemplate,
    max_payload: usize,
    max_message: usize,
}

impl PublicationWriter {
    /// A writer for `log`, with the session and stream ids from its metadata.
    pub fn new(log: Arc<LogBufferPartitions>) -> Self {
        let metadata = log.metadata();
        let template = HeaderTemplate {
            session_id: metadata.session_id(),
            stream_id: metadata.stream_id(),
        };
        let max_payload = max_payload_length(log.mtu_length()) as usize;
        let max_message = max_message_length(log.term_length()) as usize;
        Self {
            log,
            template,
            max_payload,
            max_message,
        }
    }

    /// The log being written.
    pub fn log(&self) -> &Arc<LogBufferPartitions> {
        &self.log
    }

    /// Largest message [`offer`](Self::offer) accepts.
    pub fn max_message_length(&self) -> usize {
        self.max_message
    }

    /// Largest payload that fits in one frame.
    pub fn max_payload_length(&self) -> usize {
        self.max_payload
    }

    /// Position just past the last claimed byte.
    pub fn position(&self) -> i64 {
        self.log.producer_position()
    }

    /// Append `payload` as one message, fragmented at the MTU.
    pub fn offer(&self, payload: &[u8]) -> Result<OfferOutcome, LogBufferError> {
        if payload.len() > self.max_message {
            return Err(LogBufferError::MessageTooLong {
                length: payload.len(),
                max: self.max_message,
            });
        }

        let term_count = self.log.active_term_count();
        let index = active_partition_index(i64::from(term_count), PARTITION_COUNT);
        let length = framed_length(payload.len(), self.max_payload);

        match self.log.claim(index, length)? {
            ClaimOutcome::Claimed(slot) => {
                append_message(
                    self.log.term_buffer(index),
                    slot,
                    self.template,
                    self.max_payload,
                    payload,
                );
                let codec = self.log.codec();
                let term_count = term_count_for(slot.term_id, codec.initial_term_id());
                let position = (i64::from(term_count) << codec.position_bits_to_shift())
                    + i64::from(slot.term_offset + slot.length);
                Ok(OfferOutcome::Published { position })
            }
            ClaimOutcome::RotationNeeded { term_id, padding } => {
                if let Some(region) = padding {
                    append_padding(self.log.term_buffer(index), region, term_id, self.template);
                }
                Ok(self.rotate(term_count))
            }
        }
    }

    fn rotate(&self, term_count: i32) -> OfferOutcome {
        match self.log.rotate(term_count) {
            RotateOutcome::Rotated { .. } | RotateOutcome::AlreadyRotated => OfferOutcome::Rotated,
            RotateOutcome::PartitionNotFree { index } => {
                tracing::trace!(
                    "log {} cannot rotate, partition {} still held by a consumer",
                    self.log.metadata().registration_id(),
                    index
                );
                OfferOutcome::PartitionNotFree
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use std::time::{Duration, Instant};

    use strand_core::frame::FrameType;
    use strand_core::{AtomicBuffer, FrameHeader, HEADER_LENGTH, TERM_MIN_LENGTH};

    use super::*;
    use crate::image::Image;
    use crate::join::ExclusivePublicationJoin;
    use crate::layout::{compute_log_length, LogParams};
    use crate::term_reader;

    const MTU: i32 = 1408;

    fn writer(initial_term_id: i32) -> PublicationWriter {
        let params = LogParams {
            term_length: TERM_MIN_LENGTH,
            mtu_length: MTU,
            initial_term_id,
            session_id: 77,
            stream_id: 7,
            registration_id: 1001,
        };
        let log = LogBufferPartitions::create(AtomicBuffer::allocate(compute_log_length(TERM_MIN_LENGTH)), &params)
            .unwrap();
        PublicationWriter::new(Arc::new(log))
    }

    #[test]
    fn test_offer_publishes_and_reports_position() {
        let writer = writer(0);
        assert_eq!(writer.offer(b"hello").unwrap(), OfferOutcome::Published { position: 64 });
        assert_eq!(writer.offer(&[0u8; 100]).unwrap(), OfferOutcome::Published { position: 64 + 160 });
        assert_eq!(writer.position(), 224);

        let header = FrameHeader::read(writer.log().term_buffer(0), 0);
        assert_eq!(header.session_id, 77);
        assert_eq!(header.stream_id, 7);
    }

    #[test]
    fn test_offer_rejects_oversized_message() {
        let writer = writer(0);
        let too_big = vec![0u8; TERM_MIN_LENGTH as usize / 8 + 1];
        assert!(matches!(
            writer.offer(&too_big),
            Err(LogBufferError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_join_near_end_pads_then_rotates() {
        let writer = writer(5);
        let join = ExclusivePublicationJoin::new(5, 6, TERM_MIN_LENGTH - 32, TERM_MIN_LENGTH, MTU).unwrap();
        join.apply(writer.log()).unwrap();

        assert_eq!(writer.offer(&[1u8; 64]).unwrap(), OfferOutcome::Rotated);

        let log = writer.log();
        let padding = FrameHeader::read(log.term_buffer(1), (TERM_MIN_LENGTH - 32) as usize);
        assert!(padding.is_padding());
        assert_eq!(padding.frame_length, 32);
        assert_eq!(padding.term_id, 6);
        assert_eq!(log.active_term_count(), 2);

        // The retry lands at the start of term 7.
        let expected = 2 * i64::from(TERM_MIN_LENGTH) + 96;
        assert_eq!(writer.offer(&[1u8; 64]).unwrap(), OfferOutcome::Published { position: expected });
        let first = FrameHeader::read(log.term_buffer(2), 0);
        assert_eq!(first.term_id, 7);
    }

    #[test]
    fn test_slow_consumer_stops_producer() {
        let writer = writer(0);
        let log = writer.log().clone();
        let slot = log.register_consumer(0).unwrap();
        let payload = [0u8; 1024];

        let mut not_free = false;
        for _ in 0..1000 {
            match writer.offer(&payload).unwrap() {
                OfferOutcome::PartitionNotFree => {
                    not_free = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(not_free);
        assert_eq!(log.active_term_count(), 2);

        log.update_consumer(slot, i64::from(TERM_MIN_LENGTH));
        assert_eq!(writer.offer(&payload).unwrap(), OfferOutcome::Rotated);
        assert!(matches!(writer.offer(&payload).unwrap(), OfferOutcome::Published { .. }));
    }

    #[test]
    fn test_concurrent_offers_are_all_readable() {
        let writer = writer(0);
        let per_thread = 200;

        thread::scope(|s| {
            for id in 0..4u8 {
                let writer = &writer;
                s.spawn(move || {
                    let mut sent = 0;
                    while sent < per_thread {
                        let msg = [id; 48];
                        if let OfferOutcome::Published { .. } = writer.offer(&msg).unwrap() {
                            sent += 1;
                        }
                    }
                });
            }
        });

        let log = writer.log();
        let mut counts = [0usize; 4];
        let mut position = 0i64;
        let end = log.producer_position();
        while position < end {
            let codec = log.codec();
            let index = codec.partition_for_position(position);
            let outcome = term_reader::read(
                log.term_buffer(index),
                codec.term_offset_for(position),
                codec.term_id_for(position),
                usize::MAX,
                |payload, _| {
                    assert!(payload.iter().all(|&b| b == payload[0]));
                    counts[payload[0] as usize] += 1;
                },
            );
            position = codec.term_begin_position(position) + i64::from(outcome.offset);
        }
        assert_eq!(counts, [per_thread; 4]);
    }

    #[test]
    fn test_join_at_term_start_writes_no_padding() {
        let writer = writer(5);
        let join = ExclusivePublicationJoin::new(5, 8, 0, TERM_MIN_LENGTH, MTU).unwrap();
        let point = join.apply(writer.log()).unwrap();
        assert_eq!(point.position, 3 * i64::from(TERM_MIN_LENGTH));

        let expected = 3 * i64::from(TERM_MIN_LENGTH) + 64;
        assert_eq!(writer.offer(&[9u8; 20]).unwrap(), OfferOutcome::Published { position: expected });

        // Term count 3 lives in partition 0.
        let term = writer.log().term_buffer(0);
        let first = FrameHeader::read(term, 0);
        assert_eq!(FrameType::from_u16(first.frame_type), Some(FrameType::Data));
        assert!(!first.is_padding());
        assert_eq!(first.frame_length, HEADER_LENGTH + 20);
        assert_eq!(first.term_offset, 0);
        assert_eq!(first.term_id, 8);

        // Nothing follows the single data frame.
        assert_eq!(FrameHeader::read(term, 64).frame_length, 0);
        assert_eq!(writer.position(), expected);
    }

    #[test]
    fn test_writers_sharing_a_log_lose_nothing() {
        const PER_THREAD: u32 = 2000;
        const THREADS: u8 = 4;

        let first = writer(0);
        let second = PublicationWriter::new(Arc::clone(first.log()));
        let mut image = Image::new(Arc::clone(first.log()), 0, 1).unwrap();

        let received = thread::scope(|s| {
            for id in 0..THREADS {
                let writer = if id % 2 == 0 { &first } else { &second };
                s.spawn(move || {
                    let mut payload = [0u8; 200];
                    payload[0] = id;
                    let mut seq = 0u32;
                    while seq < PER_THREAD {
                        payload[1..5].copy_from_slice(&seq.to_le_bytes());
                        match writer.offer(&payload).unwrap() {
                            OfferOutcome::Published { .. } => seq += 1,
                            OfferOutcome::Rotated | OfferOutcome::PartitionNotFree => thread::yield_now(),
                        }
                    }
                });
            }

            let image = &mut image;
            s.spawn(move || {
                let mut next = [0u32; THREADS as usize];
                let mut total = 0u32;
                let deadline = Instant::now() + Duration::from_secs(30);
                while total < PER_THREAD * u32::from(THREADS) {
                    assert!(Instant::now() < deadline, "only {total} messages arrived");
                    let read = image.poll(
                        |payload, _| {
                            let id = payload[0] as usize;
                            let seq = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                            assert_eq!(seq, next[id], "writer {id} out of order");
                            next[id] += 1;
                        },
                        64,
                    );
                    if read == 0 {
                        thread::yield_now();
                    }
                    total += read as u32;
                }
                next
            })
            .join()
            .unwrap()
        });

        assert_eq!(received, [PER_THREAD; THREADS as usize]);
        assert_eq!(image.position(), first.position());
        assert!(!first.log().metadata().is_rotation_locked());
    }
}
