//! Many-to-one command ring.
//!
//! Any number of producers (threads or processes) write variable-length
//! records; one consumer reads them in order. The ring lives in shared
//! memory and is laid out as a power-of-two record area followed by a
//! trailer of counters, each on its own cache line pair:
//!
//! ```text
//! ┌───────────────────────────┬──────┬────────────┬──────┬─────────────┬───────────┐
//! │ records (capacity bytes)  │ tail │ head cache │ head │ correlation │ heartbeat │
//! └───────────────────────────┴──────┴────────────┴──────┴─────────────┴───────────┘
//! ```
//!
//! A record is `[length: i32][type: i32][payload]`, padded to 8 bytes. The
//! length is written negated while the payload is copied and stored
//! positive, with release ordering, once the record is complete.

use strand_core::AtomicBuffer;
use thiserror::Error;

pub const TAIL_POSITION_OFFSET: usize = 0;
pub const HEAD_CACHE_POSITION_OFFSET: usize = 128;
pub const HEAD_POSITION_OFFSET: usize = 256;
pub const CORRELATION_COUNTER_OFFSET: usize = 384;
pub const CONSUMER_HEARTBEAT_OFFSET: usize = 512;
/// Length of the trailer after the record area.
pub const TRAILER_LENGTH: usize = 640;

/// Every record starts with `[length i32][type i32]`.
pub const RECORD_HEADER_LENGTH: usize = 8;
pub const RECORD_ALIGNMENT: usize = 8;

/// Type id of the filler record written when a record would straddle the
/// end of the buffer.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("ring capacity {0} is not a positive power of two")]
    InvalidCapacity(usize),

    #[error("message type id {0} is reserved, ids must be positive")]
    InvalidMessageType(i32),

    #[error("message of {length} bytes exceeds maximum of {max}")]
    MessageTooLong { length: usize, max: usize },
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Not enough free space right now; the consumer has to catch up.
    InsufficientCapacity,
}

/// Total buffer length for a ring with `capacity` bytes of records.
pub fn ring_length(capacity: usize) -> usize {
    capacity + TRAILER_LENGTH
}

#[derive(Debug, Clone)]
pub struct CommandRing {
    buffer: AtomicBuffer,
    capacity: usize,
    max_msg_length: usize,
    tail_position_index: usize,
    head_cache_position_index: usize,
    head_position_index: usize,
    correlation_counter_index: usize,
    consumer_heartbeat_index: usize,
}

impl CommandRing {
    /// Wrap `buffer`; its length minus the trailer must be a power of two.
    pub fn new(buffer: AtomicBuffer) -> Result<Self, RingError> {
        let capacity = buffer
            .capacity()
            .checked_sub(TRAILER_LENGTH)
            .filter(|c| c.is_power_of_two() && *c >= RECORD_ALIGNMENT)
            .ok_or(RingError::InvalidCapacity(
                buffer.capacity().saturating_sub(TRAILER_LENGTH),
            ))?;

        Ok(Self {
            buffer,
            capacity,
            max_msg_length: capacity / 8,
            tail_position_index: capacity + TAIL_POSITION_OFFSET,
            head_cache_position_index: capacity + HEAD_CACHE_POSITION_OFFSET,
            head_position_index: capacity + HEAD_POSITION_OFFSET,
            correlation_counter_index: capacity + CORRELATION_COUNTER_OFFSET,
            consumer_heartbeat_index: capacity + CONSUMER_HEARTBEAT_OFFSET,
        })
    }

    /// Bytes available for records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload a single record may carry: an eighth of the capacity.
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Append one record. Safe to call from many producers at once.
    pub fn write(&self, msg_type_id: i32, payload: &[u8]) -> Result<WriteOutcome, RingError> {
        if msg_type_id < 1 {
            return Err(RingError::InvalidMessageType(msg_type_id));
        }
        if payload.len() > self.max_msg_length {
            return Err(RingError::MessageTooLong {
                length: payload.len(),
                max: self.max_msg_length,
            });
        }

        let record_length = payload.len() + RECORD_HEADER_LENGTH;
        let required = align(record_length);
        let Some(index) = self.claim_capacity(required) else {
            return Ok(WriteOutcome::InsufficientCapacity);
        };

        self.buffer
            .put_i32_ordered(index, -(record_length as i32));
        self.buffer.put_i32(index + 4, msg_type_id);
        self.buffer.put_bytes(index + RECORD_HEADER_LENGTH, payload);
        self.buffer.put_i32_ordered(index, record_length as i32);

        Ok(WriteOutcome::Written)
    }

    /// Reserve `required` bytes and return the record index, writing a
    /// padding record first if the space would wrap.
    fn claim_capacity(&self, required: usize) -> Option<usize> {
        let mask = (self.capacity - 1) as i64;
        let capacity = self.capacity as i64;
        let required = required as i64;
        let mut head = self.buffer.get_i64_volatile(self.head_cache_position_index);

        loop {
            let tail = self.buffer.get_i64_volatile(self.tail_position_index);
            let available = capacity - (tail - head);

            if required > available {
                head = self.buffer.get_i64_volatile(self.head_position_index);
                if required > capacity - (tail - head) {
                    return None;
                }
                self.buffer
                    .put_i64_ordered(self.head_cache_position_index, head);
            }

            let mut padding = 0;
            let tail_index = tail & mask;
            let to_buffer_end = capacity - tail_index;

            if required > to_buffer_end {
                let mut head_index = head & mask;
                if required > head_index {
                    head = self.buffer.get_i64_volatile(self.head_position_index);
                    head_index = head & mask;
                    if required > head_index {
                        return None;
                    }
                    self.buffer
                        .put_i64_ordered(self.head_cache_position_index, head);
                }
                padding = to_buffer_end;
            }

            if self.buffer.compare_and_set_i64(
                self.tail_position_index,
                tail,
                tail + required + padding,
            ) {
                if padding != 0 {
                    let index = tail_index as usize;
                    self.buffer.put_i32_ordered(index, -(padding as i32));
                    self.buffer.put_i32(index + 4, PADDING_MSG_TYPE_ID);
                    self.buffer.put_i32_ordered(index, padding as i32);
                    return Some(0);
                }
                return Some(tail_index as usize);
            }
        }
    }

    /// Hand up to `message_limit` records to `handler` in write order.
    ///
    /// Consumed space is zeroed and released even if `handler` panics.
    /// Only one consumer may read at a time.
    pub fn read<F>(&self, mut handler: F, message_limit: usize) -> usize
    where
        F: FnMut(i32, &[u8]),
    {
        let head = self.buffer.get_i64(self.head_position_index);
        let head_index = (head & (self.capacity as i64 - 1)) as usize;
        let contiguous = self.capacity - head_index;

        let mut release = HeadRelease {
            buffer: &self.buffer,
            head_position_index: self.head_position_index,
            head,
            head_index,
            bytes_read: 0,
        };
        let mut messages = 0;
        let mut payload = Vec::new();

        while release.bytes_read < contiguous && messages < message_limit {
            let index = head_index + release.bytes_read;
            let record_length = self.buffer.get_i32_volatile(index);
            if record_length <= 0 {
                break;
            }
            release.bytes_read += align(record_length as usize);

            let msg_type_id = self.buffer.get_i32(index + 4);
            if msg_type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            messages += 1;
            payload.resize(record_length as usize - RECORD_HEADER_LENGTH, 0);
            self.buffer
                .get_bytes(index + RECORD_HEADER_LENGTH, &mut payload);
            handler(msg_type_id, &payload);
        }

        messages
    }

    /// Hand out a fresh id, unique across all users of this ring.
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer
            .get_and_add_i64(self.correlation_counter_index, 1)
    }

    /// Seed the correlation counter. Only meaningful before any id is handed out.
    pub fn set_next_correlation_id(&self, value: i64) {
        self.buffer
            .put_i64_ordered(self.correlation_counter_index, value);
    }

    /// Last time, in epoch millis, the consumer said it was alive.
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.buffer.get_i64_volatile(self.consumer_heartbeat_index)
    }

    /// Called by the consumer on every duty cycle.
    pub fn set_consumer_heartbeat_time(&self, time_ms: i64) {
        self.buffer
            .put_i64_ordered(self.consumer_heartbeat_index, time_ms);
    }

    /// Total bytes ever claimed by producers.
    pub fn producer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.tail_position_index)
    }

    /// Total bytes ever consumed.
    pub fn consumer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.head_position_index)
    }

    /// Bytes currently occupied, padding included.
    pub fn size(&self) -> usize {
        loop {
            let before = self.consumer_position();
            let tail = self.producer_position();
            let after = self.consumer_position();
            if before == after {
                return (tail - after) as usize;
            }
        }
    }
}

/// Advances the head over everything read so far when dropped.
struct HeadRelease<'a> {
    buffer: &'a AtomicBuffer,
    head_position_index: usize,
    head: i64,
    head_index: usize,
    bytes_read: usize,
}

impl Drop for HeadRelease<'_> {
    fn drop(&mut self) {
        if self.bytes_read > 0 {
            self.buffer
                .set_memory(self.head_index, self.bytes_read, 0);
            self.buffer.put_i64_ordered(
                self.head_position_index,
                self.head + self.bytes_read as i64,
            );
        }
    }
}

#[inline]
fn align(length: usize) -> usize {
    (length + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;

    use super::*;

    fn ring(capacity: usize) -> CommandRing {
        CommandRing::new(AtomicBuffer::allocate(ring_length(capacity))).unwrap()
    }

    #[test]
    fn test_rejects_bad_capacity() {
        let bad = AtomicBuffer::allocate(1000 + TRAILER_LENGTH);
        assert_eq!(CommandRing::new(bad).unwrap_err(), RingError::InvalidCapacity(1000));
        let tiny = AtomicBuffer::allocate(64);
        assert!(CommandRing::new(tiny).is_err());
    }

    #[test]
    fn test_rejects_reserved_type_and_long_message() {
        let ring = ring(1024);
        assert_eq!(ring.write(0, b"x"), Err(RingError::InvalidMessageType(0)));
        assert_eq!(
            ring.write(PADDING_MSG_TYPE_ID, b"x"),
            Err(RingError::InvalidMessageType(-1))
        );
        assert_eq!(
            ring.write(1, &[0u8; 129]),
            Err(RingError::MessageTooLong { length: 129, max: 128 })
        );
    }

    #[test]
    fn test_write_then_read() {
        let ring = ring(1024);
        assert_eq!(ring.write(7, b"abc").unwrap(), WriteOutcome::Written);
        assert_eq!(ring.write(8, b"").unwrap(), WriteOutcome::Written);
        assert_eq!(ring.size(), 16 + 8);

        let mut seen = Vec::new();
        let read = ring.read(|ty, payload| seen.push((ty, payload.to_vec())), 10);
        assert_eq!(read, 2);
        assert_eq!(seen, vec![(7, b"abc".to_vec()), (8, Vec::new())]);
        assert_eq!(ring.size(), 0);
        assert_eq!(ring.consumer_position(), 24);
    }

    #[test]
    fn test_read_limit_leaves_rest() {
        let ring = ring(1024);
        for i in 1..=3 {
            assert_eq!(ring.write(i, &[i as u8]).unwrap(), WriteOutcome::Written);
        }
        let mut types = Vec::new();
        assert_eq!(ring.read(|ty, _| types.push(ty), 2), 2);
        assert_eq!(ring.read(|ty, _| types.push(ty), 2), 1);
        assert_eq!(types, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_ring_reports_insufficient_capacity() {
        let ring = ring(256);
        let payload = [1u8; 24];
        let mut written = 0;
        while ring.write(1, &payload).unwrap() == WriteOutcome::Written {
            written += 1;
        }
        assert_eq!(written, 256 / 32);

        assert_eq!(ring.read(|_, _| {}, 1), 1);
        assert_eq!(ring.write(1, &payload).unwrap(), WriteOutcome::Written);
    }

    #[test]
    fn test_wrap_inserts_padding() {
        let ring = ring(256);
        // Seven 32 byte records leave the tail 32 bytes from the end.
        for _ in 0..7 {
            assert_eq!(ring.write(1, &[2u8; 24]).unwrap(), WriteOutcome::Written);
        }
        assert_eq!(ring.read(|_, _| {}, 7), 7);

        // A 40 byte record cannot fit, so the last 32 bytes become padding
        // and the record starts over at index 0.
        assert_eq!(ring.write(9, &[3u8; 32]).unwrap(), WriteOutcome::Written);
        assert_eq!(ring.producer_position(), 224 + 32 + 40);

        let mut seen = Vec::new();
        assert_eq!(ring.read(|ty, p| seen.push((ty, p.len())), 10), 0);
        assert_eq!(ring.read(|ty, p| seen.push((ty, p.len())), 10), 1);
        assert_eq!(seen, vec![(9, 32)]);
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn test_handler_panic_still_consumes() {
        let ring = ring(1024);
        assert_eq!(ring.write(1, b"boom").unwrap(), WriteOutcome::Written);
        assert_eq!(ring.write(2, b"next").unwrap(), WriteOutcome::Written);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            ring.read(|_, _| panic!("handler failed"), 10);
        }));
        assert!(result.is_err());

        let mut seen = Vec::new();
        ring.read(|ty, _| seen.push(ty), 10);
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn test_correlation_ids_and_heartbeat() {
        let ring = ring(1024);
        ring.set_next_correlation_id(42);
        assert_eq!(ring.next_correlation_id(), 42);
        assert_eq!(ring.next_correlation_id(), 43);

        assert_eq!(ring.consumer_heartbeat_time(), 0);
        ring.set_consumer_heartbeat_time(1234);
        assert_eq!(ring.consumer_heartbeat_time(), 1234);
    }

    #[test]
    fn test_concurrent_claims_do_not_overlap() {
        let ring = ring(1 << 16);
        let claims: Vec<Vec<usize>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| s.spawn(|| (0..500).filter_map(|_| ring.claim_capacity(24)).collect()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: Vec<usize> = claims.into_iter().flatten().collect();
        assert_eq!(all.len(), 1000);
        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert!(all.iter().all(|index| index % 24 == 0));
    }

    #[test]
    fn test_two_producers_one_consumer() {
        let ring = ring(4096);
        let per_producer = 2000u32;

        thread::scope(|s| {
            for producer in 1..=2i32 {
                let ring = &ring;
                s.spawn(move || {
                    for seq in 0..per_producer {
                        while ring.write(producer, &seq.to_le_bytes()).unwrap() != WriteOutcome::Written {
                            std::hint::spin_loop();
                        }
                    }
                });
            }

            let mut next = [0u32; 3];
            let mut received = 0;
            while received < 2 * per_producer {
                received += ring.read(
                    |producer, payload| {
                        let seq = u32::from_le_bytes(payload.try_into().unwrap());
                        assert_eq!(seq, next[producer as usize]);
                        next[producer as usize] += 1;
                    },
                    64,
                ) as u32;
            }
        });

        assert_eq!(ring.size(), 0);
    }
}
