//! Log buffer file layout.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────────┐
//! │ partition 0  │ partition 1  │ partition 2  │ metadata (4 KiB) │
//! │ term_length  │ term_length  │ term_length  │                  │
//! └──────────────┴──────────────┴──────────────┴──────────────────┘
//! ```
//!
//! Metadata trailer:
//!
//! | offset | field                                             |
//! |--------|---------------------------------------------------|
//! | 0..24  | raw tail per partition: `(term_id << 32) \| offset` |
//! | 24     | active term count (i32)                           |
//! | 28     | rotation lock (i32), `1` while a writer rotates   |
//! | 128    | consumer positions, 8 × i64, `-1` when unused     |
//! | 256    | initial term id (i32)                             |
//! | 260    | MTU length (i32)                                  |
//! | 264    | term length (i32)                                 |
//! | 268    | session id (i32)                                  |
//! | 272    | stream id (i32)                                   |
//! | 280    | registration id (i64)                             |

use strand_core::frame::{HEADER_LENGTH, MAX_MTU_LENGTH};
use strand_core::position::check_term_length;
use strand_core::{AtomicBuffer, FRAME_ALIGNMENT, PARTITION_COUNT};

use crate::LogBufferError;

/// Length of the metadata trailer at the end of every log.
pub const LOG_META_DATA_LENGTH: usize = 4096;

pub const TERM_TAIL_COUNTERS_OFFSET: usize = 0;
pub const LOG_ACTIVE_TERM_COUNT_OFFSET: usize = 24;
pub const LOG_ROTATION_LOCK_OFFSET: usize = 28;
pub const CONSUMER_POSITIONS_OFFSET: usize = 128;
pub const LOG_INITIAL_TERM_ID_OFFSET: usize = 256;
pub const LOG_MTU_LENGTH_OFFSET: usize = 260;
pub const LOG_TERM_LENGTH_OFFSET: usize = 264;
pub const LOG_SESSION_ID_OFFSET: usize = 268;
pub const LOG_STREAM_ID_OFFSET: usize = 272;
pub const LOG_REGISTRATION_ID_OFFSET: usize = 280;

/// Number of consumer position slots in the trailer.
pub const MAX_CONSUMERS: usize = 8;

/// Value of an unclaimed consumer slot.
pub const NO_CONSUMER: i64 = -1;

/// Total file length for a log with the given term length.
pub fn compute_log_length(term_length: i32) -> usize {
    PARTITION_COUNT * term_length as usize + LOG_META_DATA_LENGTH
}

/// Validate an MTU against a term length.
pub fn check_mtu(mtu_length: i32, term_length: i32) -> Result<(), LogBufferError> {
    let valid = mtu_length > HEADER_LENGTH
        && mtu_length <= MAX_MTU_LENGTH
        && mtu_length <= term_length
        && mtu_length % FRAME_ALIGNMENT == 0;
    if !valid {
        return Err(LogBufferError::InvalidMtu {
            mtu_length,
            term_length,
        });
    }
    Ok(())
}

#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    (i64::from(term_id) << 32) | (i64::from(term_offset) & 0xFFFF_FFFF)
}

#[inline]
pub fn tail_term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Tail offset clamped to the term length. A tripped tail may have been
/// advanced past the end by claimers that lost the race.
#[inline]
pub fn tail_offset(raw_tail: i64, term_length: i32) -> i32 {
    (raw_tail & 0xFFFF_FFFF).min(i64::from(term_length)) as i32
}

/// Per-log constants stored in the metadata trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogParams {
    pub term_length: i32,
    pub mtu_length: i32,
    pub initial_term_id: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub registration_id: i64,
}

impl LogParams {
    /// Check term length and MTU.
    pub fn validate(&self) -> Result<(), LogBufferError> {
        check_term_length(self.term_length)?;
        check_mtu(self.mtu_length, self.term_length)
    }
}

/// View over the metadata trailer of a log buffer.
#[derive(Debug, Clone)]
pub struct LogMetadata {
    buffer: AtomicBuffer,
}

impl LogMetadata {
    /// Wrap a trailer-sized buffer.
    pub fn new(buffer: AtomicBuffer) -> Result<Self, LogBufferError> {
        if buffer.capacity() < LOG_META_DATA_LENGTH {
            return Err(LogBufferError::LengthMismatch {
                expected: LOG_META_DATA_LENGTH,
                actual: buffer.capacity(),
            });
        }
        Ok(Self { buffer })
    }

    /// Write the constants and put the log at the start of `initial_term_id`.
    ///
    /// Partition `i > 0` is seeded with term id `initial_term_id - PARTITION_COUNT + i`
    /// so it reads as an older term that holds no data for this stream.
    pub fn initialise(&self, params: &LogParams) {
        let b = &self.buffer;
        b.put_i32(LOG_INITIAL_TERM_ID_OFFSET, params.initial_term_id);
        b.put_i32(LOG_MTU_LENGTH_OFFSET, params.mtu_length);
        b.put_i32(LOG_TERM_LENGTH_OFFSET, params.term_length);
        b.put_i32(LOG_SESSION_ID_OFFSET, params.session_id);
        b.put_i32(LOG_STREAM_ID_OFFSET, params.stream_id);
        b.put_i64(LOG_REGISTRATION_ID_OFFSET, params.registration_id);

        for slot in 0..MAX_CONSUMERS {
            b.put_i64(consumer_offset(slot), NO_CONSUMER);
        }

        self.put_raw_tail_ordered(0, pack_tail(params.initial_term_id, 0));
        for index in 1..PARTITION_COUNT {
            let term_id = params
                .initial_term_id
                .wrapping_add(index as i32)
                .wrapping_sub(PARTITION_COUNT as i32);
            self.put_raw_tail_ordered(index, pack_tail(term_id, 0));
        }
        self.set_active_term_count_ordered(0);
        b.put_i32_ordered(LOG_ROTATION_LOCK_OFFSET, 0);
    }

    pub fn initial_term_id(&self) -> i32 {
        self.buffer.get_i32(LOG_INITIAL_TERM_ID_OFFSET)
    }

    pub fn mtu_length(&self) -> i32 {
        self.buffer.get_i32(LOG_MTU_LENGTH_OFFSET)
    }

    pub fn term_length(&self) -> i32 {
        self.buffer.get_i32(LOG_TERM_LENGTH_OFFSET)
    }

    pub fn session_id(&self) -> i32 {
        self.buffer.get_i32(LOG_SESSION_ID_OFFSET)
    }

    pub fn stream_id(&self) -> i32 {
        self.buffer.get_i32(LOG_STREAM_ID_OFFSET)
    }

    pub fn registration_id(&self) -> i64 {
        self.buffer.get_i64(LOG_REGISTRATION_ID_OFFSET)
    }

    /// Read every constant back.
    pub fn params(&self) -> LogParams {
        LogParams {
            term_length: self.term_length(),
            mtu_length: self.mtu_length(),
            initial_term_id: self.initial_term_id(),
            session_id: self.session_id(),
            stream_id: self.stream_id(),
            registration_id: self.registration_id(),
        }
    }

    #[inline]
    pub fn raw_tail_volatile(&self, partition: usize) -> i64 {
        self.buffer.get_i64_volatile(tail_counter_offset(partition))
    }

    #[inline]
    pub fn put_raw_tail_ordered(&self, partition: usize, raw_tail: i64) {
        self.buffer.put_i64_ordered(tail_counter_offset(partition), raw_tail)
    }

    #[inline]
    pub fn get_and_add_raw_tail(&self, partition: usize, delta: i64) -> i64 {
        self.buffer.get_and_add_i64(tail_counter_offset(partition), delta)
    }

    #[inline]
    pub fn active_term_count(&self) -> i32 {
        self.buffer.get_i32_volatile(LOG_ACTIVE_TERM_COUNT_OFFSET)
    }

    #[inline]
    pub fn set_active_term_count_ordered(&self, term_count: i32) {
        self.buffer.put_i32_ordered(LOG_ACTIVE_TERM_COUNT_OFFSET, term_count)
    }

    #[inline]
    pub fn cas_active_term_count(&self, expected: i32, update: i32) -> bool {
        self.buffer
            .compare_and_set_i32(LOG_ACTIVE_TERM_COUNT_OFFSET, expected, update)
    }

    /// Take the log-wide rotation lock. Every writer mapping this log,
    /// in any process, contends on the same word.
    #[inline]
    pub fn try_lock_rotation(&self) -> bool {
        self.buffer.compare_and_set_i32(LOG_ROTATION_LOCK_OFFSET, 0, 1)
    }

    #[inline]
    pub fn unlock_rotation(&self) {
        self.buffer.put_i32_ordered(LOG_ROTATION_LOCK_OFFSET, 0)
    }

    #[inline]
    pub fn is_rotation_locked(&self) -> bool {
        self.buffer.get_i32_volatile(LOG_ROTATION_LOCK_OFFSET) != 0
    }

    #[inline]
    pub fn consumer_position(&self, slot: usize) -> i64 {
        self.buffer.get_i64_volatile(consumer_offset(slot))
    }

    #[inline]
    pub fn set_consumer_position_ordered(&self, slot: usize, position: i64) {
        self.buffer.put_i64_ordered(consumer_offset(slot), position)
    }

    #[inline]
    pub fn cas_consumer_position(&self, slot: usize, expected: i64, update: i64) -> bool {
        self.buffer
            .compare_and_set_i64(consumer_offset(slot), expected, update)
    }
}

#[inline]
fn tail_counter_offset(partition: usize) -> usize {
    assert!(partition < PARTITION_COUNT, "partition {partition} out of range");
    TERM_TAIL_COUNTERS_OFFSET + partition * 8
}

#[inline]
fn consumer_offset(slot: usize) -> usize {
    assert!(slot < MAX_CONSUMERS, "consumer slot {slot} out of range");
    CONSUMER_POSITIONS_OFFSET + slot * 8
}

#[cfg(test)]
mod tests {
    use strand_core::TERM_MIN_LENGTH;

    use super::*;

    fn params() -> LogParams {
        LogParams {
            term_length: TERM_MIN_LENGTH,
            mtu_length: 1408,
            initial_term_id: 5,
            session_id: 11,
            stream_id: 7,
            registration_id: 1001,
        }
    }

    #[test]
    fn test_tail_packing() {
        let raw = pack_tail(-3, 4096);
        assert_eq!(tail_term_id(raw), -3);
        assert_eq!(tail_offset(raw, TERM_MIN_LENGTH), 4096);

        let tripped = pack_tail(9, TERM_MIN_LENGTH) + 512;
        assert_eq!(tail_term_id(tripped), 9);
        assert_eq!(tail_offset(tripped, TERM_MIN_LENGTH), TERM_MIN_LENGTH);
    }

    #[test]
    fn test_initialise_seeds_partitions() {
        let meta = LogMetadata::new(AtomicBuffer::allocate(LOG_META_DATA_LENGTH)).unwrap();
        meta.initialise(&params());

        assert_eq!(meta.params(), params());
        assert_eq!(meta.active_term_count(), 0);
        assert_eq!(meta.raw_tail_volatile(0), pack_tail(5, 0));
        assert_eq!(tail_term_id(meta.raw_tail_volatile(1)), 3);
        assert_eq!(tail_term_id(meta.raw_tail_volatile(2)), 4);
        for slot in 0..MAX_CONSUMERS {
            assert_eq!(meta.consumer_position(slot), NO_CONSUMER);
        }
        assert!(!meta.is_rotation_locked());
    }

    #[test]
    fn test_rotation_lock_is_exclusive() {
        let meta = LogMetadata::new(AtomicBuffer::allocate(LOG_META_DATA_LENGTH)).unwrap();
        meta.initialise(&params());

        assert!(meta.try_lock_rotation());
        assert!(!meta.try_lock_rotation());
        assert!(meta.is_rotation_locked());
        meta.unlock_rotation();
        assert!(meta.try_lock_rotation());
    }

    #[test]
    fn test_check_mtu() {
        assert!(check_mtu(1408, TERM_MIN_LENGTH).is_ok());
        assert!(check_mtu(HEADER_LENGTH, TERM_MIN_LENGTH).is_err());
        assert!(check_mtu(1400, TERM_MIN_LENGTH).is_err());
        assert!(check_mtu(MAX_MTU_LENGTH + 32, 1 << 20).is_err());
    }

    #[test]
    fn test_log_length() {
        assert_eq!(
            compute_log_length(TERM_MIN_LENGTH),
            3 * 65536 + LOG_META_DATA_LENGTH
        );
    }
}
