//! Stream position arithmetic.
//!
//! A stream position is a 64-bit ordinal made of the number of terms
//! completed since the stream's initial term id and the byte offset within
//! the current term:
//!
//! ```text
//!  63                     shift                       0
//! ┌───────────────────────┬────────────────────────────┐
//! │      term count       │        term offset         │
//! └───────────────────────┴────────────────────────────┘
//! ```
//!
//! `shift` is `log2(term_length)`. Term ids are 32-bit and wrap, so every
//! comparison between them goes through [`term_count_for`] or [`is_after`],
//! never raw `<`/`>`.
//!
//! Everything here is pure and total on well-formed input. The only
//! failures are malformed inputs, reported as [`PositionError`].

use thiserror::Error;

/// Alignment of every frame within a term.
pub const FRAME_ALIGNMENT: i32 = 32;

/// Number of partitions (terms) in a log buffer.
pub const PARTITION_COUNT: usize = 3;

/// Smallest permitted term length (64 KiB).
pub const TERM_MIN_LENGTH: i32 = 64 * 1024;

/// Largest permitted term length (1 GiB).
pub const TERM_MAX_LENGTH: i32 = 1024 * 1024 * 1024;

/// Errors from malformed position arithmetic inputs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionError {
    /// Offset out of `[0, term_length)` or not frame aligned.
    #[error("invalid term offset {offset} for term length {term_length} (alignment {align})", align = FRAME_ALIGNMENT)]
    InvalidOffset { offset: i32, term_length: i32 },

    /// Term id lies behind the initial term id.
    #[error("term id {term_id} is behind initial term id {initial_term_id}")]
    InvalidTermId { term_id: i32, initial_term_id: i32 },

    /// Term length is not a power of two within bounds.
    #[error("term length {0} must be a power of two in [{min}, {max}]", min = TERM_MIN_LENGTH, max = TERM_MAX_LENGTH)]
    InvalidTermLength(i32),
}

/// Check that `term_length` is a power of two within the permitted bounds.
pub fn check_term_length(term_length: i32) -> Result<(), PositionError> {
    if !(TERM_MIN_LENGTH..=TERM_MAX_LENGTH).contains(&term_length)
        || !(term_length as u32).is_power_of_two()
    {
        return Err(PositionError::InvalidTermLength(term_length));
    }
    Ok(())
}

/// Number of bits to shift a term count to form a position.
///
/// Only meaningful for lengths accepted by [`check_term_length`].
#[inline]
pub fn position_bits_to_shift(term_length: i32) -> u32 {
    term_length.trailing_zeros()
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub fn align(value: i32, alignment: i32) -> i32 {
    (value + (alignment - 1)) & !(alignment - 1)
}

#[inline]
pub fn is_frame_aligned(offset: i32) -> bool {
    offset & (FRAME_ALIGNMENT - 1) == 0
}

/// Combine a term count and term offset into a position.
pub fn encode(term_count: i64, term_offset: i32, position_bits_to_shift: u32) -> Result<i64, PositionError> {
    let term_length = 1i64 << position_bits_to_shift;
    if term_offset < 0 || i64::from(term_offset) >= term_length || !is_frame_aligned(term_offset) {
        return Err(PositionError::InvalidOffset {
            offset: term_offset,
            term_length: term_length as i32,
        });
    }
    Ok((term_count << position_bits_to_shift) | i64::from(term_offset))
}

/// Split a position into `(term_count, term_offset)`.
#[inline]
pub fn decode(position: i64, position_bits_to_shift: u32) -> (i64, i32) {
    let mask = (1i64 << position_bits_to_shift) - 1;
    (position >> position_bits_to_shift, (position & mask) as i32)
}

/// Terms completed between `initial_term_id` and `term_id`.
///
/// Uses two's-complement wrapping so ids that have wrapped past
/// `i32::MAX` still give the right distance. A negative result means
/// `term_id` is behind the initial term.
#[inline]
pub fn term_count_for(term_id: i32, initial_term_id: i32) -> i32 {
    term_id.wrapping_sub(initial_term_id)
}

/// Partition holding the given term count. Never negative.
#[inline]
pub fn active_partition_index(term_count: i64, partition_count: usize) -> usize {
    term_count.rem_euclid(partition_count as i64) as usize
}

/// Partition holding `term_id` for a stream starting at `initial_term_id`.
#[inline]
pub fn partition_index_for_term(term_id: i32, initial_term_id: i32) -> usize {
    active_partition_index(i64::from(term_count_for(term_id, initial_term_id)), PARTITION_COUNT)
}

/// Whether term id `a` comes after `b`, accounting for wrap.
#[inline]
pub fn is_after(a: i32, b: i32) -> bool {
    a.wrapping_sub(b) > 0
}

/// The position arithmetic of a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionCodec {
    term_length: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
}

impl PositionCodec {
    /// Create a codec, validating the term length.
    pub fn new(term_length: i32, initial_term_id: i32) -> Result<Self, PositionError> {
        check_term_length(term_length)?;
        Ok(Self {
            term_length,
            position_bits_to_shift: position_bits_to_shift(term_length),
            initial_term_id,
        })
    }

    #[inline]
    pub fn term_length(&self) -> i32 {
        self.term_length
    }

    #[inline]
    pub fn position_bits_to_shift(&self) -> u32 {
        self.position_bits_to_shift
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    pub fn encode(&self, term_count: i64, term_offset: i32) -> Result<i64, PositionError> {
        encode(term_count, term_offset, self.position_bits_to_shift)
    }

    pub fn decode(&self, position: i64) -> (i64, i32) {
        decode(position, self.position_bits_to_shift)
    }

    /// Position of `term_offset` within `term_id`.
    pub fn position_for(&self, term_id: i32, term_offset: i32) -> Result<i64, PositionError> {
        let term_count = term_count_for(term_id, self.initial_term_id);
        if term_count < 0 {
            return Err(PositionError::InvalidTermId {
                term_id,
                initial_term_id: self.initial_term_id,
            });
        }
        self.encode(i64::from(term_count), term_offset)
    }

    /// Term id that contains `position`.
    #[inline]
    pub fn term_id_for(&self, position: i64) -> i32 {
        let term_count = (position >> self.position_bits_to_shift) as i32;
        term_count.wrapping_add(self.initial_term_id)
    }

    #[inline]
    pub fn term_offset_for(&self, position: i64) -> i32 {
        (position & (i64::from(self.term_length) - 1)) as i32
    }

    /// Position of the first byte of the term containing `position`.
    #[inline]
    pub fn term_begin_position(&self, position: i64) -> i64 {
        position & !(i64::from(self.term_length) - 1)
    }

    #[inline]
    pub fn partition_for_term(&self, term_id: i32) -> usize {
        partition_index_for_term(term_id, self.initial_term_id)
    }

    #[inline]
    pub fn partition_for_position(&self, position: i64) -> usize {
        active_partition_index(position >> self.position_bits_to_shift, PARTITION_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_across_term_lengths() {
        for shift in 16..=30u32 {
            let term_length = 1i64 << shift;
            for term_count in [0i64, 1, 2, 3, 1_000, i64::from(i32::MAX)] {
                for offset in [0i64, 32, term_length / 2, term_length - 32] {
                    let position = encode(term_count, offset as i32, shift).unwrap();
                    assert_eq!(decode(position, shift), (term_count, offset as i32));
                }
            }
        }
    }

    #[test]
    fn test_encode_rejects_bad_offsets() {
        let shift = 16;
        assert!(matches!(
            encode(0, 1 << 16, shift),
            Err(PositionError::InvalidOffset { offset: 65536, term_length: 65536 })
        ));
        assert!(encode(0, -32, shift).is_err());
        assert!(encode(0, 33, shift).is_err());
        assert!(encode(0, 65504, shift).is_ok());
    }

    #[test]
    fn test_term_count_wraps() {
        assert_eq!(term_count_for(i32::MIN + 2, i32::MAX - 1), 4);
        assert_eq!(term_count_for(5, 5), 0);
        assert_eq!(term_count_for(4, 5), -1);

        // Repeated +1 stepping across the wrap agrees with direct subtraction.
        let initial = i32::MAX - 3;
        let mut term_id = initial;
        for expected in 0..10 {
            assert_eq!(term_count_for(term_id, initial), expected);
            term_id = term_id.wrapping_add(1);
        }
    }

    #[test]
    fn test_partition_index_is_non_negative() {
        assert_eq!(active_partition_index(0, 3), 0);
        assert_eq!(active_partition_index(4, 3), 1);
        assert_eq!(active_partition_index(-1, 3), 2);
        assert_eq!(partition_index_for_term(i32::MIN + 2, i32::MAX - 1), 1);
    }

    #[test]
    fn test_is_after_handles_wrap() {
        assert!(is_after(i32::MIN, i32::MAX));
        assert!(!is_after(i32::MAX, i32::MIN));
        assert!(!is_after(7, 7));
    }

    #[test]
    fn test_check_term_length() {
        assert!(check_term_length(TERM_MIN_LENGTH).is_ok());
        assert!(check_term_length(TERM_MAX_LENGTH).is_ok());
        assert!(check_term_length(TERM_MIN_LENGTH / 2).is_err());
        assert!(check_term_length(TERM_MIN_LENGTH + 32).is_err());
        assert!(check_term_length(-TERM_MIN_LENGTH).is_err());
    }

    #[test]
    fn test_codec_position_for_term() {
        let codec = PositionCodec::new(64 * 1024, 100).unwrap();
        let position = codec.position_for(102, 4096).unwrap();
        assert_eq!(position, 2 * 64 * 1024 + 4096);
        assert_eq!(codec.term_id_for(position), 102);
        assert_eq!(codec.term_offset_for(position), 4096);
        assert_eq!(codec.term_begin_position(position), 2 * 64 * 1024);
        assert_eq!(codec.partition_for_term(102), 2);
        assert_eq!(codec.partition_for_position(position), 2);

        assert_eq!(
            codec.position_for(99, 0),
            Err(PositionError::InvalidTermId { term_id: 99, initial_term_id: 100 })
        );
    }

    #[test]
    fn test_align() {
        assert_eq!(align(0, FRAME_ALIGNMENT), 0);
        assert_eq!(align(1, FRAME_ALIGNMENT), 32);
        assert_eq!(align(32, FRAME_ALIGNMENT), 32);
        assert_eq!(align(33, FRAME_ALIGNMENT), 64);
    }
}
