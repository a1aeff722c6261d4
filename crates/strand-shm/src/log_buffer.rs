//! The three-partition log buffer.

use std::path::Path;
use std::sync::Arc;

use strand_core::position::{active_partition_index, align, term_count_for};
use strand_core::{AtomicBuffer, PositionCodec, FRAME_ALIGNMENT, PARTITION_COUNT};

use crate::layout::{
    compute_log_length, pack_tail, tail_offset, tail_term_id, LogMetadata, LogParams,
    LOG_META_DATA_LENGTH, MAX_CONSUMERS, NO_CONSUMER,
};
use crate::{LogBufferError, MappedRegion};

/// Space reserved in a term by a successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

/// Space between a failed claim and the end of the term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingRegion {
    pub term_offset: i32,
    pub length: i32,
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(FrameSlot),
    /// The term is full. The claimer that tripped the end of the term gets
    /// the leftover space and must fill it with a padding frame.
    RotationNeeded {
        term_id: i32,
        padding: Option<PaddingRegion>,
    },
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated { next_index: usize, term_id: i32 },
    /// A consumer has not yet moved past the term the next partition holds.
    PartitionNotFree { index: usize },
    /// Another party rotated first, or the term count was stale.
    AlreadyRotated,
}

/// Handle to a registered consumer position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerSlot(usize);

impl ConsumerSlot {
    /// Index of the slot in the metadata trailer.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Three equal term partitions plus the metadata trailer.
///
/// Producers claim space with [`claim`](Self::claim) on the active
/// partition. When a claim reports [`ClaimOutcome::RotationNeeded`], any
/// producer may call [`rotate`](Self::rotate): a lock word in the metadata
/// trailer lets exactly one of them move the log on, even when the writers
/// live in different processes.
#[derive(Debug, Clone)]
pub struct LogBufferPartitions {
    terms: [AtomicBuffer; PARTITION_COUNT],
    metadata: LogMetadata,
    codec: PositionCodec,
    mtu_length: i32,
}

impl LogBufferPartitions {
    /// Wrap a buffer whose metadata is already initialised.
    pub fn wrap(buffer: AtomicBuffer) -> Result<Self, LogBufferError> {
        let capacity = buffer.capacity();
        if capacity < LOG_META_DATA_LENGTH {
            return Err(LogBufferError::LengthMismatch {
                expected: LOG_META_DATA_LENGTH,
                actual: capacity,
            });
        }

        let metadata = LogMetadata::new(buffer.view(capacity - LOG_META_DATA_LENGTH, LOG_META_DATA_LENGTH))?;
        let params = metadata.params();
        params.validate()?;

        let expected = compute_log_length(params.term_length);
        if capacity != expected {
            return Err(LogBufferError::LengthMismatch {
                expected,
                actual: capacity,
            });
        }

        let term_length = params.term_length as usize;
        let terms = std::array::from_fn(|i| buffer.view(i * term_length, term_length));
        let codec = PositionCodec::new(params.term_length, params.initial_term_id)?;

        Ok(Self {
            terms,
            metadata,
            codec,
            mtu_length: params.mtu_length,
        })
    }

    /// Initialise the metadata of a fresh buffer and wrap it.
    pub fn create(buffer: AtomicBuffer, params: &LogParams) -> Result<Self, LogBufferError> {
        params.validate()?;
        let expected = compute_log_length(params.term_length);
        if buffer.capacity() != expected {
            return Err(LogBufferError::LengthMismatch {
                expected,
                actual: buffer.capacity(),
            });
        }

        let metadata = LogMetadata::new(buffer.view(expected - LOG_META_DATA_LENGTH, LOG_META_DATA_LENGTH))?;
        metadata.initialise(params);
        Self::wrap(buffer)
    }

    /// Create a log file at `path` and initialise it.
    pub fn create_file(path: &Path, params: &LogParams) -> Result<Self, LogBufferError> {
        params.validate()?;
        let region = MappedRegion::create(path, compute_log_length(params.term_length))?;
        Self::create(AtomicBuffer::new(Arc::new(region)), params)
    }

    /// Map an existing log file.
    pub fn map_file(path: &Path) -> Result<Self, LogBufferError> {
        let region = MappedRegion::open(path)?;
        Self::wrap(AtomicBuffer::new(Arc::new(region)))
    }

    pub fn term_length(&self) -> i32 {
        self.codec.term_length()
    }

    pub fn mtu_length(&self) -> i32 {
        self.mtu_length
    }

    pub fn initial_term_id(&self) -> i32 {
        self.codec.initial_term_id()
    }

    /// Position arithmetic for this log's term length and initial term id.
    pub fn codec(&self) -> &PositionCodec {
        &self.codec
    }

    /// The metadata trailer.
    pub fn metadata(&self) -> &LogMetadata {
        &self.metadata
    }

    /// Partition `index`, one term long.
    pub fn term_buffer(&self, index: usize) -> &AtomicBuffer {
        &self.terms[index]
    }

    /// Number of terms the log has moved through since the initial term.
    pub fn active_term_count(&self) -> i32 {
        self.metadata.active_term_count()
    }

    /// Partition that producers currently claim from.
    pub fn active_partition_index(&self) -> usize {
        active_partition_index(i64::from(self.active_term_count()), PARTITION_COUNT)
    }

    /// Position just past everything claimed in the active term.
    pub fn producer_position(&self) -> i64 {
        let index = self.active_partition_index();
        let raw_tail = self.metadata.raw_tail_volatile(index);
        let term_count = term_count_for(tail_term_id(raw_tail), self.codec.initial_term_id());
        let offset = tail_offset(raw_tail, self.term_length());
        (i64::from(term_count) << self.codec.position_bits_to_shift()) + i64::from(offset)
    }

    /// Reserve `length` bytes (rounded up to the frame alignment) in
    /// partition `index`.
    ///
    /// `length` must be in `1..=term_length`; anything else is refused
    /// before the tail moves.
    pub fn claim(&self, index: usize, length: i32) -> Result<ClaimOutcome, LogBufferError> {
        let term_length = self.term_length();
        if length <= 0 || length > term_length {
            return Err(LogBufferError::InvalidClaimLength { length, term_length });
        }
        let term_length = i64::from(term_length);

        // Once a term has tripped, stop advancing its tail so repeated
        // attempts cannot carry into the term id bits.
        let current = self.metadata.raw_tail_volatile(index);
        if current & 0xFFFF_FFFF >= term_length {
            return Ok(ClaimOutcome::RotationNeeded {
                term_id: tail_term_id(current),
                padding: None,
            });
        }

        let aligned = align(length, FRAME_ALIGNMENT);
        let raw_tail = self.metadata.get_and_add_raw_tail(index, i64::from(aligned));
        let term_id = tail_term_id(raw_tail);
        let offset = raw_tail & 0xFFFF_FFFF;

        if offset + i64::from(aligned) > term_length {
            let padding = (offset < term_length).then(|| PaddingRegion {
                term_offset: offset as i32,
                length: (term_length - offset) as i32,
            });
            return Ok(ClaimOutcome::RotationNeeded { term_id, padding });
        }

        Ok(ClaimOutcome::Claimed(FrameSlot {
            term_id,
            term_offset: offset as i32,
            length: aligned,
        }))
    }

    /// Move from `term_count` to the next term.
    ///
    /// Safe to call from any number of writers. The caller that wins the
    /// rotation lock zeroes and reopens the next partition; everyone else,
    /// including a winner whose `term_count` went stale while it waited,
    /// gets [`RotateOutcome::AlreadyRotated`] and should simply retry.
    pub fn rotate(&self, term_count: i32) -> RotateOutcome {
        if self.active_term_count() != term_count || !self.metadata.try_lock_rotation() {
            return RotateOutcome::AlreadyRotated;
        }
        let outcome = self.rotate_locked(term_count);
        self.metadata.unlock_rotation();
        outcome
    }

    fn rotate_locked(&self, term_count: i32) -> RotateOutcome {
        // Another writer may have finished a rotation between our check and
        // taking the lock.
        if self.active_term_count() != term_count {
            return RotateOutcome::AlreadyRotated;
        }

        let current_index = active_partition_index(i64::from(term_count), PARTITION_COUNT);
        let next_index = (current_index + 1) % PARTITION_COUNT;
        let current_term_id = tail_term_id(self.metadata.raw_tail_volatile(current_index));
        let next_term_id = current_term_id.wrapping_add(1);

        if !self.is_partition_free(next_index) {
            return RotateOutcome::PartitionNotFree { index: next_index };
        }

        let term_length = self.term_length() as usize;
        self.terms[next_index].set_memory(0, term_length, 0);
        self.metadata
            .put_raw_tail_ordered(next_index, pack_tail(next_term_id, 0));

        if self
            .metadata
            .cas_active_term_count(term_count, term_count.wrapping_add(1))
        {
            tracing::trace!(
                "rotated to term {} in partition {}",
                next_term_id,
                next_index
            );
            RotateOutcome::Rotated {
                next_index,
                term_id: next_term_id,
            }
        } else {
            RotateOutcome::AlreadyRotated
        }
    }

    /// Whether every consumer has moved past the term partition `index`
    /// currently holds.
    pub fn is_partition_free(&self, index: usize) -> bool {
        let term_id = tail_term_id(self.metadata.raw_tail_volatile(index));
        let term_count = term_count_for(term_id, self.codec.initial_term_id());
        if term_count < 0 {
            return true;
        }

        let term_end = (i64::from(term_count) + 1) << self.codec.position_bits_to_shift();
        match self.min_consumer_position() {
            Some(min) => min >= term_end,
            None => true,
        }
    }

    /// Take a free consumer slot, starting at `position`. The slot holds
    /// back rotation until [`release_consumer`](Self::release_consumer).
    pub fn register_consumer(&self, position: i64) -> Result<ConsumerSlot, LogBufferError> {
        (0..MAX_CONSUMERS)
            .find(|&slot| {
                self.metadata
                    .cas_consumer_position(slot, NO_CONSUMER, position)
            })
            .map(ConsumerSlot)
            .ok_or(LogBufferError::NoConsumerSlot(MAX_CONSUMERS))
    }

    /// Publish a consumer's progress.
    pub fn update_consumer(&self, slot: ConsumerSlot, position: i64) {
        self.metadata.set_consumer_position_ordered(slot.0, position);
    }

    /// Give the slot back so it no longer holds back rotation.
    pub fn release_consumer(&self, slot: ConsumerSlot) {
        self.metadata
            .set_consumer_position_ordered(slot.0, NO_CONSUMER);
    }

    pub fn consumer_position(&self, slot: ConsumerSlot) -> i64 {
        self.metadata.consumer_position(slot.0)
    }

    /// Lowest registered consumer position, if any consumer is registered.
    pub fn min_consumer_position(&self) -> Option<i64> {
        (0..MAX_CONSUMERS)
            .map(|slot| self.metadata.consumer_position(slot))
            .filter(|&position| position != NO_CONSUMER)
            .min()
    }
}
