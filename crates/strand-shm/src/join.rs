//! Starting an exclusive publication at an arbitrary position.
//!
//! An exclusive publication may begin mid-stream: at any term id at or
//! after the initial term id and at any frame-aligned offset inside that
//! term. Bytes before the join offset belong to whoever wrote them and are
//! never touched.

use strand_core::position::{check_term_length, is_frame_aligned, term_count_for};
use strand_core::{PositionError, PARTITION_COUNT};

use crate::layout::{check_mtu, pack_tail};
use crate::{LogBufferError, LogBufferPartitions};

/// A validated `(initial_term_id, term_id, term_offset)` starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExclusivePublicationJoin {
    initial_term_id: i32,
    term_id: i32,
    term_offset: i32,
    term_length: i32,
    mtu_length: i32,
}

/// Where a log was left by [`ExclusivePublicationJoin::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPoint {
    pub term_count: i32,
    pub partition_index: usize,
    pub position: i64,
}

impl ExclusivePublicationJoin {
    /// Validate a starting point of `term_id` and `term_offset` for a log
    /// starting at `initial_term_id`.
    pub fn new(
        initial_term_id: i32,
        term_id: i32,
        term_offset: i32,
        term_length: i32,
        mtu_length: i32,
    ) -> Result<Self, LogBufferError> {
        check_term_length(term_length)?;
        check_mtu(mtu_length, term_length)?;

        if term_count_for(term_id, initial_term_id) < 0 {
            return Err(PositionError::InvalidTermId {
                term_id,
                initial_term_id,
            }
            .into());
        }
        if term_offset < 0 || term_offset >= term_length || !is_frame_aligned(term_offset) {
            return Err(PositionError::InvalidOffset {
                offset: term_offset,
                term_length,
            }
            .into());
        }

        Ok(Self {
            initial_term_id,
            term_id,
            term_offset,
            term_length,
            mtu_length,
        })
    }

    /// Join at the very start of the stream.
    pub fn at_start(initial_term_id: i32, term_length: i32, mtu_length: i32) -> Result<Self, LogBufferError> {
        Self::new(initial_term_id, initial_term_id, 0, term_length, mtu_length)
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    pub fn term_id(&self) -> i32 {
        self.term_id
    }

    pub fn term_offset(&self) -> i32 {
        self.term_offset
    }

    /// Number of terms between the initial term and the joined one.
    pub fn term_count(&self) -> i32 {
        term_count_for(self.term_id, self.initial_term_id)
    }

    /// Partition the joined term lives in.
    pub fn partition_index(&self) -> usize {
        self.term_count() as usize % PARTITION_COUNT
    }

    /// Stream position of the join point.
    pub fn position(&self) -> i64 {
        let shift = self.term_length.trailing_zeros();
        (i64::from(self.term_count()) << shift) + i64::from(self.term_offset)
    }

    /// Whether a full MTU frame fits between the join offset and the end of
    /// the term. When it does not, the first write trips the term and the
    /// remainder becomes padding.
    pub fn first_frame_fits(&self) -> bool {
        self.term_offset + self.mtu_length <= self.term_length
    }

    /// Seed the tail counters and active term count of `log`.
    ///
    /// The partitions behind the active one are given the preceding term
    /// ids with a zero tail, so rotation treats them as already consumed.
    pub fn apply(&self, log: &LogBufferPartitions) -> Result<JoinPoint, LogBufferError> {
        if log.initial_term_id() != self.initial_term_id {
            return Err(LogBufferError::JoinMismatch("initial term id"));
        }
        if log.term_length() != self.term_length {
            return Err(LogBufferError::JoinMismatch("term length"));
        }
        if log.mtu_length() != self.mtu_length {
            return Err(LogBufferError::JoinMismatch("mtu length"));
        }

        let metadata = log.metadata();
        let index = self.partition_index();
        metadata.put_raw_tail_ordered(index, pack_tail(self.term_id, self.term_offset));
        for behind in 1..PARTITION_COUNT {
            let partition = (index + PARTITION_COUNT - behind) % PARTITION_COUNT;
            let term_id = self.term_id.wrapping_sub(behind as i32);
            metadata.put_raw_tail_ordered(partition, pack_tail(term_id, 0));
        }
        metadata.set_active_term_count_ordered(self.term_count());

        tracing::debug!(
            "joined log {} at term {} offset {} (position {})",
            metadata.registration_id(),
            self.term_id,
            self.term_offset,
            self.position()
        );

        Ok(JoinPoint {
            term_count: self.term_count(),
            partition_index: index,
            position: self.position(),
        })
    }
}
