//! Frame layout within a term.
//!
//! ```text
//!  0               4       5       6               8
//! ┌───────────────┬───────┬───────┬───────────────┐
//! │ frame length  │version│ flags │     type      │
//! ├───────────────┴───────┴───────┴───────────────┤
//! │ term offset (8)        │ session id (12)      │
//! ├────────────────────────┼──────────────────────┤
//! │ stream id (16)         │ term id (20)         │
//! ├────────────────────────┴──────────────────────┤
//! │ reserved value (24, i64)                      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The frame length doubles as the commit flag. A writer first stores the
//! negated length, fills in the rest of the frame, then publishes the
//! positive length with an ordered store. Readers stop at any length that
//! is zero or negative.

use crate::buffer::AtomicBuffer;

/// Length of the data frame header.
pub const HEADER_LENGTH: i32 = 32;

pub const FRAME_LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_VALUE_OFFSET: usize = 24;

pub const CURRENT_VERSION: u8 = 0;

pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

/// Largest MTU a publication may use.
pub const MAX_MTU_LENGTH: i32 = 64 * 1024;

/// Kind of frame stored in a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    /// Fills the tail of a term; readers skip it.
    Padding = 0,
    /// Application data.
    Data = 1,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Padding),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Fields that are the same for every frame of one publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTemplate {
    pub session_id: i32,
    pub stream_id: i32,
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl FrameHeader {
    /// Read the header at `offset`. The length is read with acquire
    /// semantics so the remaining fields are visible once it is positive.
    pub fn read(buffer: &AtomicBuffer, offset: usize) -> Self {
        let frame_length = frame_length_volatile(buffer, offset);
        Self {
            frame_length,
            version: buffer.get_u8(offset + VERSION_OFFSET),
            flags: buffer.get_u8(offset + FLAGS_OFFSET),
            frame_type: buffer.get_u16(offset + TYPE_OFFSET),
            term_offset: buffer.get_i32(offset + TERM_OFFSET_OFFSET),
            session_id: buffer.get_i32(offset + SESSION_ID_OFFSET),
            stream_id: buffer.get_i32(offset + STREAM_ID_OFFSET),
            term_id: buffer.get_i32(offset + TERM_ID_OFFSET),
            reserved_value: buffer.get_i64(offset + RESERVED_VALUE_OFFSET),
        }
    }

    #[inline]
    pub fn payload_length(&self) -> i32 {
        self.frame_length - HEADER_LENGTH
    }

    #[inline]
    pub fn is_padding(&self) -> bool {
        self.frame_type == FrameType::Padding as u16
    }

    #[inline]
    pub fn is_begin_fragment(&self) -> bool {
        self.flags & BEGIN_FRAG_FLAG == BEGIN_FRAG_FLAG
    }

    #[inline]
    pub fn is_end_fragment(&self) -> bool {
        self.flags & END_FRAG_FLAG == END_FRAG_FLAG
    }
}

#[inline]
pub fn frame_length_volatile(buffer: &AtomicBuffer, offset: usize) -> i32 {
    buffer.get_i32_volatile(offset + FRAME_LENGTH_OFFSET)
}

/// Publish a frame by storing its final length.
#[inline]
pub fn frame_length_ordered(buffer: &AtomicBuffer, offset: usize, length: i32) {
    buffer.put_i32_ordered(offset + FRAME_LENGTH_OFFSET, length)
}

/// Write every header field except the committed length.
///
/// The length is stored negated so readers treat the frame as in progress
/// until [`frame_length_ordered`] publishes it.
pub fn write_header(
    buffer: &AtomicBuffer,
    offset: usize,
    frame_length: i32,
    template: HeaderTemplate,
    term_id: i32,
    flags: u8,
    frame_type: FrameType,
) {
    buffer.put_i32_ordered(offset + FRAME_LENGTH_OFFSET, -frame_length);
    buffer.put_u8(offset + VERSION_OFFSET, CURRENT_VERSION);
    buffer.put_u8(offset + FLAGS_OFFSET, flags);
    buffer.put_u16(offset + TYPE_OFFSET, frame_type as u16);
    buffer.put_i32(offset + TERM_OFFSET_OFFSET, offset as i32);
    buffer.put_i32(offset + SESSION_ID_OFFSET, template.session_id);
    buffer.put_i32(offset + STREAM_ID_OFFSET, template.stream_id);
    buffer.put_i32(offset + TERM_ID_OFFSET, term_id);
    buffer.put_i64(offset + RESERVED_VALUE_OFFSET, 0);
}

/// Largest message a publication accepts for `term_length`.
#[inline]
pub fn max_message_length(term_length: i32) -> i32 {
    term_length / 8
}

/// Largest payload carried by one frame at `mtu_length`.
#[inline]
pub fn max_payload_length(mtu_length: i32) -> i32 {
    mtu_length - HEADER_LENGTH
}
