//! Writing frames into claimed term space.

use strand_core::frame::{
    frame_length_ordered, write_header, BEGIN_FRAG_FLAG, END_FRAG_FLAG, UNFRAGMENTED,
};
use strand_core::position::align;
use strand_core::{AtomicBuffer, FrameType, HeaderTemplate, FRAME_ALIGNMENT, HEADER_LENGTH};

use crate::log_buffer::{FrameSlot, PaddingRegion};

/// Bytes a message of `message_length` occupies once split into frames of
/// at most `max_payload` bytes each.
pub fn framed_length(message_length: usize, max_payload: usize) -> i32 {
    let max_payload = max_payload.max(1);
    let full_frames = message_length / max_payload;
    let remainder = message_length % max_payload;
    let full = full_frames as i32 * align(max_payload as i32 + HEADER_LENGTH, FRAME_ALIGNMENT);

    if remainder > 0 || full_frames == 0 {
        full + align(remainder as i32 + HEADER_LENGTH, FRAME_ALIGNMENT)
    } else {
        full
    }
}

/// Write `payload` into `slot`, one frame per `max_payload` bytes.
///
/// Each frame becomes visible to readers on its own once its length is
/// stored; the slot must have been sized with [`framed_length`].
pub fn append_message(
    term: &AtomicBuffer,
    slot: FrameSlot,
    template: HeaderTemplate,
    max_payload: usize,
    payload: &[u8],
) {
    if payload.is_empty() {
        write_frame(term, slot.term_offset, slot.term_id, template, UNFRAGMENTED, &[]);
        return;
    }

    let mut offset = slot.term_offset;
    let mut chunks = payload.chunks(max_payload.max(1)).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let mut flags = 0;
        if first {
            flags |= BEGIN_FRAG_FLAG;
        }
        if chunks.peek().is_none() {
            flags |= END_FRAG_FLAG;
        }
        first = false;

        let frame_length = write_frame(term, offset, slot.term_id, template, flags, chunk);
        offset += align(frame_length, FRAME_ALIGNMENT);
    }
}

/// Fill the tail of a term so readers skip straight to the next term.
pub fn append_padding(
    term: &AtomicBuffer,
    region: PaddingRegion,
    term_id: i32,
    template: HeaderTemplate,
) {
    let offset = region.term_offset as usize;
    write_header(
        term,
        offset,
        region.length,
        template,
        term_id,
        UNFRAGMENTED,
        FrameType::Padding,
    );
    frame_length_ordered(term, offset, region.length);
}

fn write_frame(
    term: &AtomicBuffer,
    term_offset: i32,
    term_id: i32,
    template: HeaderTemplate,
    flags: u8,
    payload: &[u8],
) -> i32 {
    let offset = term_offset as usize;
    let frame_length = HEADER_LENGTH + payload.len() as i32;
    write_header(
        term,
        offset,
        frame_length,
        template,
        term_id,
        flags,
        FrameType::Data,
    );
    term.put_bytes(offset + HEADER_LENGTH as usize, payload);
    frame_length_ordered(term, offset, frame_length);
    frame_length
}

#[cfg(test)]
mod tests {
    use strand_core::FrameHeader;

    use super::*;

    const TEMPLATE: HeaderTemplate = HeaderTemplate {
        session_id: 3,
        stream_id: 7,
    };

    #[test]
    fn test_framed_length() {
        assert_eq!(framed_length(0, 1024), 32);
        assert_eq!(framed_length(1, 1024), 64);
        assert_eq!(framed_length(32, 1024), 64);
        assert_eq!(framed_length(33, 1024), 96);
        // Two full frames of 96 + 32 header = 128 each, then a 10 byte tail.
        assert_eq!(framed_length(202, 96), 128 + 128 + 64);
        assert_eq!(framed_length(192, 96), 256);
    }

    #[test]
    fn test_single_frame() {
        let term = AtomicBuffer::allocate(4096);
        let slot = FrameSlot {
            term_id: 12,
            term_offset: 64,
            length: framed_length(5, 1024),
        };
        append_message(&term, slot, TEMPLATE, 1024, b"hello");

        let header = FrameHeader::read(&term, 64);
        assert_eq!(header.frame_length, 37);
        assert_eq!(header.term_offset, 64);
        assert_eq!(header.term_id, 12);
        assert_eq!(header.flags, UNFRAGMENTED);
        assert_eq!(header.session_id, 3);
        assert_eq!(header.stream_id, 7);
        assert_eq!(term.to_vec(96, 5), b"hello");
    }

    #[test]
    fn test_fragmented_message_flags() {
        let term = AtomicBuffer::allocate(4096);
        let payload: Vec<u8> = (0..200u8).collect();
        let slot = FrameSlot {
            term_id: 0,
            term_offset: 0,
            length: framed_length(payload.len(), 96),
        };
        append_message(&term, slot, TEMPLATE, 96, &payload);

        let first = FrameHeader::read(&term, 0);
        let second = FrameHeader::read(&term, 128);
        let third = FrameHeader::read(&term, 256);
        assert_eq!(first.flags, BEGIN_FRAG_FLAG);
        assert_eq!(second.flags, 0);
        assert_eq!(third.flags, END_FRAG_FLAG);
        assert_eq!(third.payload_length(), 8);
        assert_eq!(term.to_vec(256 + 32, 8), &payload[192..]);
    }

    #[test]
    fn test_padding_frame() {
        let term = AtomicBuffer::allocate(4096);
        append_padding(
            &term,
            PaddingRegion {
                term_offset: 4064,
                length: 32,
            },
            4,
            TEMPLATE,
        );
        let header = FrameHeader::read(&term, 4064);
        assert!(header.is_padding());
        assert_eq!(header.frame_length, 32);
        assert_eq!(header.term_id, 4);
    }
}
