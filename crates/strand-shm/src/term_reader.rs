//! Scanning committed frames out of a term.

use strand_core::position::align;
use strand_core::{AtomicBuffer, FrameHeader, FRAME_ALIGNMENT, HEADER_LENGTH};

/// Result of one [`read`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub fragments_read: usize,
    /// Term offset just past the last frame consumed, padding included.
    pub offset: i32,
}

/// Deliver up to `fragment_limit` data frames starting at `term_offset`.
///
/// Stops at the first frame that is uncommitted or belongs to a term other
/// than `term_id`. Padding frames are consumed without being delivered.
pub fn read<F>(
    term: &AtomicBuffer,
    term_offset: i32,
    term_id: i32,
    fragment_limit: usize,
    mut handler: F,
) -> ReadOutcome
where
    F: FnMut(&[u8], &FrameHeader),
{
    let capacity = term.capacity() as i32;
    let mut offset = term_offset;
    let mut fragments_read = 0;
    let mut payload = Vec::new();

    while fragments_read < fragment_limit && offset < capacity {
        let header = FrameHeader::read(term, offset as usize);
        if header.frame_length <= 0 || header.term_id != term_id {
            break;
        }

        let frame_offset = offset;
        offset += align(header.frame_length, FRAME_ALIGNMENT);
        if header.is_padding() {
            continue;
        }

        payload.resize(header.payload_length() as usize, 0);
        term.get_bytes(frame_offset as usize + HEADER_LENGTH as usize, &mut payload);
        handler(&payload, &header);
        fragments_read += 1;
    }

    ReadOutcome {
        fragments_read,
        offset,
    }
}

/// Joins fragmented messages back together before handing them on.
///
/// Unfragmented frames pass straight through. A fragment that arrives
/// without a preceding begin fragment is dropped.
pub struct FragmentAssembler<F> {
    handler: F,
    pending: Vec<u8>,
    in_progress: bool,
}

impl<F> FragmentAssembler<F>
where
    F: FnMut(&[u8], &FrameHeader),
{
    /// Deliver whole messages to `handler`.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            pending: Vec::new(),
            in_progress: false,
        }
    }

    /// Feed one fragment. Fragments must arrive in order.
    pub fn on_fragment(&mut self, payload: &[u8], header: &FrameHeader) {
        match (header.is_begin_fragment(), header.is_end_fragment()) {
            (true, true) => (self.handler)(payload, header),
            (true, false) => {
                self.pending.clear();
                self.pending.extend_from_slice(payload);
                self.in_progress = true;
            }
            (false, end) => {
                if !self.in_progress {
                    return;
                }
                self.pending.extend_from_slice(payload);
                if end {
                    self.in_progress = false;
                    (self.handler)(&self.pending, header);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use strand_core::HeaderTemplate;

    use super::*;
    use crate::log_buffer::{FrameSlot, PaddingRegion};
    use crate::term_appender::{append_message, append_padding, framed_length};

    const TEMPLATE: HeaderTemplate = HeaderTemplate {
        session_id: 1,
        stream_id: 2,
    };

    fn append(term: &AtomicBuffer, term_id: i32, offset: i32, payload: &[u8], max_payload: usize) -> i32 {
        let length = framed_length(payload.len(), max_payload);
        append_message(
            term,
            FrameSlot {
                term_id,
                term_offset: offset,
                length,
            },
            TEMPLATE,
            max_payload,
            payload,
        );
        offset + length
    }

    #[test]
    fn test_reads_committed_frames_in_order() {
        let term = AtomicBuffer::allocate(4096);
        let mut offset = 0;
        for msg in [&b"one"[..], b"two", b"three"] {
            offset = append(&term, 5, offset, msg, 1024);
        }

        let mut seen = Vec::new();
        let outcome = read(&term, 0, 5, 10, |payload, _| seen.push(payload.to_vec()));
        assert_eq!(outcome.fragments_read, 3);
        assert_eq!(outcome.offset, offset);
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_respects_fragment_limit() {
        let term = AtomicBuffer::allocate(4096);
        let mut offset = 0;
        for _ in 0..4 {
            offset = append(&term, 0, offset, b"x", 1024);
        }
        let outcome = read(&term, 0, 0, 2, |_, _| {});
        assert_eq!(outcome, ReadOutcome { fragments_read: 2, offset: 128 });
    }

    #[test]
    fn test_stops_at_uncommitted_and_foreign_term() {
        let term = AtomicBuffer::allocate(4096);
        let next = append(&term, 0, 0, b"a", 1024);
        append(&term, 1, next, b"stale", 1024);

        let outcome = read(&term, 0, 0, 10, |_, _| {});
        assert_eq!(outcome, ReadOutcome { fragments_read: 1, offset: next });

        let empty = read(&term, 1024, 0, 10, |_, _| {});
        assert_eq!(empty, ReadOutcome { fragments_read: 0, offset: 1024 });
    }

    #[test]
    fn test_skips_padding() {
        let term = AtomicBuffer::allocate(4096);
        append_padding(
            &term,
            PaddingRegion {
                term_offset: 0,
                length: 4096,
            },
            0,
            TEMPLATE,
        );
        let outcome = read(&term, 0, 0, 10, |_, _| panic!("padding delivered"));
        assert_eq!(outcome, ReadOutcome { fragments_read: 0, offset: 4096 });
    }

    #[test]
    fn test_assembler_rebuilds_message() {
        let term = AtomicBuffer::allocate(4096);
        let payload: Vec<u8> = (0..250u8).collect();
        let next = append(&term, 0, 0, &payload, 64);
        append(&term, 0, next, b"tail", 64);

        let mut messages = Vec::new();
        let mut assembler = FragmentAssembler::new(|msg: &[u8], _: &FrameHeader| messages.push(msg.to_vec()));
        let outcome = read(&term, 0, 0, 100, |p, h| assembler.on_fragment(p, h));
        drop(assembler);

        assert_eq!(outcome.fragments_read, 5);
        assert_eq!(messages, vec![payload, b"tail".to_vec()]);
    }
}
