//! A [`CommandRing`] checked against a FIFO queue.

use std::collections::VecDeque;

use strand_core::AtomicBuffer;
use strand_shm::ring::{ring_length, CommandRing, WriteOutcome};

/// Smallest ring capacity fuzzed.
pub const MIN_CAPACITY: usize = 256;
/// Largest ring capacity fuzzed. Small rings wrap often.
pub const MAX_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub enum RingOp {
    Write { msg_type_id: i32, length: usize },
    Read { limit: usize },
    /// Read until the ring is empty.
    Drain,
    NextCorrelationId,
}

/// Map an arbitrary byte to a power of two capacity in range.
pub fn capacity_from(byte: u8) -> usize {
    (MIN_CAPACITY << (byte % 5)).min(MAX_CAPACITY)
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(capacity: usize, ops: &[RingOp]) -> Result<(), String> {
    let ring = CommandRing::new(AtomicBuffer::allocate(ring_length(capacity)))
        .map_err(|e| format!("ring setup: {e}"))?;
    let mut expected: VecDeque<(i32, Vec<u8>)> = VecDeque::new();
    let mut last_correlation_id: Option<i64> = None;
    let mut sequence = 0u32;

    for (i, op) in ops.iter().enumerate() {
        match *op {
            RingOp::Write { msg_type_id, length } => {
                let msg_type_id = 1 + msg_type_id.rem_euclid(1000);
                let length = length % (ring.max_msg_length() + 1);
                let payload = vec![(sequence % 251) as u8; length];
                sequence = sequence.wrapping_add(1);

                let outcome = ring
                    .write(msg_type_id, &payload)
                    .map_err(|e| format!("op {i}: write rejected: {e}"))?;
                match outcome {
                    WriteOutcome::Written => expected.push_back((msg_type_id, payload)),
                    WriteOutcome::InsufficientCapacity if expected.is_empty() => {
                        return Err(format!(
                            "op {i}: empty ring of {capacity} bytes refused a {length} byte message"
                        ));
                    }
                    WriteOutcome::InsufficientCapacity => {}
                }
            }
            RingOp::Read { limit } => {
                let limit = 1 + limit % 8;
                read_and_compare(&ring, &mut expected, limit, i)?;
            }
            RingOp::Drain => {
                // A wrapped ring needs one read for the padding at the end
                // and one for the records at the start.
                for _ in 0..3 {
                    read_and_compare(&ring, &mut expected, usize::MAX, i)?;
                }
                if !expected.is_empty() {
                    return Err(format!("op {i}: {} records left after drain", expected.len()));
                }
                if ring.size() != 0 {
                    return Err(format!("op {i}: drained ring still holds {} bytes", ring.size()));
                }
            }
            RingOp::NextCorrelationId => {
                let id = ring.next_correlation_id();
                if let Some(last) = last_correlation_id {
                    if id != last + 1 {
                        return Err(format!("op {i}: correlation id {id} after {last}"));
                    }
                }
                last_correlation_id = Some(id);
            }
        }

        if ring.size() > ring.capacity() {
            return Err(format!(
                "after op {i}: size {} exceeds capacity {}",
                ring.size(),
                ring.capacity()
            ));
        }
    }

    Ok(())
}

fn read_and_compare(
    ring: &CommandRing,
    expected: &mut VecDeque<(i32, Vec<u8>)>,
    limit: usize,
    op: usize,
) -> Result<(), String> {
    let mut seen = Vec::new();
    let count = ring.read(|msg_type_id, payload| seen.push((msg_type_id, payload.to_vec())), limit);

    if count != seen.len() || count > limit {
        return Err(format!("op {op}: read reported {count} records, handled {}", seen.len()));
    }
    for (msg_type_id, payload) in seen {
        match expected.pop_front() {
            Some((want_type, want_payload)) if want_type == msg_type_id && want_payload == payload => {}
            Some((want_type, want_payload)) => {
                return Err(format!(
                    "op {op}: read type {msg_type_id} len {}, expected type {want_type} len {}",
                    payload.len(),
                    want_payload.len()
                ));
            }
            None => return Err(format!("op {op}: read type {msg_type_id} from an empty ring")),
        }
    }
    Ok(())
}
