//! A publication writer and one image over a heap log buffer, checked
//! against the sequence of messages actually published.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use strand_core::{AtomicBuffer, FrameHeader, TERM_MIN_LENGTH};
use strand_shm::layout::{compute_log_length, LogParams};
use strand_shm::{FragmentAssembler, Image, LogBufferPartitions, OfferOutcome, PublicationWriter};

const TERM_LENGTH: i32 = TERM_MIN_LENGTH;
const MTU_CHOICES: [i32; 3] = [1408, 4096, 8192];

#[derive(Clone, Copy, Debug)]
pub enum LogOp {
    Offer { length: usize },
    Poll { limit: usize },
    /// Poll until the image reaches the producer.
    CatchUp,
}

pub fn mtu_from(byte: u8) -> i32 {
    MTU_CHOICES[byte as usize % MTU_CHOICES.len()]
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(initial_term_id: i32, mtu_length: i32, ops: &[LogOp]) -> Result<(), String> {
    let params = LogParams {
        term_length: TERM_LENGTH,
        mtu_length,
        initial_term_id,
        session_id: 1,
        stream_id: 1,
        registration_id: 1,
    };
    let log = LogBufferPartitions::create(AtomicBuffer::allocate(compute_log_length(TERM_LENGTH)), &params)
        .map_err(|e| format!("log setup: {e}"))?;
    let log = Arc::new(log);
    let writer = PublicationWriter::new(Arc::clone(&log));
    let mut image = Image::new(Arc::clone(&log), 0, 1).map_err(|e| format!("image setup: {e}"))?;

    let delivered = RefCell::new(Vec::new());
    let mut assembler = FragmentAssembler::new(|payload: &[u8], _: &FrameHeader| {
        delivered.borrow_mut().push(payload.to_vec());
    });
    let mut expected: VecDeque<Vec<u8>> = VecDeque::new();
    let mut last_position = 0i64;
    let mut sequence = 0u32;

    for (i, op) in ops.iter().enumerate() {
        match *op {
            LogOp::Offer { length } => {
                let length = length % (writer.max_message_length() + 1);
                let payload = vec![(sequence % 251) as u8; length];
                let caught_up = image.position() == log.producer_position();

                match writer.offer(&payload).map_err(|e| format!("op {i}: offer failed: {e}"))? {
                    OfferOutcome::Published { position } => {
                        if position <= last_position {
                            return Err(format!("op {i}: position {position} after {last_position}"));
                        }
                        if position != log.producer_position() {
                            return Err(format!(
                                "op {i}: published at {position}, producer at {}",
                                log.producer_position()
                            ));
                        }
                        last_position = position;
                        sequence = sequence.wrapping_add(1);
                        expected.push_back(payload);
                    }
                    OfferOutcome::Rotated => {}
                    OfferOutcome::PartitionNotFree if caught_up => {
                        return Err(format!("op {i}: blocked on a partition with no consumer behind"));
                    }
                    OfferOutcome::PartitionNotFree => {}
                }
            }
            LogOp::Poll { limit } => {
                image.poll(|payload, header| assembler.on_fragment(payload, header), 1 + limit % 16);
            }
            LogOp::CatchUp => {
                for _ in 0..8 {
                    if image.position() == log.producer_position() {
                        break;
                    }
                    image.poll(|payload, header| assembler.on_fragment(payload, header), usize::MAX);
                }
                if image.position() != log.producer_position() {
                    return Err(format!(
                        "op {i}: image stuck at {} behind producer {}",
                        image.position(),
                        log.producer_position()
                    ));
                }
            }
        }

        for payload in delivered.borrow_mut().drain(..) {
            match expected.pop_front() {
                Some(want) if want == payload => {}
                Some(want) => {
                    return Err(format!(
                        "op {i}: delivered {} bytes of {:?}, expected {} bytes of {:?}",
                        payload.len(),
                        payload.first(),
                        want.len(),
                        want.first()
                    ));
                }
                None => return Err(format!("op {i}: delivered a message nobody published")),
            }
        }
        verify_positions(&log, &image, i)?;
    }

    Ok(())
}

fn verify_positions(log: &LogBufferPartitions, image: &Image, op: usize) -> Result<(), String> {
    let producer = log.producer_position();
    let consumer = image.position();
    if consumer > producer {
        return Err(format!("after op {op}: image at {consumer} ahead of producer {producer}"));
    }
    if producer - consumer > 3 * i64::from(TERM_LENGTH) {
        return Err(format!("after op {op}: producer {producer} lapped image at {consumer}"));
    }
    if log.min_consumer_position() != Some(consumer) {
        return Err(format!(
            "after op {op}: consumer slot holds {:?}, image at {consumer}",
            log.min_consumer_position()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_messages_across_rotations() {
        let mut ops = Vec::new();
        for i in 0..2000 {
            ops.push(LogOp::Offer { length: 100 + i % 200 });
            if i % 10 == 0 {
                ops.push(LogOp::CatchUp);
            }
        }
        ops.push(LogOp::CatchUp);
        execute_and_verify(0, 1408, &ops).unwrap();
    }

    #[test]
    fn test_fragmented_messages_with_partial_polls() {
        let mut ops = Vec::new();
        for i in 0..300 {
            ops.push(LogOp::Offer { length: 3000 + i * 13 });
            ops.push(LogOp::Poll { limit: 2 });
        }
        ops.push(LogOp::CatchUp);
        execute_and_verify(-7, 1408, &ops).unwrap();
    }

    #[test]
    fn test_stalled_consumer_blocks_rotation() {
        let mut ops = vec![LogOp::Offer { length: 8000 }; 40];
        ops.push(LogOp::CatchUp);
        ops.extend([LogOp::Offer { length: 8000 }; 40]);
        ops.push(LogOp::CatchUp);
        execute_and_verify(i32::MAX - 1, 8192, &ops).unwrap();
    }
}
