//! Bolero fuzzer for offering to and polling from a log buffer.
//!
//! Properties tested:
//! - Every published message is delivered once, in order, reassembled
//! - Published positions strictly increase and match the producer position
//! - A consumer that has caught up never blocks a rotation
//! - The producer never laps the consumer

use bolero::check;
use strand_fuzz::log_model::{execute_and_verify, mtu_from, LogOp};

#[derive(Debug, Clone, bolero::TypeGenerator)]
enum LogOpInput {
    Offer { length: u16 },
    Poll { limit: u8 },
    CatchUp,
}

impl LogOpInput {
    fn to_log_op(&self) -> LogOp {
        match *self {
            LogOpInput::Offer { length } => LogOp::Offer {
                length: usize::from(length),
            },
            LogOpInput::Poll { limit } => LogOp::Poll {
                limit: usize::from(limit),
            },
            LogOpInput::CatchUp => LogOp::CatchUp,
        }
    }
}

fn main() {
    check!()
        .with_type::<(i32, u8, Vec<LogOpInput>)>()
        .for_each(|(initial_term_id, mtu_byte, ops)| {
            let ops: Vec<LogOp> = ops.iter().map(LogOpInput::to_log_op).collect();
            if let Err(e) = execute_and_verify(*initial_term_id, mtu_from(*mtu_byte), &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}
