//! The client's correlation registry checked against a map of expected
//! states. Once a request leaves `Pending` it must never change again, and
//! failed requests must not outlive the retention period.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use strand_client::registry::{PendingState, Registry, ResourceKind};
use strand_core::ErrorCode;

const DRIVER_TIMEOUT: Duration = Duration::from_millis(50);
const RETENTION: Duration = Duration::from_millis(80);

#[derive(Clone, Copy, Debug)]
pub enum RegistryOp {
    Register { correlation_id: u8 },
    Fail { correlation_id: u8 },
    TimeOut { correlation_id: u8 },
    Advance { millis: u8 },
    Expire,
    Remove { correlation_id: u8 },
    TakeFailure { correlation_id: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expected {
    Pending { deadline: Duration },
    TimedOut { forget_at: Duration },
    Errored { forget_at: Duration },
}

impl Expected {
    fn same_kind(&self, state: &PendingState) -> bool {
        matches!(
            (self, state),
            (Expected::Pending { .. }, PendingState::Pending)
                | (Expected::TimedOut { .. }, PendingState::TimedOut)
                | (Expected::Errored { .. }, PendingState::Errored { .. })
        )
    }
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(ops: &[RegistryOp]) -> Result<(), String> {
    let origin = Instant::now();
    let mut now = Duration::ZERO;
    let mut registry = Registry::new(RETENTION);
    let mut expected: HashMap<i64, Expected> = HashMap::new();
    let mut abandoned: HashMap<i64, Duration> = HashMap::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            RegistryOp::Register { correlation_id } => {
                let id = i64::from(correlation_id);
                let deadline = now + DRIVER_TIMEOUT;
                registry.register(id, ResourceKind::Subscription, "strand:ipc", 1, origin + deadline);
                expected.insert(id, Expected::Pending { deadline });
            }
            RegistryOp::Fail { correlation_id } | RegistryOp::TimeOut { correlation_id } => {
                let id = i64::from(correlation_id);
                let (state, terminal) = match op {
                    RegistryOp::Fail { .. } => (
                        PendingState::Errored {
                            code: ErrorCode::InvalidChannel,
                            message: "rejected".into(),
                        },
                        Expected::Errored { forget_at: now + RETENTION },
                    ),
                    _ => (PendingState::TimedOut, Expected::TimedOut { forget_at: now + RETENTION }),
                };
                let was_pending = matches!(expected.get(&id), Some(Expected::Pending { .. }));
                if registry.settle(id, state, origin + now) != was_pending {
                    return Err(format!("op {i}: settle of {id} disagreed, pending was {was_pending}"));
                }
                if was_pending {
                    expected.insert(id, terminal);
                }
            }
            RegistryOp::Advance { millis } => now += Duration::from_millis(u64::from(millis)),
            RegistryOp::Expire => {
                let mut want: Vec<i64> = expected
                    .iter()
                    .filter(|(_, state)| matches!(state, Expected::Pending { deadline } if now >= *deadline))
                    .map(|(&id, _)| id)
                    .collect();
                want.sort_unstable();
                let got = registry.expire(origin + now);
                if got != want {
                    return Err(format!("op {i}: expired {got:?}, expected {want:?}"));
                }
                expected.retain(|_, state| match *state {
                    Expected::TimedOut { forget_at } | Expected::Errored { forget_at } => now < forget_at,
                    Expected::Pending { .. } => true,
                });
                abandoned.retain(|_, forget_at| now < *forget_at);
                for id in got {
                    expected.insert(id, Expected::TimedOut { forget_at: now + RETENTION });
                    abandoned.insert(id, now + RETENTION);
                }
            }
            RegistryOp::TakeFailure { correlation_id } => {
                let id = i64::from(correlation_id);
                let failed = !matches!(expected.get(&id), None | Some(Expected::Pending { .. }));
                let taken = registry.take_failure(id);
                if taken.is_some() != failed {
                    return Err(format!("op {i}: take_failure of {id} gave {taken:?}, failed was {failed}"));
                }
                if failed {
                    expected.remove(&id);
                }
            }
            RegistryOp::Remove { correlation_id } => {
                let id = i64::from(correlation_id);
                if registry.remove(id).is_some() != expected.remove(&id).is_some() {
                    return Err(format!("op {i}: remove of {id} disagreed"));
                }
            }
        }

        if registry.len() != expected.len() {
            return Err(format!("after op {i}: {} requests, expected {}", registry.len(), expected.len()));
        }
        if registry.abandoned_len() != abandoned.len() {
            return Err(format!(
                "after op {i}: {} abandoned, expected {}",
                registry.abandoned_len(),
                abandoned.len()
            ));
        }
        for (&id, want) in &expected {
            let request = registry
                .get(id)
                .ok_or_else(|| format!("after op {i}: request {id} missing"))?;
            if !want.same_kind(&request.state) {
                return Err(format!("after op {i}: request {id} is {:?}, expected {want:?}", request.state));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_stick() {
        let ops = [
            RegistryOp::Register { correlation_id: 1 },
            RegistryOp::Fail { correlation_id: 1 },
            RegistryOp::TimeOut { correlation_id: 1 },
            RegistryOp::Advance { millis: 200 },
            RegistryOp::Expire,
            RegistryOp::Fail { correlation_id: 9 },
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn test_expiry_at_deadline() {
        let ops = [
            RegistryOp::Register { correlation_id: 3 },
            RegistryOp::Advance { millis: 25 },
            RegistryOp::Register { correlation_id: 2 },
            RegistryOp::Advance { millis: 25 },
            RegistryOp::Expire,
            RegistryOp::Advance { millis: 25 },
            RegistryOp::Expire,
            RegistryOp::Remove { correlation_id: 3 },
            RegistryOp::Remove { correlation_id: 3 },
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn test_failures_taken_or_forgotten() {
        let ops = [
            RegistryOp::Register { correlation_id: 1 },
            RegistryOp::Register { correlation_id: 2 },
            RegistryOp::Fail { correlation_id: 2 },
            RegistryOp::TakeFailure { correlation_id: 1 },
            RegistryOp::TakeFailure { correlation_id: 2 },
            RegistryOp::TakeFailure { correlation_id: 2 },
            RegistryOp::Advance { millis: 60 },
            RegistryOp::Expire,
            RegistryOp::Advance { millis: 80 },
            RegistryOp::Expire,
        ];
        execute_and_verify(&ops).unwrap();
    }
}
