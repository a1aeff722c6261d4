//! Outstanding commands and the resources they produced.
//!
//! The registry is the only state touched by both caller threads (issuing
//! commands, polling for results) and the conductor (resolving them). It is
//! always used behind the client's mutex.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use strand_core::ErrorCode;

use crate::{Publication, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Publication,
    ExclusivePublication,
    Subscription,
}

/// A resource a resolved command handed back.
#[derive(Debug, Clone)]
pub enum Resource {
    Publication(Publication),
    Subscription(Subscription),
}

/// Lifecycle of one correlated command. Every state other than `Pending`
/// is terminal.
#[derive(Debug, Clone)]
pub enum PendingState {
    Pending,
    Resolved(Resource),
    TimedOut,
    Errored { code: ErrorCode, message: String },
}

impl PendingState {
    /// `true` for every state but `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PendingState::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: ResourceKind,
    pub channel: String,
    pub stream_id: i32,
    /// While pending, when the command times out. Once it has failed, when
    /// an unread failure is forgotten.
    pub deadline: Instant,
    pub state: PendingState,
}

/// Commands and resources of one client.
///
/// Resolved entries live until their resource is closed. Failed entries
/// (timed out or rejected) are handed out once by [`take_failure`] and are
/// otherwise dropped `retention` after they failed. Timed-out commands are
/// also remembered as abandoned for `retention`, so a late answer from the
/// driver can be undone instead of leaking a resource on the driver side.
///
/// [`take_failure`]: Registry::take_failure
#[derive(Debug)]
pub struct Registry {
    requests: HashMap<i64, PendingRequest>,
    abandoned: HashMap<i64, (ResourceKind, Instant)>,
    retention: Duration,
}

impl Registry {
    /// An empty registry that keeps failures for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            abandoned: HashMap::new(),
            retention,
        }
    }

    /// Number of tracked commands and resources.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Track a new command that times out at `deadline`.
    pub fn register(&mut self, correlation_id: i64, kind: ResourceKind, channel: &str, stream_id: i32, deadline: Instant) {
        self.requests.insert(
            correlation_id,
            PendingRequest {
                kind,
                channel: channel.to_owned(),
                stream_id,
                deadline,
                state: PendingState::Pending,
            },
        );
    }

    /// Look up a command by correlation id.
    pub fn get(&self, correlation_id: i64) -> Option<&PendingRequest> {
        self.requests.get(&correlation_id)
    }

    /// Settle a pending request. Returns `false`, leaving the request as it
    /// was, if it is unknown or already terminal.
    pub fn settle(&mut self, correlation_id: i64, state: PendingState, now: Instant) -> bool {
        match self.requests.get_mut(&correlation_id) {
            Some(request) if !request.state.is_terminal() => {
                if !matches!(state, PendingState::Resolved(_)) {
                    request.deadline = now + self.retention;
                }
                request.state = state;
                true
            }
            _ => false,
        }
    }

    /// Remove and return a failed request so its failure is reported once.
    /// Pending and resolved requests stay where they are.
    pub fn take_failure(&mut self, correlation_id: i64) -> Option<PendingRequest> {
        match self.requests.get(&correlation_id).map(|r| &r.state) {
            Some(PendingState::TimedOut | PendingState::Errored { .. }) => self.requests.remove(&correlation_id),
            _ => None,
        }
    }

    /// Time out every pending request whose deadline has passed, and forget
    /// failures and abandoned commands older than the retention period.
    pub fn expire(&mut self, now: Instant) -> Vec<i64> {
        let mut expired = Vec::new();
        let retention = self.retention;
        let abandoned = &mut self.abandoned;
        self.requests.retain(|&correlation_id, request| {
            if now < request.deadline {
                return true;
            }
            match request.state {
                PendingState::Pending => {
                    request.state = PendingState::TimedOut;
                    request.deadline = now + retention;
                    abandoned.insert(correlation_id, (request.kind, now + retention));
                    expired.push(correlation_id);
                    true
                }
                PendingState::Resolved(_) => true,
                PendingState::TimedOut | PendingState::Errored { .. } => false,
            }
        });
        self.abandoned.retain(|_, &mut (_, forget_at)| now < forget_at);
        expired.sort_unstable();
        expired
    }

    /// Claim a command that timed out before the driver answered it.
    pub fn take_abandoned(&mut self, correlation_id: i64) -> Option<ResourceKind> {
        self.abandoned.remove(&correlation_id).map(|(kind, _)| kind)
    }

    /// Number of timed-out commands still remembered.
    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }

    /// Stop tracking a command or resource.
    pub fn remove(&mut self, correlation_id: i64) -> Option<PendingRequest> {
        self.requests.remove(&correlation_id)
    }

    /// A live subscription. Its registration id is the correlation id of the
    /// command that added it.
    pub fn subscription(&self, registration_id: i64) -> Option<&Subscription> {
        match self.requests.get(&registration_id).map(|r| &r.state) {
            Some(PendingState::Resolved(Resource::Subscription(subscription))) => Some(subscription),
            _ => None,
        }
    }

    /// Drop everything, handing back the resources that were live.
    pub fn drain_resources(&mut self) -> Vec<Resource> {
        self.requests
            .drain()
            .filter_map(|(_, request)| match request.state {
                PendingState::Resolved(resource) => Some(resource),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_settle_is_terminal() {
        let mut registry = Registry::new(Duration::from_secs(10));
        let now = Instant::now();
        registry.register(42, ResourceKind::Subscription, "strand:ipc", 7, now);

        assert!(registry.settle(
            42,
            PendingState::Errored {
                code: ErrorCode::InvalidChannel,
                message: "bad".into()
            },
            now
        ));
        assert!(!registry.settle(42, PendingState::TimedOut, now));
        assert!(matches!(
            registry.get(42).unwrap().state,
            PendingState::Errored {
                code: ErrorCode::InvalidChannel,
                ..
            }
        ));
        assert!(!registry.settle(43, PendingState::TimedOut, now));
    }

    #[test]
    fn test_expire_only_touches_overdue_pending() {
        let mut registry = Registry::new(Duration::from_secs(10));
        let now = Instant::now();
        registry.register(1, ResourceKind::Publication, "strand:ipc", 1, now);
        registry.register(2, ResourceKind::Publication, "strand:ipc", 1, now + Duration::from_secs(5));
        registry.register(3, ResourceKind::Publication, "strand:ipc", 1, now);
        registry.settle(3, PendingState::TimedOut, now);

        assert_eq!(registry.expire(now + Duration::from_secs(1)), vec![1]);
        assert!(matches!(registry.get(2).unwrap().state, PendingState::Pending));
        assert_eq!(registry.expire(now + Duration::from_secs(5)), vec![2]);
        assert!(registry.expire(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_failures_are_taken_once() {
        let mut registry = Registry::new(Duration::from_secs(10));
        let now = Instant::now();
        registry.register(1, ResourceKind::Subscription, "strand:ipc", 1, now);
        registry.register(2, ResourceKind::Subscription, "strand:ipc", 1, now + Duration::from_secs(5));

        assert!(registry.take_failure(2).is_none());
        assert_eq!(registry.expire(now), vec![1]);
        assert!(matches!(registry.take_failure(1).unwrap().state, PendingState::TimedOut));
        assert!(registry.take_failure(1).is_none());
        assert!(registry.get(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unread_failures_and_abandoned_commands_are_forgotten() {
        let retention = Duration::from_secs(10);
        let mut registry = Registry::new(retention);
        let now = Instant::now();
        for correlation_id in 0..50 {
            registry.register(correlation_id, ResourceKind::Subscription, "strand:ipc", 1, now);
        }
        registry.register(99, ResourceKind::Publication, "strand:ipc", 1, now + Duration::from_secs(60));
        registry.settle(
            99,
            PendingState::Errored {
                code: ErrorCode::Generic,
                message: "no".into(),
            },
            now,
        );

        assert_eq!(registry.expire(now).len(), 50);
        assert_eq!(registry.len(), 51);
        assert_eq!(registry.abandoned_len(), 50);
        assert_eq!(registry.take_abandoned(7), Some(ResourceKind::Subscription));
        assert_eq!(registry.take_abandoned(7), None);

        assert!(registry.expire(now + retention).is_empty());
        assert!(registry.is_empty());
        assert_eq!(registry.abandoned_len(), 0);
    }
}
