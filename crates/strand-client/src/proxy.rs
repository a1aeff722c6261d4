//! Writing commands to the driver.

use strand_core::{Command, CommandMessage};
use strand_shm::{CommandRing, WriteOutcome};

use crate::ClientError;

/// Encodes commands onto the to-driver ring on behalf of one client.
///
/// Many threads may send through clones of the same proxy; the ring
/// serializes them.
#[derive(Debug, Clone)]
pub struct DriverProxy {
    to_driver: CommandRing,
    client_id: i64,
}

impl DriverProxy {
    /// Send commands on `to_driver` on behalf of `client_id`.
    pub fn new(to_driver: CommandRing, client_id: i64) -> Self {
        Self { to_driver, client_id }
    }

    /// Id stamped on every command.
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Take the next correlation id from the shared counter in the ring.
    pub fn next_correlation_id(&self) -> i64 {
        self.to_driver.next_correlation_id()
    }

    /// Queue ADD_PUBLICATION for a shared publication.
    pub fn add_publication(&self, correlation_id: i64, channel: &str, stream_id: i32) -> Result<(), ClientError> {
        self.send(
            correlation_id,
            Command::AddPublication {
                channel: channel.to_owned(),
                stream_id,
            },
        )
    }

    /// Queue ADD_EXCLUSIVE_PUBLICATION.
    pub fn add_exclusive_publication(&self, correlation_id: i64, channel: &str, stream_id: i32) -> Result<(), ClientError> {
        self.send(
            correlation_id,
            Command::AddExclusivePublication {
                channel: channel.to_owned(),
                stream_id,
            },
        )
    }

    /// Queue REMOVE_PUBLICATION, returning the correlation id it used.
    pub fn remove_publication(&self, registration_id: i64) -> Result<i64, ClientError> {
        let correlation_id = self.next_correlation_id();
        self.send(correlation_id, Command::RemovePublication { registration_id })?;
        Ok(correlation_id)
    }

    /// Queue ADD_SUBSCRIPTION.
    pub fn add_subscription(&self, correlation_id: i64, channel: &str, stream_id: i32) -> Result<(), ClientError> {
        self.send(
            correlation_id,
            Command::AddSubscription {
                channel: channel.to_owned(),
                stream_id,
            },
        )
    }

    /// Queue REMOVE_SUBSCRIPTION, returning the correlation id it used.
    pub fn remove_subscription(&self, registration_id: i64) -> Result<i64, ClientError> {
        let correlation_id = self.next_correlation_id();
        self.send(correlation_id, Command::RemoveSubscription { registration_id })?;
        Ok(correlation_id)
    }

    /// Queue CLIENT_KEEPALIVE.
    pub fn keepalive(&self) -> Result<(), ClientError> {
        self.send(0, Command::ClientKeepalive)
    }

    /// Queue CLIENT_CLOSE. The driver releases everything this client held.
    pub fn close(&self) -> Result<(), ClientError> {
        self.send(0, Command::ClientClose)
    }

    fn send(&self, correlation_id: i64, command: Command) -> Result<(), ClientError> {
        let message = CommandMessage {
            client_id: self.client_id,
            correlation_id,
            command,
        };
        match self.to_driver.write(message.msg_type_id(), &message.to_bytes())? {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::InsufficientCapacity => Err(ClientError::CommandRingFull),
        }
    }
}

#[cfg(test)]
mod tests {
    use strand_core::AtomicBuffer;
    use strand_shm::ring::ring_length;

    use super::*;

    fn ring(capacity: usize) -> CommandRing {
        CommandRing::new(AtomicBuffer::allocate(ring_length(capacity))).unwrap()
    }

    fn drain(ring: &CommandRing) -> Vec<CommandMessage> {
        let mut out = Vec::new();
        ring.read(
            |ty, payload| out.push(CommandMessage::decode(ty, payload).unwrap()),
            usize::MAX,
        );
        out
    }

    #[test]
    fn test_commands_carry_client_and_correlation() {
        let ring = ring(1024);
        let proxy = DriverProxy::new(ring.clone(), 9);

        proxy.add_publication(42, "strand:ipc", 7).unwrap();
        let remove = proxy.remove_subscription(1001).unwrap();
        proxy.keepalive().unwrap();

        let messages = drain(&ring);
        assert_eq!(
            messages,
            vec![
                CommandMessage {
                    client_id: 9,
                    correlation_id: 42,
                    command: Command::AddPublication {
                        channel: "strand:ipc".into(),
                        stream_id: 7
                    },
                },
                CommandMessage {
                    client_id: 9,
                    correlation_id: remove,
                    command: Command::RemoveSubscription { registration_id: 1001 },
                },
                CommandMessage {
                    client_id: 9,
                    correlation_id: 0,
                    command: Command::ClientKeepalive,
                },
            ]
        );
    }

    #[test]
    fn test_full_ring_reported() {
        let ring = ring(1024);
        let proxy = DriverProxy::new(ring, 1);
        let mut sent = 0;
        loop {
            match proxy.add_subscription(sent, "strand:ipc", 1) {
                Ok(()) => sent += 1,
                Err(ClientError::CommandRingFull) => break,
                Err(other) => panic!("unexpected {other}"),
            }
        }
        assert!(sent > 0);
    }
}
