//! The driver side of the control plane.
//!
//! The driver conductor owns the cnc file, reads commands from the
//! to-driver ring, creates and removes publication logs, links
//! subscriptions to publications on the same channel and stream, and
//! reports back on the to-clients ring. Only shared-memory (IPC)
//! delivery is provided: a subscription reads the publication's log file
//! directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use strand_core::clock::epoch_millis;
use strand_core::{Command, CommandMessage, ErrorCode, ImageReady, PublicationReady, Response};
use strand_shm::{CncConfig, CncFile, WriteOutcome};

use crate::log_factory::{LogDefaults, LogFactory, LogRequest};
use crate::resolver::{DefaultNameResolver, NameResolver};
use crate::{ChannelUri, DriverError};

/// Driver settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub dir: PathBuf,
    pub cnc: CncConfig,
    pub log_defaults: LogDefaults,
    /// First registration id handed to a publication.
    pub first_registration_id: i64,
    /// First session id handed to a publication that does not set one.
    pub first_session_id: i32,
    /// Remove an existing driver directory before starting.
    pub delete_dir_on_start: bool,
}

impl DriverConfig {
    /// Defaults rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cnc: CncConfig::default(),
            log_defaults: LogDefaults::default(),
            first_registration_id: 1,
            first_session_id: 1,
            delete_dir_on_start: false,
        }
    }
}

#[derive(Debug)]
struct DriverPublication {
    channel_key: String,
    stream_id: i32,
    session_id: i32,
    exclusive: bool,
    log_file: String,
    /// One entry per client reference; shared publications may appear
    /// several times.
    owners: Vec<i64>,
}

#[derive(Debug)]
struct DriverSubscription {
    channel_key: String,
    stream_id: i32,
    client_id: i64,
}

/// Owns the driver state. Call [`DriverConductor::do_work`] in a loop.
pub struct DriverConductor {
    cnc: CncFile,
    log_factory: LogFactory,
    resolver: Box<dyn NameResolver>,
    liveness_timeout: Duration,
    publications: HashMap<i64, DriverPublication>,
    subscriptions: HashMap<i64, DriverSubscription>,
    clients: HashMap<i64, Instant>,
    next_registration_id: i64,
    next_session_id: i32,
}

impl DriverConductor {
    /// Create the driver directory and cnc file.
    pub fn launch(config: DriverConfig) -> Result<Self, DriverError> {
        prepare_dir(&config.dir, config.delete_dir_on_start)?;
        let cnc = CncFile::create(&config.dir, &config.cnc)?;
        cnc.to_driver().set_consumer_heartbeat_time(epoch_millis());

        tracing::info!("driver started in {}", config.dir.display());
        Ok(Self {
            cnc,
            log_factory: LogFactory::new(&config.dir, config.log_defaults),
            resolver: Box::new(DefaultNameResolver),
            liveness_timeout: config.cnc.client_liveness_timeout,
            publications: HashMap::new(),
            subscriptions: HashMap::new(),
            clients: HashMap::new(),
            next_registration_id: config.first_registration_id,
            next_session_id: config.first_session_id,
        })
    }

    /// Replace the system resolver used for channel endpoints.
    pub fn with_resolver(mut self, resolver: impl NameResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn cnc(&self) -> &CncFile {
        &self.cnc
    }

    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Clients that have sent a command and not yet timed out.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// One duty cycle: heartbeat, drain commands, expire silent clients.
    pub fn do_work(&mut self, now: Instant) -> usize {
        self.cnc
            .to_driver()
            .set_consumer_heartbeat_time(epoch_millis());

        let mut commands = Vec::new();
        let read = self.cnc.to_driver().read(
            |msg_type_id, payload| commands.push(CommandMessage::decode(msg_type_id, payload)),
            usize::MAX,
        );
        for command in commands {
            match command {
                Ok(message) => self.on_command(message, now),
                Err(err) => tracing::warn!("dropping malformed command: {err}"),
            }
        }

        read + self.check_client_liveness(now)
    }

    fn on_command(&mut self, message: CommandMessage, now: Instant) {
        let CommandMessage {
            client_id,
            correlation_id,
            command,
        } = message;
        self.clients.insert(client_id, now);

        match command {
            Command::AddPublication { channel, stream_id } => {
                self.on_add_publication(client_id, correlation_id, &channel, stream_id, false)
            }
            Command::AddExclusivePublication { channel, stream_id } => {
                self.on_add_publication(client_id, correlation_id, &channel, stream_id, true)
            }
            Command::RemovePublication { registration_id } => {
                self.on_remove_publication(client_id, correlation_id, registration_id)
            }
            Command::AddSubscription { channel, stream_id } => {
                self.on_add_subscription(client_id, correlation_id, &channel, stream_id)
            }
            Command::RemoveSubscription { registration_id } => {
                self.on_remove_subscription(correlation_id, registration_id)
            }
            Command::ClientKeepalive => {}
            Command::ClientClose => {
                tracing::debug!("client {client_id} closed");
                self.remove_client(client_id);
            }
        }
    }

    fn on_add_publication(&mut self, client_id: i64, correlation_id: i64, channel: &str, stream_id: i32, exclusive: bool) {
        let uri = match self.parse_channel(channel) {
            Ok(uri) => uri,
            Err(err) => return self.send_error(correlation_id, ErrorCode::InvalidChannel, &err),
        };
        let channel_key = channel_key(&uri);

        if !exclusive {
            let shared = self.publications.iter_mut().find(|(_, p)| {
                !p.exclusive && p.stream_id == stream_id && p.channel_key == channel_key
            });
            if let Some((&registration_id, publication)) = shared {
                publication.owners.push(client_id);
                let ready = PublicationReady {
                    correlation_id,
                    registration_id,
                    session_id: publication.session_id,
                    stream_id,
                    log_file: publication.log_file.clone(),
                };
                self.send(Response::PublicationReady(ready));
                return;
            }
        }

        let session_id = match uri.session_id() {
            Ok(Some(session_id)) => session_id,
            Ok(None) => {
                let session_id = self.next_session_id;
                self.next_session_id = self.next_session_id.wrapping_add(1);
                session_id
            }
            Err(err) => return self.send_error(correlation_id, ErrorCode::InvalidChannel, &err),
        };
        let registration_id = self.next_registration_id;

        let created = self.log_factory.create(&LogRequest {
            registration_id,
            session_id,
            stream_id,
            channel: &uri,
            exclusive,
        });
        let created = match created {
            Ok(created) => created,
            Err(DriverError::Io { path, source }) => {
                let message = format!("{}: {source}", path.display());
                return self.send_error(correlation_id, ErrorCode::Generic, &message);
            }
            Err(err) => return self.send_error(correlation_id, ErrorCode::InvalidChannel, &err),
        };
        self.next_registration_id += 1;

        let log_file = created.path.to_string_lossy().into_owned();
        let ready = PublicationReady {
            correlation_id,
            registration_id,
            session_id,
            stream_id,
            log_file: log_file.clone(),
        };
        self.send(if exclusive {
            Response::ExclusivePublicationReady(ready)
        } else {
            Response::PublicationReady(ready)
        });

        let matching: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.stream_id == stream_id && s.channel_key == channel_key)
            .map(|(&id, _)| id)
            .collect();
        for subscription_id in matching {
            self.send(Response::AvailableImage(ImageReady {
                correlation_id: registration_id,
                subscription_registration_id: subscription_id,
                session_id,
                stream_id,
                log_file: log_file.clone(),
                source_identity: channel_key.clone(),
            }));
        }

        self.publications.insert(
            registration_id,
            DriverPublication {
                channel_key,
                stream_id,
                session_id,
                exclusive,
                log_file,
                owners: vec![client_id],
            },
        );
    }

    fn on_remove_publication(&mut self, client_id: i64, correlation_id: i64, registration_id: i64) {
        let Some(publication) = self.publications.get_mut(&registration_id) else {
            let message = format!("unknown publication {registration_id}");
            return self.send_error(correlation_id, ErrorCode::UnknownPublication, &message);
        };
        if let Some(index) = publication.owners.iter().position(|&owner| owner == client_id) {
            publication.owners.swap_remove(index);
        }
        if publication.owners.is_empty() {
            self.close_publication(registration_id);
        }
        self.send(Response::OperationSuccess { correlation_id });
    }

    fn on_add_subscription(&mut self, client_id: i64, correlation_id: i64, channel: &str, stream_id: i32) {
        let uri = match self.parse_channel(channel) {
            Ok(uri) => uri,
            Err(err) => return self.send_error(correlation_id, ErrorCode::InvalidChannel, &err),
        };
        let channel_key = channel_key(&uri);
        self.send(Response::SubscriptionReady { correlation_id });

        let images: Vec<ImageReady> = self
            .publications
            .iter()
            .filter(|(_, p)| p.stream_id == stream_id && p.channel_key == channel_key)
            .map(|(&registration_id, p)| ImageReady {
                correlation_id: registration_id,
                subscription_registration_id: correlation_id,
                session_id: p.session_id,
                stream_id,
                log_file: p.log_file.clone(),
                source_identity: channel_key.clone(),
            })
            .collect();
        for image in images {
            self.send(Response::AvailableImage(image));
        }

        self.subscriptions.insert(
            correlation_id,
            DriverSubscription {
                channel_key,
                stream_id,
                client_id,
            },
        );
    }

    fn on_remove_subscription(&mut self, correlation_id: i64, registration_id: i64) {
        if self.subscriptions.remove(&registration_id).is_none() {
            let message = format!("unknown subscription {registration_id}");
            return self.send_error(correlation_id, ErrorCode::UnknownSubscription, &message);
        }
        self.send(Response::OperationSuccess { correlation_id });
    }

    fn close_publication(&mut self, registration_id: i64) {
        let Some(publication) = self.publications.remove(&registration_id) else {
            return;
        };
        let linked: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.stream_id == publication.stream_id && s.channel_key == publication.channel_key)
            .map(|(&id, _)| id)
            .collect();
        for subscription_registration_id in linked {
            self.send(Response::UnavailableImage {
                correlation_id: registration_id,
                subscription_registration_id,
                stream_id: publication.stream_id,
            });
        }
        if let Err(err) = self.log_factory.remove(registration_id) {
            tracing::warn!("failed to remove log for publication {registration_id}: {err}");
        }
    }

    fn check_client_liveness(&mut self, now: Instant) -> usize {
        let expired: Vec<i64> = self
            .clients
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > self.liveness_timeout)
            .map(|(&id, _)| id)
            .collect();
        for client_id in &expired {
            tracing::warn!("client {client_id} timed out");
            self.send(Response::ClientTimeout {
                client_id: *client_id,
            });
            self.remove_client(*client_id);
        }
        expired.len()
    }

    fn remove_client(&mut self, client_id: i64) {
        self.clients.remove(&client_id);
        self.subscriptions.retain(|_, s| s.client_id != client_id);

        let mut orphaned = Vec::new();
        for (&registration_id, publication) in self.publications.iter_mut() {
            publication.owners.retain(|&owner| owner != client_id);
            if publication.owners.is_empty() {
                orphaned.push(registration_id);
            }
        }
        for registration_id in orphaned {
            self.close_publication(registration_id);
        }
    }

    fn parse_channel(&self, channel: &str) -> Result<ChannelUri, DriverError> {
        let uri = ChannelUri::parse(channel)?;
        uri.endpoint(self.resolver.as_ref())?;
        Ok(uri)
    }

    fn send_error(&self, correlation_id: i64, code: ErrorCode, detail: &dyn std::fmt::Display) {
        let message = detail.to_string();
        tracing::debug!("command {correlation_id} failed: {message}");
        self.send(Response::Error {
            offending_correlation_id: correlation_id,
            code,
            message,
        });
    }

    fn send(&self, response: Response) {
        let ring = self.cnc.to_clients();
        match ring.write(response.msg_type_id(), &response.to_bytes()) {
            Ok(WriteOutcome::Written) => {}
            Ok(WriteOutcome::InsufficientCapacity) => {
                tracing::warn!("to-clients ring full, dropped {:?}", response)
            }
            Err(err) => tracing::warn!("cannot send {:?}: {err}", response),
        }
    }
}

/// Publications and subscriptions link when their channel keys and stream
/// ids match.
fn channel_key(uri: &ChannelUri) -> String {
    match uri.get(crate::channel_uri::ENDPOINT_PARAM) {
        Some(endpoint) => format!("{}:{}", uri.media(), endpoint),
        None => uri.media().to_owned(),
    }
}

fn prepare_dir(dir: &Path, delete_existing: bool) -> Result<(), DriverError> {
    let io_err = |source| DriverError::Io {
        path: dir.to_path_buf(),
        source,
    };
    if delete_existing && dir.exists() {
        std::fs::remove_dir_all(dir).map_err(io_err)?;
    }
    std::fs::create_dir_all(dir).map_err(io_err)
}
