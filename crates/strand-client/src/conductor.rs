//! The client's control-plane duty cycle.
//!
//! [`ClientConductor`] owns the reading side of the to-clients ring and is
//! driven by exactly one thread. Callers issue commands and poll for their
//! outcome through [`ClientHandle`], which can be cloned freely. The two
//! meet only in the [`Registry`], behind a mutex.
//!
//! ```text
//!   caller ── ClientHandle::async_add_* ──▶ Registry (Pending) ──▶ to-driver ring
//!                                               ▲
//!   ClientConductor::do_work ◀── to-clients ring┘ (Resolved | Errored | TimedOut)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand_core::clock::epoch_millis;
use strand_core::{ErrorCode, ImageReady, PublicationReady, Response};
use strand_shm::{CncFile, Image, LogBufferPartitions};

use crate::publication::PublicationInit;
use crate::registry::{PendingState, Registry, Resource, ResourceKind};
use crate::{ClientError, DriverProxy, Publication, Subscription};

/// How long a command may wait for the driver before it times out.
pub const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the conductor tells the driver this client is alive.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Conductor settings.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Directory holding the driver's cnc file.
    pub dir: PathBuf,
    /// How long to wait for a response, and how stale the driver heartbeat
    /// may get before the driver counts as inactive.
    pub driver_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl ConductorConfig {
    /// Defaults for a driver whose cnc file lives in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            driver_timeout: DEFAULT_DRIVER_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

/// Notifications from the conductor.
///
/// Called on the conductor's thread while it does its work, so
/// implementations must not block.
pub trait ConductorListener: Send {
    fn on_available_image(&mut self, subscription: &Subscription, image: &ImageReady) {
        let _ = (subscription, image);
    }

    fn on_unavailable_image(&mut self, subscription: &Subscription, correlation_id: i64) {
        let _ = (subscription, correlation_id);
    }

    fn on_error(&mut self, error: &ClientError) {
        let _ = error;
    }
}

impl<L: ConductorListener + ?Sized> ConductorListener for Box<L> {
    fn on_available_image(&mut self, subscription: &Subscription, image: &ImageReady) {
        (**self).on_available_image(subscription, image)
    }

    fn on_unavailable_image(&mut self, subscription: &Subscription, correlation_id: i64) {
        (**self).on_unavailable_image(subscription, correlation_id)
    }

    fn on_error(&mut self, error: &ClientError) {
        (**self).on_error(error)
    }
}

/// State shared between the conductor and every handle.
pub(crate) struct ClientShared {
    registry: Mutex<Registry>,
    proxy: DriverProxy,
    driver_timeout: Duration,
    closed: AtomicBool,
}

impl ClientShared {
    fn issue<F>(&self, kind: ResourceKind, channel: &str, stream_id: i32, send: F) -> Result<i64, ClientError>
    where
        F: FnOnce(&DriverProxy, i64) -> Result<(), ClientError>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let correlation_id = self.proxy.next_correlation_id();
        let deadline = Instant::now() + self.driver_timeout;

        // Register first so a fast response always finds its request.
        self.registry
            .lock()
            .register(correlation_id, kind, channel, stream_id, deadline);
        if let Err(err) = send(&self.proxy, correlation_id) {
            self.registry.lock().remove(correlation_id);
            return Err(err);
        }
        tracing::trace!("issued {kind:?} command {correlation_id} for {channel} stream {stream_id}");
        Ok(correlation_id)
    }

    /// A failure is reported by exactly one poll; after that the correlation
    /// id is unknown.
    fn poll(&self, correlation_id: i64, kinds: &[ResourceKind]) -> Result<Option<Resource>, ClientError> {
        let mut registry = self.registry.lock();
        let request = registry
            .get(correlation_id)
            .ok_or(ClientError::UnknownCorrelation(correlation_id))?;
        if !kinds.contains(&request.kind) {
            return Err(ClientError::WrongResourceKind(correlation_id));
        }
        match &request.state {
            PendingState::Pending => return Ok(None),
            PendingState::Resolved(resource) => return Ok(Some(resource.clone())),
            PendingState::TimedOut | PendingState::Errored { .. } => {}
        }

        let failed = registry
            .take_failure(correlation_id)
            .ok_or(ClientError::UnknownCorrelation(correlation_id))?;
        match failed.state {
            PendingState::Errored { code, message } => Err(ClientError::Registration {
                correlation_id,
                code,
                message,
            }),
            _ => Err(ClientError::DriverTimeout {
                correlation_id,
                timeout: self.driver_timeout,
            }),
        }
    }

    /// Undo a resource the driver created for a command we stopped waiting
    /// for.
    fn undo_abandoned(&self, correlation_id: i64, registration_id: i64) -> bool {
        let Some(kind) = self.registry.lock().take_abandoned(correlation_id) else {
            return false;
        };
        tracing::debug!("driver answered timed-out command {correlation_id} late, removing {registration_id}");
        let sent = match kind {
            ResourceKind::Publication | ResourceKind::ExclusivePublication => {
                self.proxy.remove_publication(registration_id)
            }
            ResourceKind::Subscription => self.proxy.remove_subscription(registration_id),
        };
        if let Err(err) = sent {
            tracing::warn!("failed to send remove for late resource {registration_id}: {err}");
        }
        true
    }

    pub(crate) fn release_publication(&self, correlation_id: i64, registration_id: i64) {
        self.registry.lock().remove(correlation_id);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.proxy.remove_publication(registration_id) {
            tracing::warn!("failed to send remove for publication {registration_id}: {err}");
        }
    }

    pub(crate) fn release_subscription(&self, registration_id: i64) {
        self.registry.lock().remove(registration_id);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.proxy.remove_subscription(registration_id) {
            tracing::warn!("failed to send remove for subscription {registration_id}: {err}");
        }
    }

    /// Mark the client closed and close every live resource.
    fn shut_down(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for resource in self.registry.lock().drain_resources() {
            match resource {
                Resource::Publication(publication) => publication.mark_closed(),
                Resource::Subscription(subscription) => subscription.mark_closed(),
            }
        }
        true
    }
}

/// The caller-facing side of a client: issue commands and poll for results.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<ClientShared>,
}

impl ClientHandle {
    /// Id the driver knows this client by.
    pub fn client_id(&self) -> i64 {
        self.shared.proxy.client_id()
    }

    /// Whether the client has been closed, by the caller or by the driver
    /// timing it out.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bound on how long any command waits for the driver.
    pub fn driver_timeout(&self) -> Duration {
        self.shared.driver_timeout
    }

    /// Ask the driver for a shared publication. Returns the correlation id
    /// to poll with.
    pub fn async_add_publication(&self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        self.shared
            .issue(ResourceKind::Publication, channel, stream_id, |proxy, id| {
                proxy.add_publication(id, channel, stream_id)
            })
    }

    /// Ask the driver for a publication of our own. Nothing else writes to
    /// its log, so offers need no coordination with other publishers.
    pub fn async_add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        self.shared
            .issue(ResourceKind::ExclusivePublication, channel, stream_id, |proxy, id| {
                proxy.add_exclusive_publication(id, channel, stream_id)
            })
    }

    /// Ask the driver to start delivering images for `channel` and
    /// `stream_id`. The subscription's registration id is the returned
    /// correlation id.
    pub fn async_add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        self.shared
            .issue(ResourceKind::Subscription, channel, stream_id, |proxy, id| {
                proxy.add_subscription(id, channel, stream_id)
            })
    }

    /// `Ok(None)` while the driver has not answered. Once resolved, every
    /// poll hands back a handle to the same publication until it is closed.
    pub fn poll_publication(&self, correlation_id: i64) -> Result<Option<Publication>, ClientError> {
        let kinds = [ResourceKind::Publication, ResourceKind::ExclusivePublication];
        match self.shared.poll(correlation_id, &kinds)? {
            Some(Resource::Publication(publication)) => Ok(Some(publication)),
            Some(Resource::Subscription(_)) => Err(ClientError::WrongResourceKind(correlation_id)),
            None => Ok(None),
        }
    }

    /// Like [`poll_publication`](Self::poll_publication), for subscriptions.
    pub fn poll_subscription(&self, correlation_id: i64) -> Result<Option<Subscription>, ClientError> {
        match self.shared.poll(correlation_id, &[ResourceKind::Subscription])? {
            Some(Resource::Subscription(subscription)) => Ok(Some(subscription)),
            Some(Resource::Publication(_)) => Err(ClientError::WrongResourceKind(correlation_id)),
            None => Ok(None),
        }
    }

    /// Number of commands and live resources being tracked.
    pub fn tracked_count(&self) -> usize {
        self.shared.registry.lock().len()
    }
}

/// Owns the client's end of the command rings and runs its duty cycle.
///
/// Exactly one thread calls [`do_work`](Self::do_work); everyone else goes
/// through a [`ClientHandle`].
pub struct ClientConductor {
    shared: Arc<ClientShared>,
    cnc: CncFile,
    keepalive_interval: Duration,
    listener: Option<Box<dyn ConductorListener>>,
    last_keepalive: Option<Instant>,
    driver_active: bool,
}

impl ClientConductor {
    /// Attach to the driver whose cnc file lives in `config.dir`.
    pub fn connect(config: ConductorConfig) -> Result<Self, ClientError> {
        let cnc = CncFile::open(&config.dir)?;
        let age_ms = heartbeat_age_ms(&cnc);
        if age_ms > duration_millis(config.driver_timeout) {
            return Err(ClientError::DriverInactive { age_ms });
        }

        let client_id = cnc.to_driver().next_correlation_id();
        let proxy = DriverProxy::new(cnc.to_driver().clone(), client_id);
        tracing::debug!("client {client_id} connected to driver in {}", config.dir.display());

        Ok(Self {
            shared: Arc::new(ClientShared {
                registry: Mutex::new(Registry::new(config.driver_timeout)),
                proxy,
                driver_timeout: config.driver_timeout,
                closed: AtomicBool::new(false),
            }),
            cnc,
            keepalive_interval: config.keepalive_interval,
            listener: None,
            last_keepalive: None,
            driver_active: true,
        })
    }

    /// Report images and errors to `listener`.
    pub fn with_listener(mut self, listener: impl ConductorListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// A cloneable handle for issuing commands from other threads.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Id the driver knows this client by.
    pub fn client_id(&self) -> i64 {
        self.shared.proxy.client_id()
    }

    /// The mapped cnc file.
    pub fn cnc(&self) -> &CncFile {
        &self.cnc
    }

    /// `false` once the driver heartbeat is older than the driver timeout.
    pub fn is_driver_active(&self) -> bool {
        self.driver_active
    }

    /// Whether the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// One duty cycle: drain responses, send a keepalive when due, expire
    /// overdue commands and check the driver heartbeat.
    pub fn do_work(&mut self, now: Instant) -> usize {
        if self.is_closed() {
            return 0;
        }

        let mut responses = Vec::new();
        let mut work = self.cnc.to_clients().read(
            |msg_type_id, payload| responses.push(Response::decode(msg_type_id, payload)),
            usize::MAX,
        );
        for response in responses {
            match response {
                Ok(response) => self.on_response(response),
                Err(err) => self.notify_error(&ClientError::Codec(err)),
            }
        }

        work += self.send_keepalive(now);
        work += self.expire_requests(now);
        self.check_driver_liveness();
        work
    }

    /// Tell the driver this client is going away and close every resource.
    pub fn close(&mut self) {
        if !self.shared.shut_down() {
            return;
        }
        if let Err(err) = self.shared.proxy.close() {
            tracing::warn!("failed to send close for client {}: {err}", self.client_id());
        }
        tracing::debug!("client {} closed", self.client_id());
    }

    fn on_response(&mut self, response: Response) {
        match response {
            Response::PublicationReady(ready) => self.on_publication_ready(ready, false),
            Response::ExclusivePublicationReady(ready) => self.on_publication_ready(ready, true),
            Response::SubscriptionReady { correlation_id } => self.on_subscription_ready(correlation_id),
            Response::OperationSuccess { correlation_id } => {
                tracing::trace!("command {correlation_id} succeeded");
            }
            Response::Error {
                offending_correlation_id,
                code,
                message,
            } => self.on_error_response(offending_correlation_id, code, message),
            Response::AvailableImage(image) => self.on_available_image(image),
            Response::UnavailableImage {
                correlation_id,
                subscription_registration_id,
                ..
            } => self.on_unavailable_image(correlation_id, subscription_registration_id),
            Response::ClientTimeout { client_id } => {
                if client_id == self.client_id() {
                    tracing::warn!("driver timed out client {client_id}");
                    self.shared.shut_down();
                    self.notify_error(&ClientError::ClientTimedOut(client_id));
                }
            }
        }
    }

    fn on_publication_ready(&mut self, ready: PublicationReady, exclusive: bool) {
        let correlation_id = ready.correlation_id;
        let expected = if exclusive {
            ResourceKind::ExclusivePublication
        } else {
            ResourceKind::Publication
        };
        let channel = self
            .shared
            .registry
            .lock()
            .get(correlation_id)
            .filter(|request| request.kind == expected && !request.state.is_terminal())
            .map(|request| request.channel.clone());
        let Some(channel) = channel else {
            // Someone else's command, or one we already gave up on.
            self.shared.undo_abandoned(correlation_id, ready.registration_id);
            return;
        };

        let init = PublicationInit {
            correlation_id,
            registration_id: ready.registration_id,
            channel,
            stream_id: ready.stream_id,
            session_id: ready.session_id,
            exclusive,
            log_file: PathBuf::from(&ready.log_file),
        };
        let state = match Publication::open(init, Arc::downgrade(&self.shared)) {
            Ok(publication) => PendingState::Resolved(Resource::Publication(publication)),
            Err(err) => {
                tracing::warn!("cannot map log {} for command {correlation_id}: {err}", ready.log_file);
                PendingState::Errored {
                    code: ErrorCode::Generic,
                    message: err.to_string(),
                }
            }
        };
        self.shared
            .registry
            .lock()
            .settle(correlation_id, state, Instant::now());
    }

    fn on_subscription_ready(&mut self, correlation_id: i64) {
        let mut registry = self.shared.registry.lock();
        let found = registry
            .get(correlation_id)
            .filter(|request| request.kind == ResourceKind::Subscription && !request.state.is_terminal())
            .map(|request| (request.channel.clone(), request.stream_id));
        let Some((channel, stream_id)) = found else {
            drop(registry);
            self.shared.undo_abandoned(correlation_id, correlation_id);
            return;
        };
        let subscription = Subscription::new(correlation_id, channel, stream_id, Arc::downgrade(&self.shared));
        registry.settle(
            correlation_id,
            PendingState::Resolved(Resource::Subscription(subscription)),
            Instant::now(),
        );
    }

    fn on_error_response(&mut self, correlation_id: i64, code: ErrorCode, message: String) {
        tracing::debug!("driver rejected command {correlation_id}: {message}");
        let state = PendingState::Errored {
            code,
            message: message.clone(),
        };
        {
            let mut registry = self.shared.registry.lock();
            registry.settle(correlation_id, state, Instant::now());
            registry.take_abandoned(correlation_id);
        }
        self.notify_error(&ClientError::Registration {
            correlation_id,
            code,
            message,
        });
    }

    fn on_available_image(&mut self, ready: ImageReady) {
        let Some(subscription) = self
            .shared
            .registry
            .lock()
            .subscription(ready.subscription_registration_id)
            .cloned()
        else {
            return;
        };

        let image = LogBufferPartitions::map_file(Path::new(&ready.log_file))
            .and_then(|log| Image::at_producer_position(Arc::new(log), ready.correlation_id));
        match image {
            Ok(image) => {
                if subscription.add_image(image) {
                    tracing::debug!(
                        "image {} available on subscription {}",
                        ready.correlation_id,
                        ready.subscription_registration_id
                    );
                    if let Some(listener) = self.listener.as_mut() {
                        listener.on_available_image(&subscription, &ready);
                    }
                }
            }
            Err(err) => self.notify_error(&ClientError::Log(err)),
        }
    }

    fn on_unavailable_image(&mut self, correlation_id: i64, subscription_registration_id: i64) {
        let Some(subscription) = self
            .shared
            .registry
            .lock()
            .subscription(subscription_registration_id)
            .cloned()
        else {
            return;
        };
        if subscription.remove_image(correlation_id) {
            if let Some(listener) = self.listener.as_mut() {
                listener.on_unavailable_image(&subscription, correlation_id);
            }
        }
    }

    fn send_keepalive(&mut self, now: Instant) -> usize {
        let due = self
            .last_keepalive
            .map_or(true, |last| now.saturating_duration_since(last) >= self.keepalive_interval);
        if !due {
            return 0;
        }
        match self.shared.proxy.keepalive() {
            Ok(()) => {
                self.last_keepalive = Some(now);
                1
            }
            Err(err) => {
                tracing::warn!("keepalive failed: {err}");
                0
            }
        }
    }

    fn expire_requests(&mut self, now: Instant) -> usize {
        let expired = self.shared.registry.lock().expire(now);
        for &correlation_id in &expired {
            tracing::warn!("command {correlation_id} timed out waiting for the driver");
            self.notify_error(&ClientError::DriverTimeout {
                correlation_id,
                timeout: self.shared.driver_timeout,
            });
        }
        expired.len()
    }

    fn check_driver_liveness(&mut self) {
        let age_ms = heartbeat_age_ms(&self.cnc);
        let active = age_ms <= duration_millis(self.shared.driver_timeout);
        if active == self.driver_active {
            return;
        }
        self.driver_active = active;
        if active {
            tracing::info!("driver heartbeat resumed");
        } else {
            tracing::warn!("driver heartbeat is {age_ms} ms old");
            self.notify_error(&ClientError::DriverInactive { age_ms });
        }
    }

    fn notify_error(&mut self, error: &ClientError) {
        if let Some(listener) = self.listener.as_mut() {
            listener.on_error(error);
        }
    }
}

fn heartbeat_age_ms(cnc: &CncFile) -> i64 {
    epoch_millis() - cnc.to_driver().consumer_heartbeat_time()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use strand_core::TERM_MIN_LENGTH;
    use strand_driver::{DriverConductor, DriverConfig, LogDefaults};
    use strand_shm::OfferOutcome;

    use super::*;

    fn driver(dir: &Path) -> DriverConductor {
        let mut config = DriverConfig::new(dir);
        config.log_defaults = LogDefaults {
            term_length: TERM_MIN_LENGTH,
            mtu_length: 1408,
        };
        config.first_registration_id = 1001;
        DriverConductor::launch(config).unwrap()
    }

    fn client(dir: &Path) -> ClientConductor {
        ClientConductor::connect(ConductorConfig::new(dir)).unwrap()
    }

    fn cycle(driver: &mut DriverConductor, client: &mut ClientConductor) {
        let now = Instant::now();
        driver.do_work(now);
        client.do_work(now);
    }

    struct Recorder(mpsc::Sender<String>);

    impl ConductorListener for Recorder {
        fn on_available_image(&mut self, subscription: &Subscription, image: &ImageReady) {
            let _ = self
                .0
                .send(format!("image {} on {}", image.correlation_id, subscription.registration_id()));
        }

        fn on_unavailable_image(&mut self, subscription: &Subscription, correlation_id: i64) {
            let _ = self
                .0
                .send(format!("gone {correlation_id} on {}", subscription.registration_id()));
        }

        fn on_error(&mut self, error: &ClientError) {
            let _ = self.0.send(format!("error {error}"));
        }
    }

    #[test]
    fn test_publication_resolves_and_stays_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        let mut client = client(dir.path());
        let handle = client.handle();

        client.cnc().to_driver().set_next_correlation_id(42);
        let correlation_id = handle.async_add_publication("strand:ipc", 7).unwrap();
        assert_eq!(correlation_id, 42);
        assert!(handle.poll_publication(42).unwrap().is_none());

        cycle(&mut driver, &mut client);
        let publication = handle.poll_publication(42).unwrap().unwrap();
        assert_eq!(publication.registration_id(), 1001);
        assert_eq!(publication.stream_id(), 7);

        client.do_work(Instant::now());
        let again = handle.poll_publication(42).unwrap().unwrap();
        assert_eq!(again.registration_id(), 1001);
        assert_eq!(again.position(), publication.position());
    }

    #[test]
    fn test_unanswered_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let _driver = driver(dir.path());
        let (tx, rx) = mpsc::channel();
        let mut client = client(dir.path()).with_listener(Recorder(tx));
        let handle = client.handle();

        let correlation_id = handle.async_add_subscription("strand:ipc", 1).unwrap();
        client.do_work(Instant::now() + DEFAULT_DRIVER_TIMEOUT + Duration::from_millis(1));

        assert!(matches!(
            handle.poll_subscription(correlation_id),
            Err(ClientError::DriverTimeout { correlation_id: id, .. }) if id == correlation_id
        ));
        assert!(rx.try_recv().unwrap().contains("no response from driver"));
    }

    #[test]
    fn test_driver_error_reaches_caller_and_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        let (tx, rx) = mpsc::channel();
        let mut client = client(dir.path()).with_listener(Recorder(tx));
        let handle = client.handle();

        let correlation_id = handle.async_add_publication("strand:udp?endpoint=abc", 1).unwrap();
        cycle(&mut driver, &mut client);

        match handle.poll_publication(correlation_id) {
            Err(ClientError::Registration { code, .. }) => assert_eq!(code, ErrorCode::InvalidChannel),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().unwrap().starts_with("error driver rejected"));
    }

    #[test]
    fn test_poll_checks_kind_and_correlation() {
        let dir = tempfile::tempdir().unwrap();
        let _driver = driver(dir.path());
        let client = client(dir.path());
        let handle = client.handle();

        let correlation_id = handle.async_add_subscription("strand:ipc", 1).unwrap();
        assert!(matches!(
            handle.poll_publication(correlation_id),
            Err(ClientError::WrongResourceKind(_))
        ));
        assert!(matches!(
            handle.poll_subscription(-5),
            Err(ClientError::UnknownCorrelation(-5))
        ));
    }

    #[test]
    fn test_messages_flow_from_publication_to_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        let (tx, rx) = mpsc::channel();
        let mut client = client(dir.path()).with_listener(Recorder(tx));
        let handle = client.handle();

        let sub_id = handle.async_add_subscription("strand:ipc", 3).unwrap();
        let pub_id = handle.async_add_exclusive_publication("strand:ipc", 3).unwrap();
        cycle(&mut driver, &mut client);

        let subscription = handle.poll_subscription(sub_id).unwrap().unwrap();
        let publication = handle.poll_publication(pub_id).unwrap().unwrap();
        assert!(publication.is_exclusive());
        assert_eq!(subscription.image_count(), 1);
        assert_eq!(rx.try_recv().unwrap(), format!("image 1001 on {sub_id}"));

        for i in 0..3u8 {
            let outcome = publication.offer(&[i; 10]).unwrap();
            assert!(matches!(outcome, OfferOutcome::Published { .. }));
        }
        let mut received = Vec::new();
        let count = subscription.poll(|payload, _| received.push(payload.to_vec()), 10);
        assert_eq!(count, 3);
        assert_eq!(received, vec![vec![0u8; 10], vec![1u8; 10], vec![2u8; 10]]);

        publication.close();
        assert!(matches!(publication.offer(b"late"), Err(ClientError::Closed)));
        cycle(&mut driver, &mut client);
        assert_eq!(subscription.image_count(), 0);
        assert_eq!(rx.try_recv().unwrap(), format!("gone 1001 on {sub_id}"));
        assert_eq!(driver.publication_count(), 0);
    }

    #[test]
    fn test_keepalive_interval() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let mut client = client(dir.path());
        let start = Instant::now();

        assert_eq!(client.do_work(start), 1);
        assert_eq!(client.do_work(start + Duration::from_millis(100)), 0);
        assert_eq!(client.do_work(start + DEFAULT_KEEPALIVE_INTERVAL), 1);
        assert!(driver.cnc().to_driver().size() > 0);
    }

    #[test]
    fn test_close_tells_driver_and_closes_resources() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        let mut client = client(dir.path());
        let handle = client.handle();

        let pub_id = handle.async_add_publication("strand:ipc", 1).unwrap();
        cycle(&mut driver, &mut client);
        let publication = handle.poll_publication(pub_id).unwrap().unwrap();

        client.close();
        assert!(publication.is_closed());
        assert!(matches!(
            handle.async_add_publication("strand:ipc", 1),
            Err(ClientError::Closed)
        ));
        driver.do_work(Instant::now());
        assert_eq!(driver.client_count(), 0);
        assert_eq!(driver.publication_count(), 0);
    }

    #[test]
    fn test_stale_heartbeat_refuses_connect() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        driver.cnc().to_driver().set_consumer_heartbeat_time(epoch_millis() - 60_000);
        assert!(matches!(
            ClientConductor::connect(ConductorConfig::new(dir.path())),
            Err(ClientError::DriverInactive { .. })
        ));
    }

    #[test]
    fn test_timed_out_commands_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let _driver = driver(dir.path());
        let mut client = client(dir.path());
        let handle = client.handle();
        let start = Instant::now();

        let ids: Vec<i64> = (0..50)
            .map(|_| handle.async_add_subscription("strand:ipc", 1).unwrap())
            .collect();
        let timed_out = start + DEFAULT_DRIVER_TIMEOUT + Duration::from_millis(1);
        client.do_work(timed_out);
        assert_eq!(handle.tracked_count(), 50);

        // A failure is reported once, then forgotten.
        assert!(matches!(
            handle.poll_subscription(ids[0]),
            Err(ClientError::DriverTimeout { .. })
        ));
        assert!(matches!(
            handle.poll_subscription(ids[0]),
            Err(ClientError::UnknownCorrelation(_))
        ));
        assert_eq!(handle.tracked_count(), 49);

        // Failures nobody polls for go away after another timeout.
        client.do_work(timed_out + DEFAULT_DRIVER_TIMEOUT);
        assert_eq!(handle.tracked_count(), 0);
    }

    #[test]
    fn test_late_ready_is_removed_from_driver() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        let mut client = client(dir.path());
        let handle = client.handle();

        let pub_id = handle.async_add_publication("strand:ipc", 5).unwrap();
        let sub_id = handle.async_add_subscription("strand:ipc", 5).unwrap();
        client.do_work(Instant::now() + DEFAULT_DRIVER_TIMEOUT + Duration::from_millis(1));

        // The driver only now gets round to both commands.
        driver.do_work(Instant::now());
        assert_eq!(driver.publication_count(), 1);
        assert_eq!(driver.subscription_count(), 1);

        client.do_work(Instant::now());
        assert!(matches!(handle.poll_publication(pub_id), Err(ClientError::DriverTimeout { .. })));
        assert!(matches!(handle.poll_subscription(sub_id), Err(ClientError::DriverTimeout { .. })));

        driver.do_work(Instant::now());
        assert_eq!(driver.publication_count(), 0);
        assert_eq!(driver.subscription_count(), 0);
    }
}
