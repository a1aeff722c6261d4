//! strand-testkit: a driver stub and shared scenarios for strand tests.
//!
//! [`DriverStub`] runs a real [`DriverConductor`] in a temporary directory.
//! Tests either step it by hand with [`DriverStub::do_work`] or hand it to a
//! background thread with [`DriverStub::spawn`]. In silent mode it keeps its
//! heartbeat going but swallows every command, which is how timeouts are
//! exercised.
//!
//! # Usage
//!
//! ```ignore
//! #[test]
//! fn add_publication_resolves() {
//!     strand_testkit::run_add_publication_resolves();
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use strand_client::{ClientConductor, ClientError, ClientHandle, ConductorConfig, ConductorListener, Subscription};
use strand_core::clock::epoch_millis;
use strand_core::{ImageReady, TERM_MIN_LENGTH};
use strand_driver::{DriverConductor, DriverConfig, DriverError, LogDefaults};
use strand_shm::{CncConfig, OfferOutcome};
use tempfile::TempDir;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Directory or thread setup failed.
    Setup(String),
    /// The client side failed.
    Client(ClientError),
    /// The driver side failed.
    Driver(DriverError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Client(e) => write!(f, "client error: {}", e),
            TestError::Driver(e) => write!(f, "driver error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ClientError> for TestError {
    fn from(e: ClientError) -> Self {
        TestError::Client(e)
    }
}

impl From<DriverError> for TestError {
    fn from(e: DriverError) -> Self {
        TestError::Driver(e)
    }
}

/// Knobs for a [`DriverStub`].
#[derive(Debug, Clone)]
pub struct StubConfig {
    pub first_registration_id: i64,
    pub term_length: i32,
    pub client_liveness_timeout: Duration,
    /// Drain commands without answering them.
    pub silent: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            first_registration_id: 1001,
            term_length: TERM_MIN_LENGTH,
            client_liveness_timeout: Duration::from_secs(10),
            silent: false,
        }
    }
}

/// A driver living in its own temporary directory.
pub struct DriverStub {
    conductor: DriverConductor,
    silent: bool,
    // Declared last so the directory outlives the mappings inside it.
    dir: TempDir,
}

impl DriverStub {
    pub fn start(config: StubConfig) -> Result<Self, TestError> {
        let dir = tempfile::tempdir().map_err(|e| TestError::Setup(format!("tempdir: {}", e)))?;
        let mut driver_config = DriverConfig::new(dir.path());
        driver_config.first_registration_id = config.first_registration_id;
        driver_config.log_defaults = LogDefaults {
            term_length: config.term_length,
            ..LogDefaults::default()
        };
        driver_config.cnc = CncConfig {
            to_driver_capacity: 64 * 1024,
            to_clients_capacity: 64 * 1024,
            client_liveness_timeout: config.client_liveness_timeout,
        };
        let conductor = DriverConductor::launch(driver_config)?;
        tracing::debug!(
            "driver stub started in {} (silent: {})",
            dir.path().display(),
            config.silent
        );
        Ok(Self {
            conductor,
            silent: config.silent,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn conductor(&self) -> &DriverConductor {
        &self.conductor
    }

    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// One driver duty cycle.
    pub fn do_work(&mut self) -> usize {
        if self.silent {
            let cnc = self.conductor.cnc();
            cnc.to_driver().set_consumer_heartbeat_time(epoch_millis());
            let dropped = cnc.to_driver().read(|_, _| {}, usize::MAX);
            if dropped > 0 {
                tracing::trace!("silent driver stub dropped {} commands", dropped);
            }
            return dropped;
        }
        self.conductor.do_work(Instant::now())
    }

    /// Connect a client conductor to this driver.
    pub fn connect(&self) -> Result<ClientConductor, TestError> {
        Ok(ClientConductor::connect(ConductorConfig::new(self.dir()))?)
    }

    /// Run the driver on a background thread until the returned guard drops.
    pub fn spawn(self) -> Result<RunningDriver, TestError> {
        let stop = Arc::new(AtomicBool::new(false));
        let dir = self.dir.path().to_path_buf();
        let thread = thread::Builder::new()
            .name("strand-driver-stub".into())
            .spawn({
                let stop = Arc::clone(&stop);
                let mut stub = self;
                move || {
                    while !stop.load(Ordering::Acquire) {
                        if stub.do_work() == 0 {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    stub
                }
            })
            .map_err(|e| TestError::Setup(format!("spawn driver thread: {}", e)))?;
        tracing::debug!("driver stub running on its own thread in {}", dir.display());
        Ok(RunningDriver {
            dir,
            stop,
            thread: Some(thread),
        })
    }
}

/// A [`DriverStub`] running on its own thread.
pub struct RunningDriver {
    dir: std::path::PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<DriverStub>>,
}

impl RunningDriver {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop the thread and take the stub back.
    pub fn stop(mut self) -> Result<DriverStub, TestError> {
        self.stop_thread()
            .ok_or_else(|| TestError::Setup("driver thread panicked".into()))
    }

    fn stop_thread(&mut self) -> Option<DriverStub> {
        self.stop.store(true, Ordering::Release);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(stub) => {
                tracing::debug!("driver stub in {} stopped", self.dir.display());
                Some(stub)
            }
            Err(_) => {
                tracing::warn!("driver stub thread in {} panicked", self.dir.display());
                None
            }
        }
    }
}

impl Drop for RunningDriver {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// One event seen by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    AvailableImage { subscription: i64, image: i64 },
    UnavailableImage { subscription: i64, image: i64 },
    Error(String),
}

/// A listener that forwards every notification to a channel.
pub struct RecordingListener(mpsc::Sender<ListenerEvent>);

impl RecordingListener {
    pub fn new() -> (Self, mpsc::Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self(tx), rx)
    }
}

impl ConductorListener for RecordingListener {
    fn on_available_image(&mut self, subscription: &Subscription, image: &ImageReady) {
        let _ = self.0.send(ListenerEvent::AvailableImage {
            subscription: subscription.registration_id(),
            image: image.correlation_id,
        });
    }

    fn on_unavailable_image(&mut self, subscription: &Subscription, correlation_id: i64) {
        let _ = self.0.send(ListenerEvent::UnavailableImage {
            subscription: subscription.registration_id(),
            image: correlation_id,
        });
    }

    fn on_error(&mut self, error: &ClientError) {
        let _ = self.0.send(ListenerEvent::Error(error.to_string()));
    }
}

/// Step both sides until `poll` yields something or `cycles` run out.
pub fn pump_until<T, F>(
    stub: &mut DriverStub,
    client: &mut ClientConductor,
    cycles: usize,
    mut poll: F,
) -> Result<T, TestError>
where
    F: FnMut() -> Result<Option<T>, ClientError>,
{
    for _ in 0..cycles {
        stub.do_work();
        client.do_work(Instant::now());
        if let Some(value) = poll()? {
            return Ok(value);
        }
    }
    Err(TestError::Assertion(format!("nothing resolved after {} cycles", cycles)))
}

// ============================================================================
// Test scenarios
// ============================================================================

/// ADD_PUBLICATION with correlation id 42 on stream 7 resolves to
/// registration 1001, and polling again without new responses changes
/// nothing.
pub fn run_add_publication_resolves() {
    let result = run_add_publication_resolves_inner();
    if let Err(e) = result {
        panic!("run_add_publication_resolves failed: {}", e);
    }
}

fn run_add_publication_resolves_inner() -> Result<(), TestError> {
    let mut stub = DriverStub::start(StubConfig::default())?;
    let mut client = stub.connect()?;
    let handle = client.handle();

    client.cnc().to_driver().set_next_correlation_id(42);
    let correlation_id = handle.async_add_publication("strand:ipc", 7)?;
    if correlation_id != 42 {
        return Err(TestError::Assertion(format!("expected correlation id 42, got {}", correlation_id)));
    }

    let publication = pump_until(&mut stub, &mut client, 10, || handle.poll_publication(42))?;
    if publication.registration_id() != 1001 || publication.stream_id() != 7 {
        return Err(TestError::Assertion(format!("unexpected publication {:?}", publication)));
    }

    client.do_work(Instant::now());
    let again = handle
        .poll_publication(42)?
        .ok_or_else(|| TestError::Assertion("resolved publication went missing".into()))?;
    if again.registration_id() != publication.registration_id() || again.position() != publication.position() {
        return Err(TestError::Assertion(format!("second poll changed the handle: {:?}", again)));
    }
    Ok(())
}

/// A driver that never answers makes the command fail with a driver timeout.
pub fn run_silent_driver_times_out() {
    let result = run_silent_driver_times_out_inner();
    if let Err(e) = result {
        panic!("run_silent_driver_times_out failed: {}", e);
    }
}

fn run_silent_driver_times_out_inner() -> Result<(), TestError> {
    let mut stub = DriverStub::start(StubConfig {
        silent: true,
        ..StubConfig::default()
    })?;
    let (listener, events) = RecordingListener::new();
    let mut client = stub.connect()?.with_listener(listener);
    let handle = client.handle();

    let correlation_id = handle.async_add_publication("strand:ipc", 7)?;
    stub.do_work();
    client.do_work(Instant::now());
    if handle.poll_publication(correlation_id)?.is_some() {
        return Err(TestError::Assertion("silent driver resolved a command".into()));
    }

    client.do_work(Instant::now() + handle.driver_timeout() + Duration::from_millis(1));
    match handle.poll_publication(correlation_id) {
        Err(ClientError::DriverTimeout { correlation_id: id, .. }) if id == correlation_id => {}
        other => return Err(TestError::Assertion(format!("expected a driver timeout, got {:?}", other))),
    }
    match events.try_recv() {
        Ok(ListenerEvent::Error(message)) if message.contains("no response from driver") => Ok(()),
        other => Err(TestError::Assertion(format!("listener saw {:?}", other))),
    }
}

/// Messages offered on a publication arrive, in order, at a subscription
/// on the same channel and stream.
pub fn run_publish_subscribe() {
    let result = run_publish_subscribe_inner();
    if let Err(e) = result {
        panic!("run_publish_subscribe failed: {}", e);
    }
}

fn run_publish_subscribe_inner() -> Result<(), TestError> {
    let mut stub = DriverStub::start(StubConfig::default())?;
    let mut client = stub.connect()?;
    let handle = client.handle();

    let sub_id = handle.async_add_subscription("strand:ipc", 11)?;
    let subscription = pump_until(&mut stub, &mut client, 10, || handle.poll_subscription(sub_id))?;
    let pub_id = handle.async_add_publication("strand:ipc", 11)?;
    let publication = pump_until(&mut stub, &mut client, 10, || handle.poll_publication(pub_id))?;
    if !subscription.is_connected() {
        return Err(TestError::Assertion("subscription has no image".into()));
    }

    let sent: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 100 + usize::from(i)]).collect();
    for message in &sent {
        match publication.offer(message)? {
            OfferOutcome::Published { .. } => {}
            other => return Err(TestError::Assertion(format!("offer returned {:?}", other))),
        }
    }

    let mut received = Vec::new();
    subscription.poll(|payload, _| received.push(payload.to_vec()), 100);
    if received != sent {
        return Err(TestError::Assertion(format!(
            "received {} messages, expected {}",
            received.len(),
            sent.len()
        )));
    }
    Ok(())
}

/// A subscription that stops reading holds the publication back with
/// `PartitionNotFree` instead of being overwritten, and releases it once it
/// catches up.
pub fn run_slow_subscriber_blocks_publisher() {
    let result = run_slow_subscriber_blocks_publisher_inner();
    if let Err(e) = result {
        panic!("run_slow_subscriber_blocks_publisher failed: {}", e);
    }
}

fn run_slow_subscriber_blocks_publisher_inner() -> Result<(), TestError> {
    let mut stub = DriverStub::start(StubConfig::default())?;
    let mut client = stub.connect()?;
    let handle = client.handle();

    let sub_id = handle.async_add_subscription("strand:ipc", 3)?;
    let subscription = pump_until(&mut stub, &mut client, 10, || handle.poll_subscription(sub_id))?;
    let pub_id = handle.async_add_exclusive_publication("strand:ipc", 3)?;
    let publication = pump_until(&mut stub, &mut client, 10, || handle.poll_publication(pub_id))?;

    let message = [7u8; 1024];
    let mut blocked = false;
    for _ in 0..1000 {
        if publication.offer(&message)? == OfferOutcome::PartitionNotFree {
            blocked = true;
            break;
        }
    }
    if !blocked {
        return Err(TestError::Assertion("publisher never saw PartitionNotFree".into()));
    }
    let stalled_at = publication.position();

    let mut fragments = 0;
    for _ in 0..8 {
        fragments += subscription.poll(|_, _| {}, usize::MAX);
    }
    if fragments == 0 {
        return Err(TestError::Assertion("subscription read nothing".into()));
    }

    for _ in 0..4 {
        if let OfferOutcome::Published { position } = publication.offer(&message)? {
            if position <= stalled_at {
                return Err(TestError::Assertion(format!(
                    "position went backwards: {} <= {}",
                    position, stalled_at
                )));
            }
            return Ok(());
        }
    }
    Err(TestError::Assertion("publisher still blocked after the subscriber caught up".into()))
}

/// Closing a client tells the driver, which frees everything it held.
pub fn run_client_close_releases_resources() {
    let result = run_client_close_releases_resources_inner();
    if let Err(e) = result {
        panic!("run_client_close_releases_resources failed: {}", e);
    }
}

fn run_client_close_releases_resources_inner() -> Result<(), TestError> {
    let mut stub = DriverStub::start(StubConfig::default())?;
    let mut client = stub.connect()?;
    let handle: ClientHandle = client.handle();

    let pub_id = handle.async_add_publication("strand:ipc", 1)?;
    let publication = pump_until(&mut stub, &mut client, 10, || handle.poll_publication(pub_id))?;
    if !publication.log_file().exists() {
        return Err(TestError::Assertion("log file missing".into()));
    }

    client.close();
    stub.do_work();
    if stub.conductor().publication_count() != 0 || publication.log_file().exists() {
        return Err(TestError::Assertion("driver kept the publication after close".into()));
    }
    if !publication.is_closed() {
        return Err(TestError::Assertion("publication still open".into()));
    }
    Ok(())
}
