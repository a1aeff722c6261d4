use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use strand_client::conductor::{DEFAULT_DRIVER_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL};
use strand_client::{ConductorConfig, ConductorListener};
use strand_core::{BackoffIdle, IdleStrategy};

/// Overrides the driver directory.
pub const DIR_ENV: &str = "STRAND_DIR";
/// Overrides the driver timeout, in milliseconds.
pub const DRIVER_TIMEOUT_ENV: &str = "STRAND_DRIVER_TIMEOUT_MS";
/// Overrides the keepalive interval, in milliseconds.
pub const KEEPALIVE_INTERVAL_ENV: &str = "STRAND_KEEPALIVE_INTERVAL_MS";

/// Who runs the client conductor's duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// A dedicated `strand-client-conductor` thread.
    #[default]
    Dedicated,
    /// The caller, through [`Strand::invoke`](crate::Strand::invoke) and
    /// while waiting on blocking adds.
    Invoker,
}

/// Client configuration.
///
/// ```ignore
/// let strand = Strand::connect(
///     Context::from_env()
///         .driver_timeout(Duration::from_secs(5))
///         .threading_mode(ThreadingMode::Invoker),
/// )?;
/// ```
pub struct Context {
    pub(crate) dir: PathBuf,
    pub(crate) driver_timeout: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) threading_mode: ThreadingMode,
    pub(crate) idle_strategy: Box<dyn IdleStrategy>,
    pub(crate) listener: Option<Box<dyn ConductorListener>>,
}

/// The directory a driver uses when none is configured.
pub fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join("strand")
    } else {
        std::env::temp_dir().join("strand")
    }
}

impl Default for Context {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            driver_timeout: DEFAULT_DRIVER_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            threading_mode: ThreadingMode::default(),
            idle_strategy: Box::new(BackoffIdle::default()),
            listener: None,
        }
    }
}

impl Context {
    /// Defaults: the default directory, a 10 s driver timeout, keepalives
    /// every 500 ms, a dedicated conductor thread.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden by `STRAND_DIR`, `STRAND_DRIVER_TIMEOUT_MS` and
    /// `STRAND_KEEPALIVE_INTERVAL_MS`. Malformed values are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(DIR_ENV).filter(|d| !d.is_empty()) {
            self.dir = PathBuf::from(dir);
        }
        if let Some(timeout) = millis_override(&lookup, DRIVER_TIMEOUT_ENV) {
            self.driver_timeout = timeout;
        }
        if let Some(interval) = millis_override(&lookup, KEEPALIVE_INTERVAL_ENV) {
            self.keepalive_interval = interval;
        }
        self
    }

    /// Directory of the driver's cnc file.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// How long blocking adds wait, and how stale the driver may get.
    pub fn driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }

    /// How often to send keepalives.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Run the conductor on its own thread or on the caller's.
    pub fn threading_mode(mut self, mode: ThreadingMode) -> Self {
        self.threading_mode = mode;
        self
    }

    /// How the conductor thread waits when a cycle found no work.
    pub fn idle_strategy(mut self, idle: impl IdleStrategy + 'static) -> Self {
        self.idle_strategy = Box::new(idle);
        self
    }

    /// Receives image notifications and asynchronous errors.
    pub fn listener(mut self, listener: impl ConductorListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn get_dir(&self) -> &Path {
        &self.dir
    }

    pub fn get_driver_timeout(&self) -> Duration {
        self.driver_timeout
    }

    pub fn get_keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    pub fn get_threading_mode(&self) -> ThreadingMode {
        self.threading_mode
    }

    /// The conductor-level subset of these settings.
    pub fn conductor_config(&self) -> ConductorConfig {
        ConductorConfig {
            dir: self.dir.clone(),
            driver_timeout: self.driver_timeout,
            keepalive_interval: self.keepalive_interval,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("dir", &self.dir)
            .field("driver_timeout", &self.driver_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("threading_mode", &self.threading_mode)
            .field("listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

fn millis_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let value = lookup(key)?;
    match value.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Some(Duration::from_millis(millis)),
        _ => {
            tracing::warn!("ignoring {key}={value:?}: expected a positive number of milliseconds");
            None
        }
    }
}
