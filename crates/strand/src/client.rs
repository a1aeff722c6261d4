use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use strand_client::{ClientConductor, ClientError, ClientHandle, Publication, Subscription};
use strand_core::{BackoffIdle, IdleStrategy};

use crate::{Context, ThreadingMode};

const CONDUCTOR_THREAD_NAME: &str = "strand-client-conductor";

enum Runner {
    Dedicated {
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    },
    Invoker(Mutex<ClientConductor>),
}

/// A connected client.
///
/// Blocking adds wait for the driver's answer, bounded by the driver
/// timeout. The `async_*`/`poll_*` pairs never block.
pub struct Strand {
    handle: ClientHandle,
    runner: Runner,
}

impl Strand {
    /// Attach to the driver in `ctx`'s directory and start the conductor.
    pub fn connect(ctx: Context) -> Result<Self, ClientError> {
        let mut conductor = ClientConductor::connect(ctx.conductor_config())?;
        if let Some(listener) = ctx.listener {
            conductor = conductor.with_listener(listener);
        }
        let handle = conductor.handle();

        let runner = match ctx.threading_mode {
            ThreadingMode::Invoker => Runner::Invoker(Mutex::new(conductor)),
            ThreadingMode::Dedicated => {
                let stop = Arc::new(AtomicBool::new(false));
                let mut idle = ctx.idle_strategy;
                let thread = thread::Builder::new()
                    .name(CONDUCTOR_THREAD_NAME.into())
                    .spawn({
                        let stop = Arc::clone(&stop);
                        move || {
                            while !stop.load(Ordering::Acquire) {
                                let work = conductor.do_work(Instant::now());
                                idle.idle(work);
                            }
                            conductor.close();
                        }
                    })
                    .map_err(ClientError::ConductorThread)?;
                Runner::Dedicated {
                    stop,
                    thread: Some(thread),
                }
            }
        };

        tracing::debug!("strand client {} ready", handle.client_id());
        Ok(Self { handle, runner })
    }

    /// Id the driver knows this client by.
    pub fn client_id(&self) -> i64 {
        self.handle.client_id()
    }

    /// Whether [`close`](Self::close) has run, or the driver dropped the client.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// The non-blocking side of the client.
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Run one conductor duty cycle in invoker mode. Does nothing when a
    /// dedicated thread runs the conductor.
    pub fn invoke(&self) -> usize {
        match &self.runner {
            Runner::Invoker(conductor) => conductor.lock().do_work(Instant::now()),
            Runner::Dedicated { .. } => 0,
        }
    }

    /// Add a shared publication and wait for the driver to answer.
    ///
    /// Publications on the same channel and stream share one log.
    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<Publication, ClientError> {
        let correlation_id = self.handle.async_add_publication(channel, stream_id)?;
        self.await_resource(correlation_id, |id| self.handle.poll_publication(id))
    }

    /// A publication with a single writer. Only one thread may offer to it at
    /// a time.
    pub fn add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<Publication, ClientError> {
        let correlation_id = self.handle.async_add_exclusive_publication(channel, stream_id)?;
        self.await_resource(correlation_id, |id| self.handle.poll_publication(id))
    }

    /// Add a subscription and wait for the driver to answer. Images arrive
    /// later, as publications on the channel appear.
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<Subscription, ClientError> {
        let correlation_id = self.handle.async_add_subscription(channel, stream_id)?;
        self.await_resource(correlation_id, |id| self.handle.poll_subscription(id))
    }

    /// Start adding a shared publication. Poll for it with
    /// [`poll_publication`](Self::poll_publication).
    pub fn async_add_publication(&self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        self.handle.async_add_publication(channel, stream_id)
    }

    /// Start adding an exclusive publication.
    pub fn async_add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        self.handle.async_add_exclusive_publication(channel, stream_id)
    }

    /// Start adding a subscription. Poll for it with
    /// [`poll_subscription`](Self::poll_subscription).
    pub fn async_add_subscription(&self, channel: &str, stream_id: i32) -> Result<i64, ClientError> {
        self.handle.async_add_subscription(channel, stream_id)
    }

    /// `Ok(None)` until the driver answers. A failure is reported once.
    pub fn poll_publication(&self, correlation_id: i64) -> Result<Option<Publication>, ClientError> {
        self.handle.poll_publication(correlation_id)
    }

    /// `Ok(None)` until the driver answers. A failure is reported once.
    pub fn poll_subscription(&self, correlation_id: i64) -> Result<Option<Subscription>, ClientError> {
        self.handle.poll_subscription(correlation_id)
    }

    /// Stop the conductor and tell the driver this client is gone.
    pub fn close(&mut self) {
        match &mut self.runner {
            Runner::Dedicated { stop, thread } => {
                stop.store(true, Ordering::Release);
                if let Some(thread) = thread.take() {
                    if thread.join().is_err() {
                        tracing::warn!("conductor thread panicked");
                    }
                }
            }
            Runner::Invoker(conductor) => conductor.get_mut().close(),
        }
    }

    fn await_resource<T, F>(&self, correlation_id: i64, mut poll: F) -> Result<T, ClientError>
    where
        F: FnMut(i64) -> Result<Option<T>, ClientError>,
    {
        // The conductor times the command out; this only guards against a
        // conductor that has stopped running.
        let deadline = Instant::now() + self.handle.driver_timeout() * 2;
        let mut idle = BackoffIdle::default();
        loop {
            let work = self.invoke();
            if let Some(resource) = poll(correlation_id)? {
                return Ok(resource);
            }
            if self.is_closed() {
                return Err(ClientError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::DriverTimeout {
                    correlation_id,
                    timeout: self.handle.driver_timeout(),
                });
            }
            idle.idle(work);
        }
    }
}

impl Drop for Strand {
    fn drop(&mut self) {
        self.close();
    }
}
