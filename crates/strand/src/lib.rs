//! strand: shared-memory messaging through a driver.
//!
//! # Quick Start
//!
//! A driver owns a directory holding the command-and-control file and the
//! publication logs. Clients attach to it, add publications and
//! subscriptions, and then exchange messages directly through the mapped
//! logs.
//!
//! ```ignore
//! use strand::prelude::*;
//!
//! let strand = Strand::connect(Context::from_env())?;
//! let subscription = strand.add_subscription("strand:ipc", 7)?;
//! let publication = strand.add_publication("strand:ipc", 7)?;
//!
//! match publication.offer(b"hello")? {
//!     OfferOutcome::Published { position } => println!("at {position}"),
//!     OfferOutcome::Rotated | OfferOutcome::PartitionNotFree => { /* retry */ }
//! }
//! subscription.poll(|payload, _header| println!("{payload:?}"), 10);
//! ```
//!
//! # Channels
//!
//! Channels are strings of the form `strand:<media>?key=value|key=value`:
//!
//! - `strand:ipc`
//! - `strand:udp?endpoint=localhost:40123|term-length=64k`
//! - `strand:ipc?init-term-id=-1234|term-id=-1230|term-offset=8192` starts an
//!   exclusive publication at an arbitrary position.
//!
//! # Back-pressure
//!
//! Offers never block. [`OfferOutcome::Rotated`] and
//! [`OfferOutcome::PartitionNotFree`] mean nothing was written and the offer
//! should be retried, typically after an [`IdleStrategy`] step.

mod client;
mod context;

pub use client::Strand;
pub use context::{default_dir, Context, ThreadingMode, DIR_ENV, DRIVER_TIMEOUT_ENV, KEEPALIVE_INTERVAL_ENV};

pub use strand_client::{ClientError, ClientHandle, ConductorListener, PendingState, Publication, Subscription};
pub use strand_core::{
    BackoffIdle, BusySpinIdle, ErrorCode, FrameHeader, IdleStrategy, ImageReady, NoOpIdle, SleepingIdle, YieldingIdle,
};
pub use strand_shm::OfferOutcome;

pub use strand_core;
pub use strand_shm;

/// The driver side, for running a driver inside this process.
#[cfg(feature = "driver")]
pub mod driver {
    pub use strand_driver::*;
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use strand::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{ClientError, Context, IdleStrategy, OfferOutcome, Publication, Strand, Subscription, ThreadingMode};
}
