//! strand-shm: shared memory structures for strand.
//!
//! Everything a driver and its clients exchange lives in mapped files:
//!
//! - one **cnc file** per driver holding two [`CommandRing`]s, clients to
//!   driver and driver to clients
//! - one **log buffer** per publication holding three term partitions and a
//!   metadata trailer
//!
//! # Log buffers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Partition 0 (term_length)                                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Partition 1 (term_length)                                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Partition 2 (term_length)                                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Metadata: tails, active term count, consumer positions, constants  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producers claim space in the active partition with an atomic add on its
//! tail counter and commit frames by storing their length. When a term
//! fills up the log rotates to the next partition, but only once every
//! registered consumer has moved past the term that partition last held.

mod error;
mod mapped;

pub mod cnc;
pub mod image;
pub mod join;
pub mod layout;
pub mod log_buffer;
pub mod ring;
pub mod term_appender;
pub mod term_reader;
pub mod writer;

pub use cnc::{CncConfig, CncError, CncFile};
pub use error::LogBufferError;
pub use image::Image;
pub use join::{ExclusivePublicationJoin, JoinPoint};
pub use layout::{LogMetadata, LogParams};
pub use log_buffer::{
    ClaimOutcome, ConsumerSlot, FrameSlot, LogBufferPartitions, PaddingRegion, RotateOutcome,
};
pub use mapped::{MapError, MappedRegion};
pub use ring::{CommandRing, RingError, WriteOutcome};
pub use term_reader::FragmentAssembler;
pub use writer::{OfferOutcome, PublicationWriter};
