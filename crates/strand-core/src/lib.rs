//! strand-core: the pieces every other strand crate agrees on.
//!
//! - [`position`]: term/offset addressing of stream positions
//! - [`frame`]: frame header layout inside a term
//! - [`buffer`]: atomic, bounds-checked views over shared memory
//! - [`command`]: the client/driver control-plane messages
//! - [`idle`]: retry and back-off policies for duty-cycle loops
//! - [`clock`]: epoch time for heartbeats in shared memory
//!
//! Nothing in this crate performs I/O.

pub mod buffer;
pub mod clock;
pub mod command;
pub mod frame;
pub mod idle;
pub mod position;

pub use buffer::{AtomicBuffer, HeapRegion, Region};
pub use command::{
    msg_type, CodecError, Command, CommandMessage, ErrorCode, ImageReady, PublicationReady, Response,
};
pub use frame::{FrameHeader, FrameType, HeaderTemplate, HEADER_LENGTH};
pub use idle::{BackoffIdle, BusySpinIdle, IdleStrategy, NoOpIdle, SleepingIdle, YieldingIdle};
pub use position::{
    PositionCodec, PositionError, FRAME_ALIGNMENT, PARTITION_COUNT, TERM_MAX_LENGTH, TERM_MIN_LENGTH,
};
