//! strand-driver: the media driver side of strand.
//!
//! The driver owns the cnc file that clients attach to, turns channel
//! strings into log files, and answers client commands. Clients never talk
//! to each other directly; they only share the log files the driver hands
//! out.
//!
//! ```text
//!   client ──commands──▶ to-driver ring ──▶ DriverConductor
//!   client ◀──responses── to-clients ring ◀──┘      │
//!                                                    ▼
//!                                      publications/<id>.logbuffer
//! ```

pub mod address;
pub mod channel_uri;
pub mod conductor;
mod error;
pub mod log_factory;
pub mod resolver;

pub use address::{AddressError, Endpoint};
pub use channel_uri::{ChannelUri, ChannelUriError, JoinParams};
pub use conductor::{DriverConductor, DriverConfig};
pub use error::DriverError;
pub use log_factory::{CreatedLog, LogDefaults, LogFactory, LogRequest};
pub use resolver::{DefaultNameResolver, LookupTableError, NameResolver, StaticTableNameResolver};
