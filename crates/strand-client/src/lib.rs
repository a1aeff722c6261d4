//! strand-client: the client side of the strand control plane.
//!
//! A client attaches to a running driver through its cnc file, asks it for
//! publications and subscriptions over the to-driver ring, and learns the
//! outcome from the to-clients ring. Commands never block: each returns a
//! correlation id that is polled until it resolves, fails, or times out.
//!
//! ```ignore
//! let mut conductor = ClientConductor::connect(ConductorConfig::new("/dev/shm/strand"))?;
//! let client = conductor.handle();
//! let id = client.async_add_publication("strand:ipc", 7)?;
//! let publication = loop {
//!     conductor.do_work(Instant::now());
//!     if let Some(publication) = client.poll_publication(id)? {
//!         break publication;
//!     }
//! };
//! ```

pub mod conductor;
mod error;
pub mod proxy;
mod publication;
pub mod registry;
mod subscription;

pub use conductor::{ClientConductor, ClientHandle, ConductorConfig, ConductorListener};
pub use error::ClientError;
pub use proxy::DriverProxy;
pub use publication::Publication;
pub use registry::{PendingState, ResourceKind};
pub use subscription::Subscription;
