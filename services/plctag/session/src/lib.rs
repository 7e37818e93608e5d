//! Session/request lifecycle for plctag.
//!
//! This crate is the bookkeeping core between the connection layer, which owns
//! sessions to controllers, and the tag layer, which issues read, write and list
//! transactions over them. It guarantees that a session is never torn down
//! while a request still refers to it, that a released request never lingers
//! in a session's list, and that membership changes from the I/O thread,
//! application threads and cleanup paths are serialized.
//!
//! ## Features
//!
//! - **Counted handles**: [`Counted`] gives sessions and requests an atomic
//!   count and a teardown callback that runs once, on the releasing thread
//! - **Request registry**: [`Registry`] attaches requests to the tail of a
//!   session's FIFO and detaches them, holding one session reference per
//!   attached request
//! - **Lock guard**: [`RegistryGuard`] proves the registry lock is held; the
//!   guard-only operations cannot be reached without it
//! - **Detach on teardown**: dropping the last handle of an attached request
//!   detaches it first
//!
//! ## Example
//!
//! ```rust
//! use plctag_session::{Registry, RegistryConfig, RequestKind, Session};
//!
//! let registry = Registry::new(RegistryConfig::default());
//! let session = Session::open("10.0.0.5:44818", Some("1,0".to_string()));
//!
//! let request = registry.create_request(RequestKind::Read, vec![0x4c, 0x02])?;
//! registry.attach(Some(&session), &request)?;
//! assert_eq!(session.ref_count(), 2);
//!
//! // Background I/O walks the pending list under the lock.
//! for pending in registry.lock().pending(&session) {
//!     println!("servicing {} request {}", pending.kind(), pending.id());
//! }
//!
//! let mut slot = Some(request);
//! registry.destroy_request(&mut slot);
//! assert_eq!(session.ref_count(), 1);
//! # Ok::<(), plctag_session::RegistryError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod refcount;
pub mod registry;
pub mod request;
pub mod session;

// Re-export main types
pub use error::RegistryError;
pub use refcount::{Counted, Retired, WeakCounted};
pub use registry::{Registry, RegistryConfig, RegistryGuard, RegistryStats};
pub use request::{Request, RequestHandle, RequestId, RequestKind};
pub use session::{Session, SessionHandle, SessionId};
