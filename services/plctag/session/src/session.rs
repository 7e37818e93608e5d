//! Session entity: one persistent connection to a controller.
//!
//! The connection layer opens sessions and owns one counted reference to each.
//! Every request attached through the [`Registry`](crate::Registry) holds one
//! more, so a session with pending requests can never reach its teardown.
//! The session's FIFO of pending requests is kept by the registry, keyed by
//! [`SessionId`], under the registry lock.

use crate::refcount::Counted;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

static SESSION_ID_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// Stable session identity
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        Self(SESSION_ID_GENERATOR.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counted handle to a session
pub type SessionHandle = Counted<Session>;

/// A persistent connection to a controller
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    /// Gateway address label, e.g. `10.0.0.5:44818`
    gateway: String,
    /// Routing path to the controller behind the gateway (opaque here)
    path: Option<String>,
    opened_at: Instant,
}

impl Session {
    /// Open a session record with a count of one held by the caller
    pub fn open(gateway: impl Into<String>, path: Option<String>) -> SessionHandle {
        Self::open_with_teardown(gateway, path, |_| {})
    }

    /// Open a session record and register the callback run when its last
    /// reference is released
    pub fn open_with_teardown<F>(
        gateway: impl Into<String>,
        path: Option<String>,
        teardown: F,
    ) -> SessionHandle
    where
        F: FnOnce(&Session) + Send + Sync + 'static,
    {
        let session = Session {
            id: SessionId::next(),
            gateway: gateway.into(),
            path,
            opened_at: Instant::now(),
        };
        debug!("Opened session {} to {}", session.id, session.gateway);

        Counted::with_teardown(session, move |session| {
            debug!(
                "Tearing down session {} after {:?}",
                session.id,
                session.uptime()
            );
            teardown(session);
        })
    }

    /// Session identity
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Gateway address label
    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// Routing path, if any
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// When the session record was opened
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Time since the session was opened
    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }
}
