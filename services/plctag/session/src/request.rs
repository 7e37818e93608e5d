//! Request entity: one in-flight read, write or list transaction.
//!
//! Requests are created through [`Registry::create_request`](crate::Registry::create_request),
//! which registers the teardown that detaches the request from its session
//! when the last [`RequestHandle`] goes away.

use crate::refcount::Counted;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static REQUEST_ID_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// Request identity; the registry matches requests by identity only
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    fn next() -> Self {
        Self(REQUEST_ID_GENERATOR.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction type carried by a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Tag read
    Read,
    /// Tag write
    Write,
    /// Tag listing
    List,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Read => "read",
            RequestKind::Write => "write",
            RequestKind::List => "list",
        };
        f.write_str(name)
    }
}

/// Counted handle to a request
pub type RequestHandle = Counted<Request>;

/// One protocol transaction
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    /// Encoded request body, prepared by the encoding layer
    payload: Bytes,
    created_at: Instant,
    /// Mirrors membership in the registry; written only under the registry lock
    attached: AtomicBool,
}

impl Request {
    pub(crate) fn new(kind: RequestKind, payload: Bytes) -> Self {
        Self {
            id: RequestId::next(),
            kind,
            payload,
            created_at: Instant::now(),
            attached: AtomicBool::new(false),
        }
    }

    /// Request identity
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Transaction type
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Encoded request body
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// When the request was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the request currently sits in some session's list.
    ///
    /// Only stable while the caller holds the registry lock.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_is_detached() {
        let req = Request::new(RequestKind::Read, Bytes::from_static(b"\x4c\x02"));
        assert!(!req.is_attached());
        assert_eq!(req.kind(), RequestKind::Read);
        assert_eq!(req.payload().as_ref(), b"\x4c\x02");
        assert!(req.age() >= Duration::ZERO);
    }

    #[test]
    fn test_request_ids_increase() {
        let a = Request::new(RequestKind::Write, Bytes::new());
        let b = Request::new(RequestKind::List, Bytes::new());
        assert!(b.id() > a.id());
        assert_eq!(RequestKind::List.to_string(), "list");
    }
}
