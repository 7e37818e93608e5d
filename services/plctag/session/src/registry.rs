//! Request registry: which requests are in flight on which session.
//!
//! One mutex serializes every membership change across all sessions. Holding
//! it is proved by a [`RegistryGuard`]; the operations that need the lock
//! already held are methods on the guard, the ones on [`Registry`] take and
//! release it themselves. The lock is not reentrant: never call a
//! [`Registry`] method while the same thread holds a guard on it.
//!
//! Under the lock the registry keeps, per session, the FIFO of pending
//! requests (non-owning, by identity) and, per request, the counted session
//! reference that backs its attachment. Attaching acquires that reference and
//! detaching drops it, so a session's reference count is always its external
//! holders plus its attached requests.
//!
//! Dropping the last handle of an attached request detaches it. When that
//! happens on the thread that holds the guard, the detach is deferred until
//! the guard is released. Session references are given up under the lock,
//! but a session whose last reference goes that way is torn down only after
//! unlock, so session teardown callbacks may use the registry.

use crate::error::RegistryError;
use crate::refcount::{Counted, Retired, WeakCounted};
use crate::request::{Request, RequestHandle, RequestId, RequestKind};
use crate::session::{Session, SessionHandle, SessionId};
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Process-wide registry for callers that want a single global lock
static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(|| Registry::new(RegistryConfig::default()));

static THREAD_TOKEN_GENERATOR: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = THREAD_TOKEN_GENERATOR.fetch_add(1, Ordering::Relaxed);
}

/// Token of the calling thread, 0 once its thread-locals are gone
fn thread_token() -> u64 {
    THREAD_TOKEN.try_with(|token| *token).unwrap_or(0)
}

/// Registry configuration
#[derive(Clone, Debug, Default)]
pub struct RegistryConfig {
    /// Upper bound on live requests; `None` for unbounded
    pub max_requests: Option<usize>,
    /// Report detaching a request that is not on the named session as an error
    pub strict_detach: bool,
}

/// Point-in-time registry counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Requests created and not yet torn down
    pub live_requests: usize,
    /// Requests currently attached to a session
    pub attached_requests: usize,
    /// Sessions with at least one attached request
    pub sessions_with_pending: usize,
}

/// Entry in a session's pending FIFO
struct Pending {
    id: RequestId,
    request: WeakCounted<Request>,
}

#[derive(Default)]
struct RegistryState {
    /// Per-session FIFO of attached requests
    queues: HashMap<SessionId, VecDeque<Pending>>,
    /// Per-request back-reference; owns the request's counted session reference
    attachments: HashMap<RequestId, SessionHandle>,
}

impl RegistryState {
    fn link(&mut self, session: &SessionHandle, request: &RequestHandle) {
        self.queues
            .entry(session.id())
            .or_default()
            .push_back(Pending {
                id: request.id(),
                request: request.downgrade(),
            });

        // Count only once the request is reachable from the session.
        self.attachments.insert(request.id(), session.acquire());
    }

    fn unlink(&mut self, id: RequestId) -> Option<SessionHandle> {
        let session = self.attachments.remove(&id)?;

        if let Entry::Occupied(mut queue) = self.queues.entry(session.id()) {
            if let Some(pos) = queue.get().iter().position(|pending| pending.id == id) {
                queue.get_mut().remove(pos);
            }
            if queue.get().is_empty() {
                queue.remove();
            }
        }

        Some(session)
    }

    fn is_on(&self, session: &SessionHandle, id: RequestId) -> bool {
        self.attachments
            .get(&id)
            .is_some_and(|attached| Counted::ptr_eq(attached, session))
    }
}

struct Shared {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    /// Thread token of the lock holder, 0 while unlocked
    holder: AtomicU64,
    /// Attached requests torn down by the lock holder, detached on unlock
    deferred: Mutex<Vec<RequestId>>,
    live_requests: AtomicUsize,
}

impl Shared {
    fn held_by_current_thread(&self) -> bool {
        let token = thread_token();
        token != 0 && self.holder.load(Ordering::Acquire) == token
    }

    fn lock(&self) -> RegistryGuard<'_> {
        let state = self.state.lock();
        self.holder.store(thread_token(), Ordering::Release);
        RegistryGuard {
            shared: self,
            state,
            retired: Vec::new(),
        }
    }

    /// Teardown of a request whose last handle is gone
    fn retire(&self, request: &Request) {
        self.live_requests.fetch_sub(1, Ordering::AcqRel);

        // Nobody else can reach the request anymore, so the flag is stable.
        if !request.is_attached() {
            debug!("Request {} released while detached", request.id());
            return;
        }

        if self.held_by_current_thread() {
            debug!(
                "Request {} released under the registry lock, detaching on unlock",
                request.id()
            );
            self.deferred.lock().push(request.id());
            return;
        }

        debug!("Request {} released while attached, detaching", request.id());
        let mut guard = self.lock();
        guard.release_attachment(request.id());
    }
}

/// Owner of the registry lock and the session/request membership it guards
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Create a registry with its own lock
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(RegistryState::default()),
                holder: AtomicU64::new(0),
                deferred: Mutex::new(Vec::new()),
                live_requests: AtomicUsize::new(0),
            }),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static Registry {
        &GLOBAL_REGISTRY
    }

    /// Configuration this registry was built with
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Acquire the registry lock.
    ///
    /// The lock is released when the guard is dropped, on every exit path.
    pub fn lock(&self) -> RegistryGuard<'_> {
        debug_assert!(
            !self.shared.held_by_current_thread(),
            "registry lock is not reentrant"
        );
        self.shared.lock()
    }

    /// Create a detached request with a count of one.
    ///
    /// Dropping its last handle detaches it from its session before the
    /// storage is released.
    pub fn create_request(
        &self,
        kind: RequestKind,
        payload: impl Into<Bytes>,
    ) -> Result<RequestHandle, RegistryError> {
        let live = match self.shared.config.max_requests {
            Some(limit) => self
                .shared
                .live_requests
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map_err(|_| {
                    warn!("Request pool exhausted at {} live requests", limit);
                    RegistryError::OutOfMemory { limit }
                })?,
            None => self.shared.live_requests.fetch_add(1, Ordering::AcqRel),
        };

        let shared = Arc::clone(&self.shared);
        let request = Counted::with_teardown(Request::new(kind, payload.into()), move |request| {
            shared.retire(request)
        });

        debug!(
            "Created {} request {} ({} live)",
            kind,
            request.id(),
            live + 1
        );
        Ok(request)
    }

    /// Attach `request` to the tail of `session`'s list.
    ///
    /// See [`RegistryGuard::attach`].
    pub fn attach(
        &self,
        session: Option<&SessionHandle>,
        request: &RequestHandle,
    ) -> Result<(), RegistryError> {
        let mut guard = self.lock();
        guard.attach(session, request)
    }

    /// Detach `request` from `session`. Missing arguments are a no-op and do
    /// not take the lock.
    ///
    /// See [`RegistryGuard::detach`].
    pub fn detach(
        &self,
        session: Option<&SessionHandle>,
        request: Option<&RequestHandle>,
    ) -> Result<(), RegistryError> {
        if session.is_none() || request.is_none() {
            return Ok(());
        }

        let mut guard = self.lock();
        guard.detach(session, request)
    }

    /// Detach the request in `slot` from its session and drop the caller's
    /// reference, leaving `slot` empty. An empty slot is a no-op.
    pub fn destroy_request(&self, slot: &mut Option<RequestHandle>) {
        if slot.is_none() {
            return;
        }

        let mut guard = self.lock();
        guard.destroy(slot);
    }

    /// Number of requests attached to `session`
    pub fn outstanding(&self, session: &SessionHandle) -> usize {
        self.lock().outstanding(session)
    }

    /// Snapshot of the registry counters
    pub fn stats(&self) -> RegistryStats {
        self.lock().stats()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.shared.config)
            .field("live_requests", &self.shared.live_requests.load(Ordering::Relaxed))
            .finish()
    }
}

/// Proof that the registry lock is held by this thread
pub struct RegistryGuard<'a> {
    shared: &'a Shared,
    state: MutexGuard<'a, RegistryState>,
    /// Sessions released for the last time under the lock. Declared after
    /// `state` so their teardown runs once the lock is gone.
    retired: Vec<Retired<Session>>,
}

impl RegistryGuard<'_> {
    /// Append `request` to `session`'s list and acquire one session reference
    /// on its behalf.
    ///
    /// A request already on another session is detached from it first.
    /// Re-attaching to the same session keeps its position. A missing session
    /// fails with [`RegistryError::NullSession`] and leaves the request as it
    /// was.
    pub fn attach(
        &mut self,
        session: Option<&SessionHandle>,
        request: &RequestHandle,
    ) -> Result<(), RegistryError> {
        let Some(session) = session else {
            warn!("Session is null, request {} left unattached", request.id());
            return Err(RegistryError::NullSession);
        };

        debug!(
            "Starting. session={} request={}",
            session.id(),
            request.id()
        );

        let current = self
            .state
            .attachments
            .get(&request.id())
            .map(|attached| (attached.id(), Counted::ptr_eq(attached, session)));

        match current {
            Some((_, true)) => {
                debug!(
                    "Request {} already attached to session {}",
                    request.id(),
                    session.id()
                );
                return Ok(());
            }
            Some((previous, false)) => {
                debug!(
                    "Moving request {} from session {} to session {}",
                    request.id(),
                    previous,
                    session.id()
                );
                self.release_attachment(request.id());
            }
            None => {}
        }

        self.state.link(session, request);
        request.set_attached(true);

        debug!("Done.");
        Ok(())
    }

    /// Remove `request` from `session`'s list and release the session
    /// reference its attachment held.
    ///
    /// Missing arguments are a no-op. A request attached to a different
    /// session is detached from that session instead, and a request on no
    /// session is left alone. With strict detaching both cases fail with
    /// [`RegistryError::NotAttached`] and change nothing.
    pub fn detach(
        &mut self,
        session: Option<&SessionHandle>,
        request: Option<&RequestHandle>,
    ) -> Result<(), RegistryError> {
        let (Some(session), Some(request)) = (session, request) else {
            return Ok(());
        };

        debug!(
            "Starting. session={} request={}",
            session.id(),
            request.id()
        );

        let current = self
            .state
            .attachments
            .get(&request.id())
            .map(|attached| (attached.id(), Counted::ptr_eq(attached, session)));

        match current {
            Some((_, true)) => {}
            Some((actual, false)) => {
                debug!(
                    "Request {} not found in session {}, attached to session {}",
                    request.id(),
                    session.id(),
                    actual
                );
                if self.shared.config.strict_detach {
                    return Err(RegistryError::NotAttached {
                        request: request.id(),
                        session: session.id(),
                    });
                }
            }
            None => {
                debug!(
                    "Request {} not found in session {}",
                    request.id(),
                    session.id()
                );
                if self.shared.config.strict_detach {
                    return Err(RegistryError::NotAttached {
                        request: request.id(),
                        session: session.id(),
                    });
                }
                return Ok(());
            }
        }

        self.release_attachment(request.id());
        request.set_attached(false);

        debug!("Done.");
        Ok(())
    }

    /// Detach the request in `slot` from whatever session it is on, then drop
    /// the caller's reference and empty the slot.
    pub fn destroy(&mut self, slot: &mut Option<RequestHandle>) {
        let Some(request) = slot.take() else {
            return;
        };

        debug!("Destroying request {}", request.id());

        if self.release_attachment(request.id()) {
            request.set_attached(false);
        }

        if request.release() {
            debug!("Request storage released");
        }
    }

    /// Live requests attached to `session`, in FIFO order
    pub fn pending(&self, session: &SessionHandle) -> Vec<RequestHandle> {
        self.state
            .queues
            .get(&session.id())
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|pending| pending.request.upgrade())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identities of the live requests attached to `session`, in FIFO order
    pub fn pending_ids(&self, session: &SessionHandle) -> Vec<RequestId> {
        self.state
            .queues
            .get(&session.id())
            .map(|queue| {
                queue
                    .iter()
                    .filter(|pending| pending.request.is_live())
                    .map(|pending| pending.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of requests attached to `session`.
    ///
    /// Counts requests released under this guard too; their detach runs on
    /// unlock, so each still holds its session reference.
    pub fn outstanding(&self, session: &SessionHandle) -> usize {
        self.state
            .queues
            .get(&session.id())
            .map_or(0, VecDeque::len)
    }

    /// Whether `request` is on `session`'s list
    pub fn contains(&self, session: &SessionHandle, request: &RequestHandle) -> bool {
        self.state.is_on(session, request.id())
    }

    /// Counted reference to the session `request` is attached to
    pub fn attached_session(&self, request: &RequestHandle) -> Option<SessionHandle> {
        self.state
            .attachments
            .get(&request.id())
            .map(Counted::acquire)
    }

    /// Snapshot of the registry counters
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_requests: self.shared.live_requests.load(Ordering::Acquire),
            attached_requests: self.state.attachments.len(),
            sessions_with_pending: self.state.queues.len(),
        }
    }

    /// Unlink `id` and release its session reference. A last release keeps
    /// the session's teardown until unlock.
    fn release_attachment(&mut self, id: RequestId) -> bool {
        match self.state.unlink(id) {
            Some(session) => {
                if let Some(retired) = session.release_deferred() {
                    debug!("Session {} released, closing on unlock", retired.get().id());
                    self.retired.push(retired);
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        let deferred = std::mem::take(&mut *self.shared.deferred.lock());
        for id in deferred {
            debug!("Detaching request {} released under the lock", id);
            self.release_attachment(id);
        }

        self.shared.holder.store(0, Ordering::Release);
    }
}
