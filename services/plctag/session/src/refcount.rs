//! Reference-counted object substrate.
//!
//! Every session and request lives behind a [`Counted`] handle: an atomic
//! reference count plus one teardown callback that runs exactly once, on the
//! thread that releases the last reference, before the value itself is dropped.
//!
//! Acquiring is cloning the handle, releasing is dropping it (or calling
//! [`Counted::release`] to learn whether it was the last one). There is no
//! manual counter arithmetic anywhere in the crate.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

type Teardown<T> = Box<dyn FnOnce(&T) + Send + Sync>;

/// Heap slot shared by all aliases of one object
struct Slot<T> {
    value: T,
    teardown: Option<Teardown<T>>,
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        // Only reachable once the strong count is zero.
        if let Some(teardown) = self.teardown.take() {
            teardown(&self.value);
        }
    }
}

/// Counted handle to a shared object with single-fire teardown
pub struct Counted<T> {
    inner: Arc<Slot<T>>,
}

impl<T> Counted<T> {
    /// Wrap `value` with a count of one and no teardown callback
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Slot {
                value,
                teardown: None,
            }),
        }
    }

    /// Wrap `value` with a count of one and register its teardown callback
    pub fn with_teardown<F>(value: T, teardown: F) -> Self
    where
        F: FnOnce(&T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Slot {
                value,
                teardown: Some(Box::new(teardown)),
            }),
        }
    }

    /// Take one more counted reference
    pub fn acquire(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Give this reference up.
    ///
    /// Returns `true` when it was the last one, in which case the teardown
    /// callback has already run on this thread by the time this returns.
    pub fn release(self) -> bool {
        Arc::into_inner(self.inner).is_some()
    }

    /// Give this reference up but hold back the teardown.
    ///
    /// The count drops immediately. When this was the last reference the
    /// object comes back as a [`Retired`] whose teardown runs when it is
    /// dropped.
    pub fn release_deferred(self) -> Option<Retired<T>> {
        Arc::into_inner(self.inner).map(|slot| Retired { slot })
    }

    /// Current number of counted references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Identity comparison; two handles are equal when they alias one object
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Non-counting observer that never keeps the object alive
    pub fn downgrade(&self) -> WeakCounted<T> {
        WeakCounted {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T> Clone for Counted<T> {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl<T> Deref for Counted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Counted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counted")
            .field("value", &self.inner.value)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Object whose last reference is gone and whose teardown is still pending.
///
/// The teardown runs when this is dropped.
pub struct Retired<T> {
    slot: Slot<T>,
}

impl<T> Retired<T> {
    /// The object about to be torn down
    pub fn get(&self) -> &T {
        &self.slot.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Retired<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retired")
            .field("value", &self.slot.value)
            .finish()
    }
}

/// Observer of a [`Counted`] object that does not hold a reference
pub struct WeakCounted<T> {
    inner: Weak<Slot<T>>,
}

impl<T> WeakCounted<T> {
    /// Acquire a counted reference if the object has not been torn down
    pub fn upgrade(&self) -> Option<Counted<T>> {
        self.inner.upgrade().map(|inner| Counted { inner })
    }

    /// Whether at least one counted reference is still alive
    pub fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> Clone for WeakCounted<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WeakCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCounted")
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(fired: &Arc<AtomicUsize>, value: u32) -> Counted<u32> {
        let fired = Arc::clone(fired);
        Counted::with_teardown(value, move |v| {
            assert_eq!(*v, value);
            fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_acquire_and_release_track_count() {
        let fired = Arc::new(AtomicUsize::new(0));
        let a = counting(&fired, 7);
        assert_eq!(a.ref_count(), 1);

        let b = a.acquire();
        let c = b.clone();
        assert_eq!(a.ref_count(), 3);
        assert!(Counted::ptr_eq(&a, &c));
        assert_eq!(*c, 7);

        assert!(!b.release());
        assert!(!c.release());
        assert_eq!(a.ref_count(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(a.release());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_fires_once_from_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let a = counting(&fired, 1);
        let b = a.clone();
        drop(a);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_runs_on_releasing_thread() {
        let released_on = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&released_on);
        let handle = Counted::with_teardown((), move |_| {
            *slot.lock() = Some(std::thread::current().id());
        });

        let worker = std::thread::spawn(move || {
            let id = std::thread::current().id();
            assert!(handle.release());
            id
        });
        let worker_id = worker.join().unwrap();

        assert_eq!(*released_on.lock(), Some(worker_id));
    }

    #[test]
    fn test_deferred_release_runs_teardown_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let a = counting(&fired, 5);
        let b = a.acquire();
        let weak = a.downgrade();

        assert!(a.release_deferred().is_none());
        assert_eq!(b.ref_count(), 1);

        let retired = b.release_deferred().unwrap();
        assert!(!weak.is_live());
        assert_eq!(*retired.get(), 5);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(retired);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weak_does_not_keep_alive() {
        let fired = Arc::new(AtomicUsize::new(0));
        let a = counting(&fired, 3);
        let weak = a.downgrade();
        assert!(weak.is_live());
        assert_eq!(*weak.upgrade().unwrap(), 3);

        drop(a);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!weak.is_live());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_concurrent_release_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let root = counting(&fired, 9);
        let handles: Vec<_> = (0..16).map(|_| root.acquire()).collect();
        drop(root);

        std::thread::scope(|s| {
            for h in handles {
                s.spawn(move || {
                    h.release();
                });
            }
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
