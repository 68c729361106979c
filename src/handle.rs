use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::error::{Error, Result};

/// A resource whose cleanup routine must run exactly once, when the last handle to it is
/// disposed.
///
/// `dispose` takes `&self`; implementors use interior mutability where cleanup needs to
/// move state out (e.g. releasing a pooled session).
pub(crate) trait Disposable: Send + Sync {
    /// Resource name used in disposed-resource errors.
    const NAME: &'static str;

    fn dispose(&self);
}

/// A handle to a shared, reference-counted resource.
///
/// Many handle instances may point at the same wrapped value; each `fork` increments the
/// shared count and each handle instance decrements it at most once, on the first of its
/// own `dispose` call or its drop. The wrapped value's [`Disposable::dispose`] runs exactly
/// once, when the count reaches zero.
///
/// A handle instance is single-use: after its own `dispose`, both `fork` and value access
/// fail with a disposed-resource error.
pub(crate) struct RefCountedHandle<T: Disposable> {
    shared: Arc<Shared<T>>,
    disposed: AtomicBool,
}

struct Shared<T> {
    value: T,
    ref_count: AtomicUsize,
}

impl<T: Disposable> RefCountedHandle<T> {
    /// Wrap `value` in a fresh handle with a reference count of one.
    pub(crate) fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                value,
                ref_count: AtomicUsize::new(1),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns a new handle instance sharing the wrapped value, incrementing the shared
    /// reference count.
    ///
    /// A live handle holds at least one reference, so the count cannot concurrently reach
    /// zero while a fork is in flight.
    pub(crate) fn fork(&self) -> Result<Self> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed(T::NAME));
        }
        self.shared.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            shared: Arc::clone(&self.shared),
            disposed: AtomicBool::new(false),
        })
    }

    /// Releases this handle instance's reference. Idempotent at the instance level; the
    /// wrapped value is disposed when the last instance releases.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.value.dispose();
        }
    }

    /// Access the wrapped value, failing if this handle instance has been disposed.
    pub(crate) fn get(&self) -> Result<&T> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed(T::NAME));
        }
        Ok(&self.shared.value)
    }

    /// Whether two handles share the same wrapped value.
    pub(crate) fn same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    #[cfg(test)]
    pub(crate) fn reference_count(&self) -> usize {
        self.shared.ref_count.load(Ordering::SeqCst)
    }
}

impl<T: Disposable> Drop for RefCountedHandle<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Disposable> fmt::Debug for RefCountedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedHandle")
            .field("resource", &T::NAME)
            .field("ref_count", &self.shared.ref_count.load(Ordering::SeqCst))
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{Disposable, RefCountedHandle};

    struct Tracked {
        disposals: Arc<AtomicUsize>,
    }

    impl Disposable for Tracked {
        const NAME: &'static str = "Tracked";

        fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked() -> (RefCountedHandle<Tracked>, Arc<AtomicUsize>) {
        let disposals = Arc::new(AtomicUsize::new(0));
        let handle = RefCountedHandle::new(Tracked {
            disposals: disposals.clone(),
        });
        (handle, disposals)
    }

    #[test]
    fn forks_dispose_exactly_once_in_any_order() {
        for n in 0..5 {
            let (handle, disposals) = tracked();
            let mut handles = vec![handle];
            for _ in 0..n {
                let fork = handles.last().unwrap().fork().unwrap();
                handles.push(fork);
            }
            assert_eq!(handles[0].reference_count(), n + 1);

            // Dispose in an order other than creation order.
            handles.reverse();
            for (i, handle) in handles.iter().enumerate() {
                let expected = if i + 1 == n + 1 { 1 } else { 0 };
                handle.dispose();
                assert_eq!(disposals.load(Ordering::SeqCst), expected);
            }
        }
    }

    #[test]
    fn dispose_is_idempotent_per_instance() {
        let (handle, disposals) = tracked();
        let fork = handle.fork().unwrap();

        fork.dispose();
        fork.dispose();
        fork.dispose();
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        assert_eq!(handle.reference_count(), 1);

        handle.dispose();
        handle.dispose();
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fork_after_dispose_fails() {
        let (handle, _) = tracked();
        handle.dispose();
        assert!(handle.fork().unwrap_err().is_disposed());
        assert!(handle.get().unwrap_err().is_disposed());
    }

    #[test]
    fn fork_of_disposed_sibling_stays_usable() {
        let (handle, disposals) = tracked();
        let fork = handle.fork().unwrap();
        handle.dispose();
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        assert!(fork.get().is_ok());
        fork.dispose();
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_reference() {
        let (handle, disposals) = tracked();
        {
            let _fork = handle.fork().unwrap();
        }
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        drop(handle);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_fork_and_dispose() {
        let (handle, disposals) = tracked();
        let mut join = Vec::new();
        for _ in 0..8 {
            let fork = handle.fork().unwrap();
            join.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let inner = fork.fork().unwrap();
                    inner.dispose();
                }
                fork.dispose();
                fork.dispose();
            }));
        }
        for t in join {
            t.join().unwrap();
        }
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        handle.dispose();
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }
}
