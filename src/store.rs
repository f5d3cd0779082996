//! The hot-swappable holder of the active database handle.
//!
//! Reads are a single atomic pointer load ([`arc_swap::ArcSwap`]) and never wait
//! on a rotation. Installs are serialized by a writer mutex and ordered by
//! generation: a handle built for an older generation than the installed one is
//! refused, so the store only ever moves forward.
//!
//! Replaced handles are released by the store once, after the new pointer is
//! published. Callers holding a [`Lease`] keep the old handle alive; it is
//! dropped (and closed) when the last lease goes away.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use crate::error::{Error, Result};
use crate::prelude::debug;

struct Installed<H> {
    generation: u64,
    handle: Arc<H>,
}

/// Holds the single active handle.
pub struct HandleStore<H> {
    current: ArcSwap<Installed<H>>,
    writer: Mutex<()>,
}

impl<H> HandleStore<H> {
    /// Creates a store with `handle` installed at `generation`.
    pub fn new(generation: u64, handle: H) -> Self {
        Self {
            current: ArcSwap::from_pointee(Installed {
                generation,
                handle: Arc::new(handle),
            }),
            writer: Mutex::new(()),
        }
    }

    /// Leases the current handle.
    ///
    /// The lease stays valid across later swaps.
    pub fn get(&self) -> Lease<H> {
        let installed = self.current.load();
        Lease {
            generation: installed.generation,
            handle: Arc::clone(&installed.handle),
        }
    }

    /// Generation of the installed handle.
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Installs `handle` if `generation` is newer than the installed one.
    ///
    /// Returns the generation it replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleGeneration`] if `generation` is not newer. The
    /// offered handle is dropped.
    pub fn install(&self, generation: u64, handle: H) -> Result<u64> {
        let previous = {
            let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

            let current = self.current.load().generation;
            if generation <= current {
                return Err(Error::StaleGeneration {
                    generation,
                    current,
                });
            }

            self.current.swap(Arc::new(Installed {
                generation,
                handle: Arc::new(handle),
            }))
        };

        let replaced = previous.generation;
        let outstanding = Arc::strong_count(&previous.handle) - 1;
        drop(previous);

        debug!(
            "installed handle generation {generation}, released generation {replaced} \
             ({outstanding} leases outstanding)"
        );
        Ok(replaced)
    }
}

impl<H> fmt::Debug for HandleStore<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleStore")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// A leased handle. Derefs to the handle.
pub struct Lease<H> {
    generation: u64,
    handle: Arc<H>,
}

impl<H> Lease<H> {
    /// Generation this handle was installed at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The shared handle.
    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }
}

impl<H> Clone for Lease<H> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<H> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H> fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    struct Tracked {
        id: u64,
        closed: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(id: u64, closes: &Arc<AtomicUsize>) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    id,
                    closed: Arc::clone(&closed),
                    closes: Arc::clone(closes),
                },
                closed,
            )
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            assert!(!self.closed.swap(true, Ordering::SeqCst), "closed twice");
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn get_returns_installed_handle() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (h1, _) = Tracked::new(1, &closes);
        let store = HandleStore::new(1, h1);

        let lease = store.get();
        assert_eq!(lease.id, 1);
        assert_eq!(lease.generation(), 1);
    }

    #[test]
    fn install_replaces_and_releases_previous() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (h1, h1_closed) = Tracked::new(1, &closes);
        let (h2, h2_closed) = Tracked::new(2, &closes);
        let store = HandleStore::new(1, h1);

        assert_eq!(store.install(2, h2).unwrap(), 1);
        assert_eq!(store.get().id, 2);
        assert_eq!(store.generation(), 2);
        assert!(h1_closed.load(Ordering::SeqCst));
        assert!(!h2_closed.load(Ordering::SeqCst));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_outlives_swap() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (h1, h1_closed) = Tracked::new(1, &closes);
        let (h2, _) = Tracked::new(2, &closes);
        let store = HandleStore::new(1, h1);

        let in_flight = store.get();
        store.install(2, h2).unwrap();

        assert_eq!(in_flight.id, 1);
        assert!(!h1_closed.load(Ordering::SeqCst));

        drop(in_flight);
        assert!(h1_closed.load(Ordering::SeqCst));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_generation_is_rejected_and_dropped() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (h1, _) = Tracked::new(1, &closes);
        let (h3, h3_closed) = Tracked::new(3, &closes);
        let (h2, h2_closed) = Tracked::new(2, &closes);
        let store = HandleStore::new(1, h1);

        store.install(3, h3).unwrap();
        let err = store.install(2, h2).unwrap_err();

        assert!(matches!(
            err,
            Error::StaleGeneration {
                generation: 2,
                current: 3
            }
        ));
        assert!(h2_closed.load(Ordering::SeqCst));
        assert!(!h3_closed.load(Ordering::SeqCst));
        assert_eq!(store.get().id, 3);
    }

    #[test]
    fn equal_generation_is_stale() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (h1, _) = Tracked::new(1, &closes);
        let (dup, _) = Tracked::new(99, &closes);
        let store = HandleStore::new(5, h1);

        assert!(store.install(5, dup).is_err());
        assert_eq!(store.get().id, 1);
    }

    #[test]
    fn concurrent_readers_always_see_an_open_handle() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (h0, _) = Tracked::new(0, &closes);
        let store = Arc::new(HandleStore::new(0, h0));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2_000 {
                        let lease = store.get();
                        assert!(!lease.closed.load(Ordering::SeqCst));
                        assert!(lease.id >= last, "generations went backwards");
                        last = lease.id;
                    }
                })
            })
            .collect();

        for generation in 1..=200 {
            let (h, _) = Tracked::new(generation, &closes);
            store.install(generation, h).unwrap();
        }

        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(closes.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn racing_writers_keep_the_newest() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (h0, _) = Tracked::new(0, &closes);
        let store = Arc::new(HandleStore::new(0, h0));

        let writers: Vec<_> = (1..=8u64)
            .map(|generation| {
                let store = Arc::clone(&store);
                let closes = Arc::clone(&closes);
                thread::spawn(move || {
                    let (h, _) = Tracked::new(generation, &closes);
                    let _ = store.install(generation, h);
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        assert_eq!(store.generation(), 8);
        assert_eq!(store.get().id, 8);
        // Every handle but the installed one was released or rejected.
        assert_eq!(closes.load(Ordering::SeqCst), 8);
    }
}
