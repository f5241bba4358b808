//! In-flight request coalescing.
//!
//! When multiple requests arrive for the same result key simultaneously,
//! only one computation runs; every caller (the first one included)
//! subscribes to a broadcast of the result. The computation itself runs on
//! a detached task, so a cancelled waiter drops out alone and the work
//! keeps running until its own stage deadlines fire.
//!
//! A computation may recursively suppress a key it is already holding
//! (a -> b -> a through a processor's sub-load). The per-request
//! [`SuppressScope`] records held keys so the inner call bypasses
//! coalescing instead of deadlocking on itself.

use crate::blob::Blob;
use crate::error::Error;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result shared with every coalesced waiter.
pub type Outcome = Result<Blob, Error>;

type Entries = Arc<DashMap<String, (u64, broadcast::Sender<Outcome>)>>;

/// Keys held by the current request's call chain.
///
/// One scope is created per request and threaded through recursive loads,
/// standing in for the owner identity a dynamically-scoped context would
/// carry. Detached storage writes deliberately do not inherit it.
#[derive(Clone, Default)]
pub struct SuppressScope {
    held: Arc<Mutex<HashSet<String>>>,
}

impl SuppressScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn holds(&self, key: &str) -> bool {
        self.held.lock().expect("scope lock").contains(key)
    }

    fn enter(&self, key: &str) -> ScopeGuard {
        self.held
            .lock()
            .expect("scope lock")
            .insert(key.to_string());
        ScopeGuard {
            scope: self.clone(),
            key: key.to_string(),
        }
    }
}

struct ScopeGuard {
    scope: SuppressScope,
    key: String,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope
            .held
            .lock()
            .expect("scope lock")
            .remove(&self.key);
    }
}

/// Handle given to the running computation; invoking [`Forget::forget`]
/// removes the key from the in-flight map immediately, so subsequent
/// callers start fresh instead of joining a result that should not be
/// pinned (e.g. a failed load).
pub struct Forget {
    entries: Option<Entries>,
    key: String,
    id: u64,
}

impl Forget {
    /// A no-op handle, used when coalescing is bypassed.
    fn noop() -> Self {
        Self {
            entries: None,
            key: String::new(),
            id: 0,
        }
    }

    pub fn forget(&self) {
        if let Some(entries) = &self.entries {
            entries.remove_if(&self.key, |_, (id, _)| *id == self.id);
        }
    }
}

enum Role {
    Run {
        id: u64,
        tx: broadcast::Sender<Outcome>,
    },
    Join(broadcast::Receiver<Outcome>),
}

/// Process-wide map from key to pending computation.
pub struct Suppressor {
    entries: Entries,
    next_id: AtomicU64,
    total: AtomicU64,
    coalesced: AtomicU64,
}

impl Default for Suppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Suppressor {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            total: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    fn register(&self, key: &str) -> Role {
        // entry API gives an atomic check-and-insert; the guard must not
        // be held across an await
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let rx = entry.get().1.subscribe();
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "joining in-flight computation");
                Role::Join(rx)
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, _rx) = broadcast::channel(16);
                entry.insert((id, tx.clone()));
                Role::Run { id, tx }
            }
        }
    }

    /// Runs `work` once per key, sharing the outcome with concurrent
    /// callers of the same key.
    ///
    /// The computation runs on a detached task; every caller races the
    /// result broadcast against its own cancellation token. A cancelled
    /// caller returns [`Error::Cancelled`] while the computation continues
    /// for everyone else. A key already held by `scope` runs `work`
    /// directly, bypassing coalescing.
    pub async fn suppress<F, Fut>(
        &self,
        scope: &SuppressScope,
        key: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Outcome
    where
        F: FnOnce(Forget) -> Fut,
        Fut: std::future::Future<Output = Outcome> + Send + 'static,
    {
        self.total.fetch_add(1, Ordering::Relaxed);

        if scope.holds(key) {
            debug!(key, "re-entrant suppression, bypassing coalescing");
            return work(Forget::noop()).await;
        }

        let mut work = Some(work);
        loop {
            match self.register(key) {
                Role::Run { id, tx } => {
                    let work = work.take().expect("runner role resolved twice");
                    let forget = Forget {
                        entries: Some(Arc::clone(&self.entries)),
                        key: key.to_string(),
                        id,
                    };
                    let mut rx = tx.subscribe();
                    let entries = Arc::clone(&self.entries);
                    let owned_key = key.to_string();
                    let guard = scope.enter(key);
                    let fut = work(forget);
                    tokio::spawn(async move {
                        let _guard = guard;
                        // a panicking computation must still resolve its
                        // waiters
                        let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(panic) => Err(Error::internal(panic_text(panic))),
                        };
                        // a forgotten key may already host a newer
                        // computation; only remove our own entry
                        entries.remove_if(&owned_key, |_, (eid, _)| *eid == id);
                        let _ = tx.send(outcome);
                    });
                    tokio::select! {
                        received = rx.recv() => {
                            return received.unwrap_or(Err(Error::internal(
                                "suppressed computation dropped",
                            )));
                        }
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                Role::Join(mut rx) => {
                    tokio::select! {
                        received = rx.recv() => match received {
                            Ok(outcome) => return outcome,
                            // the computation vanished without a result;
                            // start over
                            Err(_) => continue,
                        },
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        }
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }

    /// Total calls and how many of them were coalesced onto existing work.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.coalesced.load(Ordering::Relaxed),
        )
    }
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic in suppressed computation".to_string()
    }
}
