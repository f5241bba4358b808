//! Admission control for processing work.
//!
//! A two-tier limiter: up to `concurrency` requests execute at once and up
//! to `queue_size` more wait for a slot. A request arriving when both
//! tiers are full is rejected immediately with
//! [`Error::TooManyRequests`]. Waiting honors the caller's cancellation
//! token; deadlines are enforced by the request-level timeout wrapping the
//! acquire.

use crate::error::Error;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounded admission controller.
///
/// `concurrency` of 0 disables the execution limit; `queue_size` of 0
/// disables the waiting bound (waiters are limited only by their own
/// deadlines). With both at 0 the gate is a no-op.
pub struct Gate {
    /// Execution slots (capacity = concurrency).
    process: Option<Arc<Semaphore>>,
    /// Admission tokens (capacity = concurrency + queue_size); holding one
    /// means the request is either executing or queued.
    admit: Option<Arc<Semaphore>>,
    concurrency: usize,
    queue_size: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
    rejected: AtomicU64,
}

/// Held for the duration of one admitted request; slots free on drop.
pub struct GatePermit {
    _process: Option<OwnedSemaphorePermit>,
    _admit: Option<OwnedSemaphorePermit>,
    in_flight: Option<Arc<AtomicUsize>>,
}

impl Gate {
    pub fn new(concurrency: usize, queue_size: usize) -> Self {
        let process = (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency)));
        let admit = (concurrency > 0 && queue_size > 0)
            .then(|| Arc::new(Semaphore::new(concurrency + queue_size)));
        Self {
            process,
            admit,
            concurrency,
            queue_size,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// A gate with no limits at all.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn is_disabled(&self) -> bool {
        self.process.is_none()
    }

    /// Admits one request, waiting for an execution slot if necessary.
    ///
    /// Returns [`Error::TooManyRequests`] when both tiers are full and
    /// [`Error::Cancelled`] when the caller goes away while queued.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, Error> {
        let admit = match &self.admit {
            Some(admit) => match Arc::clone(admit).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        concurrency = self.concurrency,
                        queue_size = self.queue_size,
                        "gate full, rejecting request"
                    );
                    return Err(Error::TooManyRequests);
                }
            },
            None => None,
        };

        let process = match &self.process {
            Some(sem) => {
                let sem = Arc::clone(sem);
                tokio::select! {
                    permit = sem.acquire_owned() => {
                        Some(permit.expect("gate semaphore closed"))
                    }
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
            None => None,
        };

        let in_flight = if process.is_some() {
            let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
            self.update_peak(current);
            Some(Arc::clone(&self.in_flight))
        } else {
            None
        };

        Ok(GatePermit {
            _process: process,
            _admit: admit,
            in_flight,
        })
    }

    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_in_flight.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_in_flight.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }

    /// Execution slots configured (0 = unlimited).
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Waiting slots configured (0 = unbounded waiting).
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Requests rejected outright since startup.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Requests currently holding an execution slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Peak concurrent executions observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(counter) = &self.in_flight {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disabled_gate_admits_everything() {
        let gate = Gate::disabled();
        assert!(gate.is_disabled());
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            // permits drop immediately; nothing blocks
            gate.acquire(&cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejects_when_both_tiers_full() {
        let gate = Arc::new(Gate::new(1, 1));
        let cancel = CancellationToken::new();

        let executing = gate.acquire(&cancel).await.unwrap();

        // second request occupies the queue slot
        let gate2 = Arc::clone(&gate);
        let queued = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            gate2.acquire(&cancel).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // third request finds both tiers full
        assert_eq!(gate.acquire(&cancel).await.err(), Some(Error::TooManyRequests));
        assert_eq!(gate.rejected(), 1);

        drop(executing);
        assert!(queued.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_queue_drains_in_order_of_release() {
        let gate = Arc::new(Gate::new(2, 4));
        let cancel = CancellationToken::new();

        let mut held = Vec::new();
        for _ in 0..2 {
            held.push(gate.acquire(&cancel).await.unwrap());
        }

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            waiters.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                gate.acquire(&cancel).await.map(drop)
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        // a seventh concurrent request is refused
        assert_eq!(gate.acquire(&cancel).await.err(), Some(Error::TooManyRequests));

        held.clear();
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_cancelled_waiter_returns_cancelled() {
        let gate = Arc::new(Gate::new(1, 0));
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let gate2 = Arc::clone(&gate);
        let cancel2 = waiter_cancel.clone();
        let waiter = tokio::spawn(async move { gate2.acquire(&cancel2).await.map(drop) });
        tokio::time::sleep(Duration::from_millis(10)).await;

        waiter_cancel.cancel();
        assert_eq!(waiter.await.unwrap().err(), Some(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_unbounded_queue_when_size_zero() {
        let gate = Arc::new(Gate::new(1, 0));
        let cancel = CancellationToken::new();
        let held = gate.acquire(&cancel).await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..20 {
            let gate = Arc::clone(&gate);
            waiters.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                gate.acquire(&cancel).await.map(drop)
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        // nobody was rejected
        assert_eq!(gate.rejected(), 0);

        drop(held);
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
    }
}
