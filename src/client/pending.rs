//! Pending-call registry.
//!
//! Tracks in-flight requests by correlation id. Each entry is settled exactly
//! once, by whichever comes first: `resolve`, `reject`, or its timeout timer.
//! Settling removes the entry, so `len()` returns to zero once every
//! outstanding call has completed.
//!
//! The map is guarded by a `std::sync::Mutex` that is never held across an
//! `.await`; senders are completed after the guard is released.

use crate::{CorrelationId, Result, RpcError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The map has no invariants spanning multiple entries; the worst outcome
/// of a poisoned lock is a dropped or unmatched response.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Entry<T> {
    // ---
    seq: u64,
    tx: oneshot::Sender<Result<T>>,
    timer: Option<JoinHandle<()>>,
}

struct Shared<T> {
    // ---
    entries: Mutex<HashMap<CorrelationId, Entry<T>>>,
    next_seq: AtomicU64,
    timeout: Option<Duration>,
}

impl<T> Shared<T> {
    // ---

    /// Remove and settle `id`. Returns false if it was not pending.
    fn settle(&self, id: &CorrelationId, outcome: Result<T>) -> bool {
        // ---
        let entry = lock_ignore_poison(&self.entries).remove(id);

        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                // Receiver may already be gone (caller stopped waiting).
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Timer path: only settles the entry it was armed for.
    fn expire(&self, id: &CorrelationId, seq: u64) {
        // ---
        let entry = {
            let mut entries = lock_ignore_poison(&self.entries);
            match entries.get(id) {
                Some(entry) if entry.seq == seq => entries.remove(id),
                _ => None,
            }
        };

        if let Some(entry) = entry {
            crate::log_debug!("pending call {id} timed out");
            let _ = entry.tx.send(Err(RpcError::Timeout));
        }
    }

    /// Drop path: release the entry without settling it.
    fn discard(&self, id: &CorrelationId, seq: u64) {
        // ---
        let entry = {
            let mut entries = lock_ignore_poison(&self.entries);
            match entries.get(id) {
                Some(entry) if entry.seq == seq => entries.remove(id),
                _ => None,
            }
        };

        if let Some(Entry {
            timer: Some(timer), ..
        }) = entry
        {
            timer.abort();
        }
    }
}

/// Registry of in-flight calls keyed by correlation id.
///
/// Cheap to clone; clones share the same map.
pub struct PendingCalls<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for PendingCalls<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> PendingCalls<T> {
    // ---

    /// Create an empty registry. Entries created with [`create`](Self::create)
    /// are rejected with [`RpcError::Timeout`] after `timeout`, if set.
    pub fn new(timeout: Option<Duration>) -> Self {
        // ---
        Self {
            inner: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    /// Register a pending call under `id` using the registry timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelationId`] if `id` is already pending.
    pub fn create(&self, id: CorrelationId) -> Result<PendingCall<T>> {
        self.create_with_timeout(id, self.inner.timeout)
    }

    /// Register a pending call with an explicit timeout (`None` = no timer).
    ///
    /// Must be called from within a tokio runtime when a timeout is set.
    pub fn create_with_timeout(
        &self,
        id: CorrelationId,
        timeout: Option<Duration>,
    ) -> Result<PendingCall<T>> {
        // ---
        let mut entries = lock_ignore_poison(&self.inner.entries);

        if entries.contains_key(&id) {
            return Err(RpcError::DuplicateCorrelationId(id.to_string()));
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // The timer locks the map, so it cannot observe the map before the
        // insert below: we still hold the guard.
        let timer = timeout.map(|duration| {
            let registry = Arc::downgrade(&self.inner);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Some(shared) = registry.upgrade() {
                    shared.expire(&id, seq);
                }
            })
        });

        entries.insert(id.clone(), Entry { seq, tx, timer });

        Ok(PendingCall {
            id,
            seq,
            rx,
            registry: Arc::downgrade(&self.inner),
            done: false,
        })
    }

    /// Settle `id` with a success value. A no-op (returns false) if `id` is
    /// not pending: late, duplicate and already timed-out replies land here.
    pub fn resolve(&self, id: &CorrelationId, value: T) -> bool {
        self.inner.settle(id, Ok(value))
    }

    /// Settle `id` with a failure. Same no-op rule as [`resolve`](Self::resolve).
    pub fn reject(&self, id: &CorrelationId, error: RpcError) -> bool {
        self.inner.settle(id, Err(error))
    }

    /// Reject every pending call, e.g. on shutdown. Returns how many were settled.
    pub fn reject_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> RpcError,
    {
        // ---
        let drained: Vec<Entry<T>> = {
            let mut entries = lock_ignore_poison(&self.inner.entries);
            entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    /// Number of calls currently pending.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Future of one pending call; completes when the entry is settled.
///
/// Dropping it before completion removes the entry from the registry, so an
/// abandoned call does not occupy memory until its timeout.
pub struct PendingCall<T> {
    // ---
    id: CorrelationId,
    seq: u64,
    rx: oneshot::Receiver<Result<T>>,
    registry: Weak<Shared<T>>,
    done: bool,
}

impl<T> PendingCall<T> {
    /// Correlation id this call is registered under.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl<T> Future for PendingCall<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // ---
        let this = self.get_mut();

        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(outcome) => {
                this.done = true;
                // A dropped sender means the registry itself went away.
                Poll::Ready(outcome.unwrap_or(Err(RpcError::Closed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PendingCall<T> {
    fn drop(&mut self) {
        // ---
        if self.done {
            return;
        }
        if let Some(shared) = self.registry.upgrade() {
            shared.discard(&self.id, self.seq);
        }
    }
}
