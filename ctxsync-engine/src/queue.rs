//! Coalescing update queue with a per-key in-flight set.
//!
//! Producers on any thread call [`UpdateQueue::enqueue`], which only takes the
//! internal lock and never waits. The consumer pulls with
//! [`UpdateQueue::dequeue`]:
//!
//! - at most one pending update per key; a newer enqueue replaces the content
//!   but keeps the original position (FIFO by *first* enqueue time)
//! - a key is not yielded while its previous update is still in flight; the
//!   returned [`InFlightGuard`] releases the key when dropped
//! - two dequeues of the same key are at least `debounce` apart

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use ctxsync_core::ComponentKey;

/// A requested section update waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub key: ComponentKey,
    pub content: String,
    /// Time of the first enqueue for this key since it was last dequeued.
    pub enqueued_at: Instant,
    /// How many newer enqueues replaced the content before it was dequeued.
    pub superseded: u32,
}

/// Result of [`UpdateQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The key had nothing pending; it joined the back of the queue.
    Queued,
    /// Replaced the content of an update that was already pending.
    Coalesced,
}

/// The queue no longer accepts updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Point-in-time view of pending and in-flight keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: Vec<ComponentKey>,
    pub in_flight: Vec<ComponentKey>,
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<ComponentKey>,
    pending: HashMap<ComponentKey, PendingUpdate>,
    in_flight: HashSet<ComponentKey>,
    last_dequeued: HashMap<ComponentKey, Instant>,
    closed: bool,
}

enum Next {
    Ready(ComponentKey),
    WaitUntil(Instant),
    WaitForEvent,
}

impl QueueState {
    fn next(&self, now: Instant, debounce: Duration) -> Next {
        let mut earliest: Option<Instant> = None;
        for key in &self.order {
            if self.in_flight.contains(key) {
                continue;
            }
            match self.last_dequeued.get(key) {
                Some(last) if now.duration_since(*last) < debounce => {
                    let ready_at = *last + debounce;
                    earliest = Some(earliest.map_or(ready_at, |e| e.min(ready_at)));
                }
                _ => return Next::Ready(*key),
            }
        }
        match earliest {
            Some(at) => Next::WaitUntil(at),
            None => Next::WaitForEvent,
        }
    }

    fn take(&mut self, key: ComponentKey, now: Instant) -> Option<PendingUpdate> {
        let update = self.pending.remove(&key)?;
        self.order.retain(|queued| *queued != key);
        self.in_flight.insert(key);
        self.last_dequeued.insert(key, now);
        Some(update)
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    ready: Notify,
    idle: Notify,
    debounce: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap to clone; every clone shares one queue.
#[derive(Clone)]
pub struct UpdateQueue {
    shared: Arc<Shared>,
}

impl UpdateQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                ready: Notify::new(),
                idle: Notify::new(),
                debounce,
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.shared.debounce
    }

    /// Accept an update without waiting. Coalesces with a pending update for
    /// the same key.
    pub fn enqueue(
        &self,
        key: ComponentKey,
        content: impl Into<String>,
    ) -> Result<Enqueued, QueueClosed> {
        let content = content.into();
        let outcome = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            match state.pending.get_mut(&key) {
                Some(existing) => {
                    existing.content = content;
                    existing.superseded += 1;
                    Enqueued::Coalesced
                }
                None => {
                    state.pending.insert(
                        key,
                        PendingUpdate {
                            key,
                            content,
                            enqueued_at: Instant::now(),
                            superseded: 0,
                        },
                    );
                    state.order.push_back(key);
                    Enqueued::Queued
                }
            }
        };
        self.shared.ready.notify_one();
        Ok(outcome)
    }

    /// Wait for the next update that is neither in flight nor inside its
    /// debounce window. Returns `None` once the queue is closed.
    ///
    /// Cancel-safe: state only changes in the poll that returns the update.
    pub async fn dequeue(&self) -> Option<Dequeued> {
        loop {
            let next = {
                let mut state = self.shared.lock();
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                match state.next(now, self.shared.debounce) {
                    Next::Ready(key) => {
                        if let Some(update) = state.take(key, now) {
                            return Some(Dequeued {
                                update,
                                guard: InFlightGuard {
                                    shared: self.shared.clone(),
                                    key,
                                },
                            });
                        }
                        continue;
                    }
                    other => other,
                }
            };

            match next {
                Next::WaitUntil(at) => {
                    tokio::select! {
                        _ = self.shared.ready.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                _ => self.shared.ready.notified().await,
            }
        }
    }

    /// Stop accepting updates and wake the consumer. Pending updates are
    /// discarded; returns how many.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.order.clear();
            let discarded = state.pending.len();
            state.pending.clear();
            discarded
        };
        self.shared.ready.notify_waiters();
        self.shared.ready.notify_one();
        self.notify_if_idle();
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.shared.lock();
        let mut pending: Vec<_> = state.order.iter().copied().collect();
        pending.sort();
        let mut in_flight: Vec<_> = state.in_flight.iter().copied().collect();
        in_flight.sort();
        QueueSnapshot { pending, in_flight }
    }

    /// Resolve once the queue is idle.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.shared.idle.notify_waiters();
        }
    }
}

/// An update handed to the consumer together with its key's in-flight slot.
#[derive(Debug)]
pub struct Dequeued {
    pub update: PendingUpdate,
    guard: InFlightGuard,
}

impl Dequeued {
    pub fn into_parts(self) -> (PendingUpdate, InFlightGuard) {
        (self.update, self.guard)
    }
}

/// Holds a key's in-flight slot. Dropping it on any exit path (including
/// unwinding) releases the key.
#[derive(Debug)]
pub struct InFlightGuard {
    shared: Arc<Shared>,
    key: ComponentKey,
}

impl InFlightGuard {
    pub fn key(&self) -> ComponentKey {
        self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.shared.lock();
            state.in_flight.remove(&self.key);
            state.is_idle()
        };
        self.shared.ready.notify_one();
        if idle {
            self.shared.idle.notify_waiters();
        }
    }
}
