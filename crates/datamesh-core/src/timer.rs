//! Timer Engine - min-heap of scheduled callbacks
//!
//! Features:
//! - One dispatcher task owns the heap and sleeps until the earliest entry
//! - Every firing runs on its own blocking task, so a slow callback never
//!   delays the dispatcher or other timers
//! - Semaphore caps how many callbacks run at once
//! - Repeating entries are pushed back at `fire_at + interval`
//!
//! Times are monotonic offsets from engine start.

use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{MeshError, Result};

/// Identifier handed out on registration. Repeats keep their id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// What a callback sees when it fires
#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub id: TimerId,
    pub fire_at: Duration,
    pub interval: Option<Duration>,
    pub extra: Value,
}

pub type TimerCallback = Arc<dyn Fn(&TimerEvent) + Send + Sync + 'static>;

struct Entry {
    fire_at: Duration,
    seq: u64,
    id: TimerId,
    interval: Option<Duration>,
    extra: Value,
    callback: TimerCallback,
}

impl Entry {
    fn key(&self) -> (Duration, u64) {
        (self.fire_at, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so BinaryHeap pops the earliest (fire_at, seq) first
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<Entry>>,
    wake: Notify,
    seq: AtomicU64,
    next_id: AtomicU64,
    started: Instant,
    permits: Arc<Semaphore>,
}

impl Inner {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    fn push(&self, mut entry: Entry) {
        entry.seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.heap.lock().push(entry);
        self.wake.notify_one();
    }
}

/// Handle to a running timer engine. Cheap to clone.
#[derive(Clone)]
pub struct TimerEngine {
    inner: Arc<Inner>,
}

impl TimerEngine {
    /// Start the dispatcher on the current tokio runtime
    pub fn start(concurrency: usize) -> Self {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            seq: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            started: Instant::now(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        });

        tokio::spawn(dispatch_loop(Arc::clone(&inner)));

        Self { inner }
    }

    /// Monotonic time since the engine started
    pub fn now(&self) -> Duration {
        self.inner.now()
    }

    /// Register a callback at `fire_at`, optionally repeating every `interval`.
    ///
    /// A repeating entry whose `fire_at` already passed is moved forward in
    /// whole intervals so it fires on the original phase.
    pub fn schedule<F>(
        &self,
        fire_at: Duration,
        interval: Option<Duration>,
        extra: Value,
        callback: F,
    ) -> Result<TimerId>
    where
        F: Fn(&TimerEvent) + Send + Sync + 'static,
    {
        let mut fire_at = fire_at;
        if let Some(step) = interval {
            if step.is_zero() {
                return Err(MeshError::InvalidInterval);
            }
            let now = self.now();
            if fire_at < now {
                fire_at += catch_up(now - fire_at, step);
            }
        }

        let id = TimerId(self.inner.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        self.inner.push(Entry {
            fire_at,
            seq: 0,
            id,
            interval,
            extra,
            callback: Arc::new(callback),
        });
        debug!(timer = id.0, ?fire_at, ?interval, "timer scheduled");
        Ok(id)
    }

    /// One-shot after `delay`
    pub fn after<F>(&self, delay: Duration, callback: F) -> Result<TimerId>
    where
        F: Fn(&TimerEvent) + Send + Sync + 'static,
    {
        self.schedule(self.now() + delay, None, Value::Null, callback)
    }

    /// Repeating every `interval`, first firing one interval from now
    pub fn every<F>(&self, interval: Duration, callback: F) -> Result<TimerId>
    where
        F: Fn(&TimerEvent) + Send + Sync + 'static,
    {
        self.schedule(self.now() + interval, Some(interval), Value::Null, callback)
    }

    /// Entries waiting in the heap
    pub fn pending(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// Remove an entry so it never fires again. A callback already
    /// launched still runs to completion.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut heap = self.inner.heap.lock();
        let before = heap.len();
        heap.retain(|entry| entry.id != id);
        let removed = heap.len() != before;
        if removed {
            debug!(timer = id.0, "timer cancelled");
        }
        removed
    }
}

/// Smallest whole number of `step`s covering `behind`, saturating
fn catch_up(behind: Duration, step: Duration) -> Duration {
    let steps = behind.as_nanos().div_ceil(step.as_nanos());
    let nanos = steps.saturating_mul(step.as_nanos()).min(u64::MAX as u128);
    Duration::from_nanos(nanos as u64)
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        let next_at = {
            let mut heap = inner.heap.lock();
            let now = inner.now();
            while heap.peek().is_some_and(|e| e.fire_at <= now) {
                if let Some(entry) = heap.pop() {
                    if let Some(step) = entry.interval {
                        heap.push(Entry {
                            fire_at: entry.fire_at + step,
                            seq: inner.seq.fetch_add(1, AtomicOrdering::SeqCst),
                            id: entry.id,
                            interval: entry.interval,
                            extra: entry.extra.clone(),
                            callback: Arc::clone(&entry.callback),
                        });
                    }
                    fire(&inner, entry);
                }
            }
            heap.peek().map(|e| e.fire_at)
        };

        match next_at {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(inner.started + at) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            None => inner.wake.notified().await,
        }
    }
}

/// Launch one firing on its own task
fn fire(inner: &Inner, entry: Entry) {
    let permits = Arc::clone(&inner.permits);
    let event = TimerEvent {
        id: entry.id,
        fire_at: entry.fire_at,
        interval: entry.interval,
        extra: entry.extra,
    };
    let callback = entry.callback;

    tokio::spawn(async move {
        let Ok(_permit) = permits.acquire_owned().await else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || callback(&event)).await;
        if let Err(e) = result {
            tracing::error!("Timer callback panicked: {}", e);
        }
    });
}
