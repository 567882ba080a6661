//! Worker Registry - typed long-running tasks bound to subtrees
//!
//! A worker type is a name mapped to a constructor. Starting one binds it
//! to a URI: the subtree there becomes its private state, mutated on a
//! timer-driven cadence. At most one worker runs per URI.

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::error::{MeshError, Result};
use crate::store::{self, Store};
use crate::timer::{TimerEngine, TimerId};

pub type WorkerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;
pub type WorkerCtor = Arc<dyn Fn(WorkerContext) -> WorkerFuture + Send + Sync + 'static>;
/// Runs on the worker's subtree, under the store lock, before the task starts
pub type WorkerInit = Arc<dyn Fn(&mut Map<String, Value>, &str) + Send + Sync + 'static>;

#[derive(Clone)]
struct WorkerType {
    ctor: WorkerCtor,
    init: Option<WorkerInit>,
}

/// Name -> constructor table plus the set of occupied URIs
#[derive(Default)]
pub struct WorkerRegistry {
    constructors: RwLock<HashMap<String, WorkerType>>,
    running: Mutex<HashSet<String>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a worker type
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let ctor: WorkerCtor = Arc::new(move |ctx| Box::pin(f(ctx)) as WorkerFuture);
        self.insert(name.into(), WorkerType { ctor, init: None });
    }

    /// Register a worker type whose subtree is seeded synchronously, so
    /// the `run` reply and any later read already see the initial fields
    pub fn register_with_init<I, F, Fut>(&self, name: impl Into<String>, init: I, f: F)
    where
        I: Fn(&mut Map<String, Value>, &str) + Send + Sync + 'static,
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let ctor: WorkerCtor = Arc::new(move |ctx| Box::pin(f(ctx)) as WorkerFuture);
        let init: WorkerInit = Arc::new(init);
        self.insert(
            name.into(),
            WorkerType {
                ctor,
                init: Some(init),
            },
        );
    }

    fn insert(&self, name: String, worker: WorkerType) {
        self.constructors.write().insert(name, worker);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered type names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_running(&self, uri: &str) -> bool {
        self.running.lock().contains(&store::normalize(uri))
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    fn worker_type(&self, name: &str) -> Option<WorkerType> {
        self.constructors.read().get(name).cloned()
    }
}

/// Everything a node shares between connections, workers and timers
#[derive(Clone)]
pub struct Mesh {
    store: Arc<Store>,
    timers: TimerEngine,
    workers: Arc<WorkerRegistry>,
    worker_period: Duration,
}

impl Mesh {
    pub fn new(
        store: Arc<Store>,
        timers: TimerEngine,
        workers: Arc<WorkerRegistry>,
        worker_period: Duration,
    ) -> Self {
        Self {
            store,
            timers,
            workers,
            worker_period,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn timers(&self) -> &TimerEngine {
        &self.timers
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Spawn a worker of type `kind` bound to `uri`.
    ///
    /// Fails without spawning if the type is unknown or the URI is taken.
    pub fn start_worker(&self, kind: &str, uri: &str) -> Result<()> {
        let worker = self
            .workers
            .worker_type(kind)
            .ok_or_else(|| MeshError::UnknownWorker(kind.to_string()))?;

        let uri = store::normalize(uri);
        if !self.workers.running.lock().insert(uri.clone()) {
            return Err(MeshError::WorkerRunning(uri));
        }

        if let Some(init) = &worker.init {
            self.store.update(&uri, |map| init(map, &uri));
        }
        let ctor = worker.ctor;

        let ctx = WorkerContext {
            uri: uri.clone(),
            mesh: self.clone(),
        };
        let registry = Arc::downgrade(&self.workers);
        let kind = kind.to_string();
        info!(worker = %kind, uri = %uri, "starting worker");

        tokio::spawn(async move {
            let result = ctor(ctx).await;
            match result {
                Ok(()) => info!(worker = %kind, uri = %uri, "worker finished"),
                Err(e) => error!(worker = %kind, uri = %uri, "worker failed: {}", e),
            }
            if let Some(registry) = registry.upgrade() {
                registry.running.lock().remove(&uri);
            }
        });

        Ok(())
    }
}

/// A worker's view of the node: its URI plus shared services
#[derive(Clone)]
pub struct WorkerContext {
    uri: String,
    mesh: Mesh,
}

impl WorkerContext {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Last URI segment, the conventional worker name
    pub fn name(&self) -> String {
        store::last_segment(&self.uri)
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Snapshot of the worker's subtree (created if missing)
    pub fn resolve(&self) -> Value {
        self.mesh.store.resolve(&self.uri)
    }

    /// Mutate the worker's subtree under the store lock
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Map<String, Value>) -> R,
    {
        self.mesh.store.update(&self.uri, f)
    }

    /// Start a child worker below this one
    pub fn spawn_child(&self, kind: &str, relative: &str) -> Result<String> {
        let uri = format!("{}/{}", self.uri.trim_end_matches('/'), relative);
        self.mesh.start_worker(kind, &uri)?;
        Ok(uri)
    }

    /// Ticker at the node's default worker period
    pub fn ticker(&self) -> Result<Ticker> {
        self.ticker_every(self.mesh.worker_period)
    }

    /// Ticker backed by a repeating timer entry
    pub fn ticker_every(&self, period: Duration) -> Result<Ticker> {
        let notify = Arc::new(Notify::new());
        let weak: Weak<Notify> = Arc::downgrade(&notify);
        let timer = self.mesh.timers.every(period, move |_| {
            if let Some(notify) = weak.upgrade() {
                notify.notify_one();
            }
        })?;
        Ok(Ticker {
            notify,
            timers: self.mesh.timers.clone(),
            timer,
        })
    }
}

/// Wakes a worker once per timer firing. Missed ticks coalesce.
/// Dropping it removes the backing timer entry.
pub struct Ticker {
    notify: Arc<Notify>,
    timers: TimerEngine,
    timer: TimerId,
}

impl Ticker {
    pub async fn tick(&self) {
        self.notify.notified().await;
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.timers.cancel(self.timer);
    }
}
