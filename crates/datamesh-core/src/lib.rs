//! Datamesh Core - URI-addressed JSON store with attached workers
//!
//! Features:
//! - Hierarchical in-memory store, read-through creation, deep merge
//! - Timer engine: min-heap dispatcher, every firing on its own task
//! - Worker registry: named constructors bound to store subtrees
//! - JSON request envelope, frame detection and reply encoding
//! - Built-in energy-storage workers (bms_unit, bms_master, ess_master)

pub mod config;
pub mod error;
pub mod ess;
pub mod protocol;
pub mod store;
pub mod timer;
pub mod worker;

pub use config::{
    get_config_path, load_config, save_config, NodeConfig, DEFAULT_BROADCAST_PORT,
    DEFAULT_CONTROLLER_PORT,
};
pub use error::{MeshError, Result};
pub use protocol::{AppStatus, Frame, Method, Reply, Request};
pub use store::Store;
pub use timer::{TimerEngine, TimerEvent, TimerId};
pub use worker::{Mesh, Ticker, WorkerContext, WorkerRegistry};

use std::sync::Arc;

/// Build a node's shared state from config, with the built-in workers
/// registered. Must be called inside a tokio runtime.
pub fn build_mesh(config: &NodeConfig) -> Mesh {
    let registry = Arc::new(WorkerRegistry::new());
    ess::register(&registry);
    Mesh::new(
        Arc::new(Store::new()),
        TimerEngine::start(config.timer_concurrency),
        registry,
        config.worker_period(),
    )
}
