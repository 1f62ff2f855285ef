#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod auto_import;
pub mod config;
pub mod database;
pub mod error;
pub mod extensions;
pub mod fs;
pub mod io;
pub mod metrics;
pub mod pool;
pub mod queue;
#[cfg(test)]
pub(crate) mod testing;
pub mod update;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sea_orm::{Database, DatabaseConnection};
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;

use config::Config;
use database::DataIndex;
use error::{DaemonError, DaemonResult};
use extensions::Registry;
use metrics::Metrics;
use queue::FairQueue;

pub type State = Arc<StateInner>;

/// Global daemon state.
///
/// There is no shared state across daemons: everything cross-site goes
/// through the Data Index. This context is handed explicitly to every
/// component of this daemon.
pub struct StateInner {
    /// The daemon configuration.
    pub config: Config,

    /// Handle to the Data Index.
    database: OnceCell<DatabaseConnection>,

    /// The task queue.
    pub queue: Arc<FairQueue>,

    /// Import detectors and I/O classes.
    pub registry: Registry,

    /// Metric counters.
    pub metrics: Metrics,

    /// This daemon's hostname, used to claim nodes.
    pub hostname: String,

    /// Bytes reserved on each node by in-flight pulls.
    ///
    /// Keyed by node name so reservations survive I/O instance
    /// re-initialization.
    reservations: Mutex<HashMap<String, u64>>,

    /// Per-node concurrency gates for pulls.
    pull_permits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl StateInner {
    pub fn new(config: Config, registry: Registry, shutdown: CancellationToken) -> State {
        let hostname = config.hostname();

        Arc::new(Self {
            config,
            database: OnceCell::new(),
            queue: Arc::new(FairQueue::new(shutdown)),
            registry,
            metrics: Metrics::new(),
            hostname,
            reservations: Mutex::new(HashMap::new()),
            pull_permits: Mutex::new(HashMap::new()),
        })
    }

    /// Injects an already-open Data Index handle, for tests.
    #[cfg(test)]
    pub(crate) fn provide_database(&self, db: DatabaseConnection) {
        self.database.set(db).expect("database already initialized");
    }

    /// Returns a handle to the Data Index.
    pub async fn database(&self) -> DaemonResult<&DatabaseConnection> {
        self.database
            .get_or_try_init(|| async {
                Database::connect(&self.config.database.url)
                    .await
                    .map_err(DaemonError::database_error)
            })
            .await
    }

    /// Bytes currently reserved by in-flight pulls onto a node.
    pub fn reserved_bytes(&self, node_name: &str) -> u64 {
        *self
            .reservations
            .lock()
            .unwrap()
            .get(node_name)
            .unwrap_or(&0)
    }

    pub fn add_reservation(&self, node_name: &str, size_b: u64) {
        *self
            .reservations
            .lock()
            .unwrap()
            .entry(node_name.to_owned())
            .or_insert(0) += size_b;
    }

    /// Atomically reserves room on a node for an incoming file.
    ///
    /// `budget` is the node's spendable space (free space beyond its
    /// minimum), when known; reservations past the budget are refused.
    pub fn try_reserve(&self, node_name: &str, size_b: u64, budget: Option<u64>) -> bool {
        let mut reservations = self.reservations.lock().unwrap();
        let reserved = reservations.entry(node_name.to_owned()).or_insert(0);

        if let Some(budget) = budget {
            if reserved.saturating_add(size_b) > budget {
                return false;
            }
        }

        *reserved += size_b;
        true
    }

    pub fn sub_reservation(&self, node_name: &str, size_b: u64) {
        let mut reservations = self.reservations.lock().unwrap();
        if let Some(reserved) = reservations.get_mut(node_name) {
            *reserved = reserved.saturating_sub(size_b);
        }
    }

    /// The pull-concurrency gate for a node.
    pub fn pull_permits(&self, node_name: &str) -> Arc<Semaphore> {
        self.pull_permits
            .lock()
            .unwrap()
            .entry(node_name.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.io.concurrent_pulls)))
            .clone()
    }
}

/// Checks the Data Index schema version against what this daemon speaks.
pub async fn check_schema(db: &DatabaseConnection) -> DaemonResult<()> {
    let found = db.schema_version().await?;

    if found != database::entity::SCHEMA_VERSION {
        return Err(DaemonError::SchemaVersionMismatch {
            found,
            required: database::entity::SCHEMA_VERSION,
        });
    }

    Ok(())
}
