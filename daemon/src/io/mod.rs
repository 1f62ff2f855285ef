//! The I/O class framework.
//!
//! An I/O class is a capability set: per-node behavior ([`NodeIO`]) and
//! per-group behavior ([`GroupIO`]). One instance exists per available
//! node/group, constructed from the extension registry by class name and
//! holding whatever session state the class needs.
//!
//! The built-in classes are `Default` (plain filesystem), `Transport`
//! (sneakernet media, local-only fill-first pulls) and `Polling`
//! (`Default` without filesystem-event auto-import). Site-specific
//! classes register through extensions.

pub mod default;
pub mod ioutil;
pub mod polling;
pub mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::database::entity::copy::CopyModel;
use crate::database::entity::copy_request::CopyRequestModel;
use crate::database::entity::group::GroupModel;
use crate::database::entity::node::NodeModel;
use crate::fs::updown::UpDownLock;
use crate::fs::NodeFs;
use crate::State;

/// Context handed to a node I/O instance at construction.
#[derive(Clone)]
pub struct NodeIoCtx {
    pub state: State,
    pub node: NodeModel,
    pub io_config: serde_json::Value,
}

/// Context handed to a group I/O instance at construction.
#[derive(Clone)]
pub struct GroupIoCtx {
    pub state: State,
    pub group: GroupModel,
    pub io_config: serde_json::Value,
}

/// Per-node I/O behavior.
///
/// The async methods here are the bodies of queue tasks; scheduling them
/// (wrapping in [`crate::queue::Task`]s with the right key and flags) is
/// the update loop's job.
#[async_trait]
pub trait NodeIO: Send + Sync {
    /// The current storage row.
    fn node(&self) -> NodeModel;

    /// Replaces the storage row after a re-query of the Index.
    fn set_node(&self, node: NodeModel);

    /// The task-queue key for this node.
    fn fifo(&self) -> String;

    /// Filesystem access to the node root.
    fn fs(&self) -> &NodeFs;

    /// The node's directory tree lock.
    fn tree_lock(&self) -> &UpDownLock;

    /// Whether filesystem-event auto-import works on this class.
    fn auto_import_supported(&self) -> bool {
        true
    }

    /// Is the node initialized (marker present and correct)?
    async fn check_init(&self) -> bool;

    /// Initializes the node. Idempotent.
    async fn init(&self) -> bool;

    /// Free space in bytes. `fast` may return a cached value, or `None`
    /// when only a slow measurement exists.
    async fn bytes_avail(&self, fast: bool) -> Option<u64>;

    /// Does anything exist at this node-relative path?
    async fn exists(&self, path: &str) -> bool;

    /// Is the path's data ready for I/O?
    ///
    /// Always true for disk-backed classes; staged-storage classes use
    /// this to kick off and poll recalls.
    async fn ready_path(&self, _path: &str) -> bool {
        true
    }

    /// Would a file of this size fit, honoring reservations and the
    /// node's min-available / max-total limits?
    async fn fits(&self, size_b: u64) -> bool;

    /// Reserves room for an incoming file. Paired with
    /// [`NodeIO::release_bytes`].
    fn reserve_bytes(&self, size_b: u64) -> bool;

    fn release_bytes(&self, size_b: u64);

    /// Concurrency gate for pulls onto this node.
    fn pull_permits(&self) -> Arc<Semaphore>;

    /// Verifies one copy, updating its state to healthy, corrupt or
    /// missing.
    async fn check_copy(&self, copy: CopyModel);

    /// Deletes released copies, enforcing the archive-copy guard.
    async fn delete_copies(&self, copies: Vec<CopyModel>);

    /// Cleans up after crashes: stale transfer temporaries, and missing
    /// copies that turn out to be present.
    async fn tidy_up(&self);
}

/// Per-group I/O behavior.
#[async_trait]
pub trait GroupIO: Send + Sync {
    /// The current storage row.
    fn group(&self) -> GroupModel;

    /// Replaces the storage row after a re-query of the Index.
    fn set_group(&self, group: GroupModel);

    /// The task-queue key for this group.
    fn fifo(&self) -> String;

    /// Accepts this tick's locally available member nodes.
    ///
    /// Returns the number of usable nodes, or an error if the group
    /// can't operate with what it was given.
    fn set_nodes(&self, nodes: Vec<Arc<dyn NodeIO>>) -> crate::error::DaemonResult<usize>;

    /// The usable member nodes, in the group's preference order.
    fn nodes(&self) -> Vec<Arc<dyn NodeIO>>;

    /// Selects a destination node and schedules the pull.
    ///
    /// `node_from` is the already-fetched source node row.
    async fn pull(&self, req: CopyRequestModel, node_from: NodeModel);
}
