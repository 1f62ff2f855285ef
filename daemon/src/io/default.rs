//! The Default I/O classes: plain directory trees on disk.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{GroupIO, GroupIoCtx, NodeIO, NodeIoCtx};
use crate::database::entity::copy::{CopyModel, CopyState};
use crate::database::entity::copy_request::CopyRequestModel;
use crate::database::entity::group::GroupModel;
use crate::database::entity::node::NodeModel;
use crate::database::DataIndex;
use crate::error::{DaemonError, DaemonResult};
use crate::fs::updown::UpDownLock;
use crate::fs::{self, NodeFs};
use crate::io::ioutil;
use crate::State;
use alpenhorn::util::pretty_bytes;

const GIB: f64 = 1073741824.0;

/// Default node I/O.
pub struct DefaultNodeIO {
    state: State,
    node: RwLock<NodeModel>,
    fs: NodeFs,
    tree_lock: UpDownLock,
    fs_events: bool,
}

impl DefaultNodeIO {
    pub fn new(ctx: NodeIoCtx) -> DaemonResult<Arc<dyn NodeIO>> {
        Self::with_events(ctx, true)
    }

    /// Constructor shared with the Polling class, which differs only in
    /// declining filesystem-event auto-import.
    pub fn with_events(ctx: NodeIoCtx, fs_events: bool) -> DaemonResult<Arc<dyn NodeIO>> {
        let root = ctx.node.root.clone().ok_or_else(|| {
            DaemonError::InvalidIoConfig(anyhow::anyhow!(
                "node \"{}\" has no root path",
                ctx.node.name
            ))
        })?;

        Ok(Arc::new(Self {
            state: ctx.state,
            fs: NodeFs::new(root),
            tree_lock: UpDownLock::new(),
            node: RwLock::new(ctx.node),
            fs_events,
        }))
    }
}

#[async_trait]
impl NodeIO for DefaultNodeIO {
    fn node(&self) -> NodeModel {
        self.node.read().unwrap().clone()
    }

    fn set_node(&self, node: NodeModel) {
        *self.node.write().unwrap() = node;
    }

    fn fifo(&self) -> String {
        self.node.read().unwrap().name.clone()
    }

    fn fs(&self) -> &NodeFs {
        &self.fs
    }

    fn tree_lock(&self) -> &UpDownLock {
        &self.tree_lock
    }

    fn auto_import_supported(&self) -> bool {
        self.fs_events
    }

    async fn check_init(&self) -> bool {
        let node = self.node();

        match self.fs.read_marker().await {
            Some(contents) if contents == node.name => true,
            Some(contents) => {
                tracing::warn!(
                    "Node file {}/{} reports name \"{}\", expected \"{}\".",
                    self.fs.root().display(),
                    fs::NODE_MARKER,
                    contents,
                    node.name
                );
                false
            }
            None => false,
        }
    }

    async fn init(&self) -> bool {
        if self.check_init().await {
            return true;
        }

        let node = self.node();
        match self.fs.write_marker(&node.name).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to write node file for \"{}\": {}", node.name, e);
                false
            }
        }
    }

    async fn bytes_avail(&self, fast: bool) -> Option<u64> {
        if fast {
            // Cached value from the last slow measurement
            return self
                .node()
                .avail_gb
                .map(|gb| (gb * GIB).max(0.0) as u64);
        }

        self.fs.bytes_avail().await
    }

    async fn exists(&self, path: &str) -> bool {
        self.fs.exists(path).await
    }

    async fn fits(&self, size_b: u64) -> bool {
        let node = self.node();

        let avail = match self.bytes_avail(true).await {
            Some(avail) => avail,
            None => match self.bytes_avail(false).await {
                Some(avail) => avail,
                None => return false,
            },
        };

        let reserved = self.state.reserved_bytes(&node.name);
        let min_avail = (node.min_avail_gb * GIB).max(0.0) as u64;
        if avail.saturating_sub(reserved) < size_b.saturating_add(min_avail) {
            return false;
        }

        if let Some(max_total_gb) = node.max_total_gb {
            let db = match self.state.database().await {
                Ok(db) => db,
                Err(_) => return false,
            };
            let total = match db.total_bytes_on_node(node.id).await {
                Ok(total) => total,
                Err(_) => return false,
            };
            if total.saturating_add(size_b) > (max_total_gb * GIB).max(0.0) as u64 {
                return false;
            }
        }

        true
    }

    fn reserve_bytes(&self, size_b: u64) -> bool {
        let node = self.node();
        let budget = node.avail_gb.map(|gb| {
            let min_avail = (node.min_avail_gb * GIB).max(0.0) as u64;
            ((gb * GIB).max(0.0) as u64).saturating_sub(min_avail)
        });

        self.state.try_reserve(&node.name, size_b, budget)
    }

    fn release_bytes(&self, size_b: u64) {
        self.state.sub_reservation(&self.fifo(), size_b);
    }

    fn pull_permits(&self) -> Arc<Semaphore> {
        self.state.pull_permits(&self.fifo())
    }

    async fn check_copy(&self, copy: CopyModel) {
        let node = self.node();

        let db = match self.state.database().await {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!("Abandoning check: {}", e);
                return;
            }
        };

        let (file, acq) = match db.file_with_acq(copy.file_id).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Abandoning check: {}", e);
                return;
            }
        };
        let path = format!("{}/{}", acq.name, file.name);

        let new_state = if self.fs.exists(&path).await {
            let size = match self.fs.file_size(&path).await {
                Ok(size) => size,
                // Can't stat; abandon the check attempt
                Err(_) => return,
            };

            if size as i64 != file.size_b {
                tracing::error!(
                    "File {} on node {} is corrupt! Size: {}; expected: {}",
                    path,
                    node.name,
                    size,
                    file.size_b
                );
                CopyState::Corrupt
            } else {
                match self.fs.md5sum(&path).await {
                    Ok(md5) if md5.to_hex() == file.md5sum => {
                        tracing::info!("File {} on node {} is A-OK!", path, node.name);
                        CopyState::Healthy
                    }
                    Ok(md5) => {
                        tracing::error!(
                            "File {} on node {} is corrupt! MD5: {}; expected: {}",
                            path,
                            node.name,
                            md5.to_hex(),
                            file.md5sum
                        );
                        CopyState::Corrupt
                    }
                    Err(_) => return,
                }
            }
        } else {
            tracing::error!("File {} on node {} is missing!", path, node.name);
            CopyState::Missing
        };

        let result = match new_state {
            CopyState::Healthy => "healthy",
            CopyState::Missing => "missing",
            _ => "corrupt",
        };
        self.state
            .metrics
            .verifications
            .with_label_values(&[result])
            .inc();

        let size_b = if new_state == CopyState::Healthy {
            self.fs.file_size(&path).await.ok().map(|s| s as i64)
        } else {
            None
        };

        tracing::info!("Updating copy #{} for file {} on node {}.", copy.id, path, node.name);
        if let Err(e) = db.set_copy_state(copy.id, new_state, size_b, true).await {
            tracing::warn!("Failed to record check result for {}: {}", path, e);
        }
    }

    async fn delete_copies(&self, copies: Vec<CopyModel>) {
        let node = self.node();

        let db = match self.state.database().await {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!("Abandoning delete: {}", e);
                return;
            }
        };

        for copy in copies {
            let (file, acq) = match db.file_with_acq(copy.file_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("Abandoning delete: {}", e);
                    continue;
                }
            };
            let path = format!("{}/{}", acq.name, file.name);

            // The invariant: at least two other archive copies must be
            // healthy before bytes are destroyed here.
            let ncopies = match db.archive_copy_count_excluding(file.id, node.id).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Abandoning delete: {}", e);
                    continue;
                }
            };
            if ncopies < 2 {
                tracing::warn!(
                    "Too few archive copies ({}) to delete {} on {}.",
                    ncopies,
                    path,
                    node.name
                );
                continue;
            }

            {
                let _guard = self.tree_lock.down().await;

                match tokio::fs::remove_file(self.fs.full_path(&path)).await {
                    Ok(()) => {
                        self.state.metrics.deleted_files.inc();
                        self.state
                            .metrics
                            .deleted_bytes
                            .inc_by(file.size_b.max(0) as u64);
                        tracing::info!("Removed file copy {} on {}", path, node.name);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Already deleted, which is not a problem
                        tracing::info!("File copy {} missing on {} during delete", path, node.name);
                    }
                    Err(e) => {
                        tracing::warn!("Error deleting {}: {}", path, e);
                        continue;
                    }
                }

                self.fs.remove_empty_parents(&path).await;
            }

            if let Err(e) = db
                .set_copy_state(copy.id, CopyState::Removed, None, false)
                .await
            {
                tracing::warn!("Failed to record deletion of {}: {}", path, e);
            }
        }
    }

    async fn tidy_up(&self) {
        let node = self.node();
        let stale_age = self.state.config.daemon.stale_temp_age;

        // Remove temporaries left by crashed transfers
        match self.fs.walk(".").await {
            Ok(files) => {
                for path in files {
                    let basename = path.rsplit('/').next().unwrap_or(&path);
                    if !fs::is_temp_candidate(basename) {
                        continue;
                    }

                    match self.fs.modified_age(&path).await {
                        Some(age) if age >= stale_age => {
                            tracing::warn!("Removing stale temporary {} on {}", path, node.name);
                            if let Err(e) = self.fs.remove_file(&path).await {
                                tracing::warn!("Error removing {}: {}", path, e);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => tracing::warn!("Tidy-up scan failed on {}: {}", node.name, e),
        }

        // Reconcile missing copies that have reappeared on disk
        let db = match self.state.database().await {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!("Abandoning tidy-up: {}", e);
                return;
            }
        };

        let missing = match db.copies_in_state(node.id, CopyState::Missing, None).await {
            Ok(missing) => missing,
            Err(e) => {
                tracing::warn!("Abandoning tidy-up: {}", e);
                return;
            }
        };

        for copy in missing {
            let Ok((file, acq)) = db.file_with_acq(copy.file_id).await else {
                continue;
            };
            let path = format!("{}/{}", acq.name, file.name);

            if self.fs.is_file(&path).await {
                tracing::info!(
                    "Missing file {} reappeared on {}. Marking suspect.",
                    path,
                    node.name
                );
                if let Err(e) = db
                    .set_copy_state(copy.id, CopyState::Suspect, None, false)
                    .await
                {
                    tracing::warn!("Failed to mark {} suspect: {}", path, e);
                }
            }
        }
    }
}

/// Default group I/O: a group with exactly one local node.
pub struct DefaultGroupIO {
    state: State,
    group: RwLock<GroupModel>,
    nodes: RwLock<Vec<Arc<dyn NodeIO>>>,
}

impl DefaultGroupIO {
    pub fn new(ctx: GroupIoCtx) -> DaemonResult<Arc<dyn GroupIO>> {
        Ok(Arc::new(Self {
            state: ctx.state,
            group: RwLock::new(ctx.group),
            nodes: RwLock::new(Vec::new()),
        }))
    }
}

#[async_trait]
impl GroupIO for DefaultGroupIO {
    fn group(&self) -> GroupModel {
        self.group.read().unwrap().clone()
    }

    fn set_group(&self, group: GroupModel) {
        *self.group.write().unwrap() = group;
    }

    fn fifo(&self) -> String {
        format!("group:{}", self.group.read().unwrap().name)
    }

    fn set_nodes(&self, nodes: Vec<Arc<dyn NodeIO>>) -> DaemonResult<usize> {
        if nodes.len() != 1 {
            return Err(DaemonError::InvalidIoConfig(anyhow::anyhow!(
                "Default group \"{}\" must have exactly one available node; has {}",
                self.group.read().unwrap().name,
                nodes.len()
            )));
        }

        *self.nodes.write().unwrap() = nodes;
        Ok(1)
    }

    fn nodes(&self) -> Vec<Arc<dyn NodeIO>> {
        self.nodes.read().unwrap().clone()
    }

    async fn pull(&self, req: CopyRequestModel, node_from: NodeModel) {
        let Some(target) = self.nodes().into_iter().next() else {
            return;
        };

        let db = match self.state.database().await {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!("Skipping pull request #{}: {}", req.id, e);
                return;
            }
        };
        let (file, acq) = match db.file_with_acq(req.file_id).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Skipping pull request #{}: {}", req.id, e);
                return;
            }
        };

        if !target.fits(file.size_b.max(0) as u64).await {
            tracing::info!(
                "Skipping pull of {}/{}: does not fit on node {} ({} needed)",
                acq.name,
                file.name,
                target.fifo(),
                pretty_bytes(file.size_b.max(0) as u64)
            );
            return;
        }

        ioutil::schedule_pull(&self.state, target, req, node_from, file, acq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use sea_orm::DatabaseConnection;

    use crate::database::entity::node::StorageType;
    use crate::extensions::Registry;
    use crate::testing::{make_file, make_group, make_node_at, test_index, test_state_with_config, TEST_HOST};

    struct NodeFixture {
        _root: tempfile::TempDir,
        state: State,
        node: NodeModel,
        io: Arc<dyn NodeIO>,
    }

    async fn node_fixture_with_config(config_yaml: &str) -> NodeFixture {
        let root = tempfile::tempdir().unwrap();
        let db = test_index().await;

        let group = make_group(&db, "g1").await;
        let node = make_node_at(
            &db,
            "n1",
            &group,
            StorageType::Field,
            root.path().to_str().unwrap(),
        )
        .await;

        let state = test_state_with_config(db, Registry::new(), config_yaml);
        let io = DefaultNodeIO::new(crate::io::NodeIoCtx {
            state: state.clone(),
            node: node.clone(),
            io_config: serde_json::Value::Null,
        })
        .unwrap();

        NodeFixture {
            _root: root,
            state,
            node,
            io,
        }
    }

    async fn node_fixture() -> NodeFixture {
        node_fixture_with_config(&format!(
            "database:\n  url: \"sqlite::memory:\"\ndaemon:\n  hostname: {}\n",
            TEST_HOST
        ))
        .await
    }

    async fn db_of(fx: &NodeFixture) -> &DatabaseConnection {
        fx.state.database().await.unwrap()
    }

    async fn put_file(fx: &NodeFixture, rel: &str, contents: &[u8]) {
        fx.io.fs().mkdir_parents(rel).await.unwrap();
        tokio::fs::write(fx.io.fs().full_path(rel), contents)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let fx = node_fixture().await;

        assert!(!fx.io.check_init().await);
        assert!(fx.io.init().await);
        assert!(fx.io.check_init().await);

        // Repeated init makes no changes
        let before = fx.io.fs().read_marker().await;
        assert!(fx.io.init().await);
        assert_eq!(fx.io.fs().read_marker().await, before);
    }

    #[tokio::test]
    async fn test_check_init_rejects_wrong_marker() {
        let fx = node_fixture().await;

        fx.io.fs().write_marker("some-other-node").await.unwrap();
        assert!(!fx.io.check_init().await);
    }

    #[tokio::test]
    async fn test_check_copy_healthy() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        put_file(&fx, "2025/02/21/meta.txt", b"hello world").await;
        let file = make_file(db, "2025/02/21", "meta.txt").await;
        let copy = db
            .upsert_copy(file.id, fx.node.id, CopyState::Suspect, None)
            .await
            .unwrap();

        fx.io.check_copy(copy.clone()).await;

        let copy = db.copy_for(file.id, fx.node.id).await.unwrap().unwrap();
        assert_eq!(copy.state, CopyState::Healthy);
        assert_eq!(copy.size_b, Some(11));
        assert!(copy.last_check.is_some());
    }

    #[tokio::test]
    async fn test_check_copy_detects_corruption() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        // Same size as the registration, different bytes
        put_file(&fx, "2025/02/21/meta.txt", b"hello wOrld").await;
        let file = make_file(db, "2025/02/21", "meta.txt").await;

        // The registration says 52 bytes; write a copy row and check
        let copy = db
            .upsert_copy(file.id, fx.node.id, CopyState::Suspect, None)
            .await
            .unwrap();
        fx.io.check_copy(copy).await;

        let copy = db.copy_for(file.id, fx.node.id).await.unwrap().unwrap();
        assert_eq!(copy.state, CopyState::Corrupt);
    }

    #[tokio::test]
    async fn test_check_copy_missing() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        let file = make_file(db, "2025/02/21", "meta.txt").await;
        let copy = db
            .upsert_copy(file.id, fx.node.id, CopyState::Suspect, None)
            .await
            .unwrap();

        fx.io.check_copy(copy).await;

        let copy = db.copy_for(file.id, fx.node.id).await.unwrap().unwrap();
        assert_eq!(copy.state, CopyState::Missing);
        assert!(!copy.has_file);
    }

    #[tokio::test]
    async fn test_delete_refused_without_archive_copies() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        put_file(&fx, "2025/02/21/meta.txt", b"hello world").await;
        let file = make_file(db, "2025/02/21", "meta.txt").await;

        // One archive copy elsewhere is not enough
        let group = make_group(db, "remote").await;
        let arch1 = make_node_at(db, "arch1", &group, StorageType::Archive, "/data/arch1").await;
        db.upsert_copy(file.id, arch1.id, CopyState::Healthy, None)
            .await
            .unwrap();

        let copy = db
            .upsert_copy(file.id, fx.node.id, CopyState::Released, Some(11))
            .await
            .unwrap();
        fx.io.delete_copies(vec![copy.clone()]).await;

        // Refused: bytes stay, state stays Released
        assert!(fx.io.fs().exists("2025/02/21/meta.txt").await);
        let copy = db.copy_for(file.id, fx.node.id).await.unwrap().unwrap();
        assert_eq!(copy.state, CopyState::Released);
    }

    #[tokio::test]
    async fn test_delete_with_enough_archive_copies() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        fx.io.fs().write_marker("n1").await.unwrap();
        put_file(&fx, "2025/02/21/meta.txt", b"hello world").await;
        let file = make_file(db, "2025/02/21", "meta.txt").await;

        let group = make_group(db, "remote").await;
        for name in ["arch1", "arch2"] {
            let arch =
                make_node_at(db, name, &group, StorageType::Archive, "/data/arch").await;
            db.upsert_copy(file.id, arch.id, CopyState::Healthy, None)
                .await
                .unwrap();
        }

        let copy = db
            .upsert_copy(file.id, fx.node.id, CopyState::Released, Some(11))
            .await
            .unwrap();
        fx.io.delete_copies(vec![copy]).await;

        // Deleted, and empty parents pruned up to the node root
        assert!(!fx.io.fs().exists("2025/02/21/meta.txt").await);
        assert!(!fx.io.fs().exists("2025").await);
        assert_eq!(fx.io.fs().read_marker().await.as_deref(), Some("n1"));

        let copy = db.copy_for(file.id, fx.node.id).await.unwrap().unwrap();
        assert_eq!(copy.state, CopyState::Removed);
        assert!(!copy.has_file);
    }

    #[tokio::test]
    async fn test_tidy_up_removes_stale_temporaries() {
        // Zero stale-temp-age: every leftover temporary is stale
        let fx = node_fixture_with_config(&format!(
            "database:\n  url: \"sqlite::memory:\"\n\
             daemon:\n  hostname: {}\n  stale-temp-age: 0s\n",
            TEST_HOST
        ))
        .await;

        put_file(&fx, "2025/02/21/.meta.txt.a1b2c3d4", b"partial").await;
        put_file(&fx, "2025/02/21/.meta.txt.lock", b"").await;
        put_file(&fx, "2025/02/21/meta.txt", b"hello world").await;

        fx.io.tidy_up().await;

        // The abandoned transfer temp goes; lock files and data stay
        assert!(!fx.io.fs().exists("2025/02/21/.meta.txt.a1b2c3d4").await);
        assert!(fx.io.fs().exists("2025/02/21/.meta.txt.lock").await);
        assert!(fx.io.fs().exists("2025/02/21/meta.txt").await);
    }

    #[tokio::test]
    async fn test_tidy_up_keeps_fresh_temporaries() {
        let fx = node_fixture().await;

        put_file(&fx, "2025/02/21/.meta.txt.a1b2c3d4", b"partial").await;
        fx.io.tidy_up().await;

        // Default stale age is an hour; a fresh temp is an active pull
        assert!(fx.io.fs().exists("2025/02/21/.meta.txt.a1b2c3d4").await);
    }

    #[tokio::test]
    async fn test_tidy_up_reconciles_reappeared_missing() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        put_file(&fx, "2025/02/21/meta.txt", b"hello world").await;
        let file = make_file(db, "2025/02/21", "meta.txt").await;
        let copy = db
            .upsert_copy(file.id, fx.node.id, CopyState::Missing, None)
            .await
            .unwrap();

        fx.io.tidy_up().await;

        let copy = db.copy_for(file.id, copy.node_id).await.unwrap().unwrap();
        assert_eq!(copy.state, CopyState::Suspect);
    }

    #[tokio::test]
    async fn test_reservations_respect_budget() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        // Pretend the node has 1 GiB free
        db.update_avail_bytes(fx.node.id, Some(1 << 30)).await.unwrap();
        fx.io.set_node(db.node_by_id(fx.node.id).await.unwrap());

        assert!(fx.io.reserve_bytes(800 << 20));
        // A second large reservation exceeds the budget
        assert!(!fx.io.reserve_bytes(800 << 20));

        fx.io.release_bytes(800 << 20);
        assert!(fx.io.reserve_bytes(800 << 20));
    }

    #[tokio::test]
    async fn test_fits_uses_cached_avail() {
        let fx = node_fixture().await;
        let db = db_of(&fx).await;

        db.update_avail_bytes(fx.node.id, Some(100 << 20)).await.unwrap();
        fx.io.set_node(db.node_by_id(fx.node.id).await.unwrap());

        assert!(fx.io.fits(10 << 20).await);
        assert!(!fx.io.fits(200 << 20).await);
    }
}
