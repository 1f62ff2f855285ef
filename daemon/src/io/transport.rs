//! Transport Group I/O.
//!
//! A Transport group collects transiting media being filled for
//! sneakernet transfer. All member nodes must be transport storage, all
//! pulls must be local, and media are filled one at a time: a pull goes
//! to the fullest node with room for the file, so earlier disks fill
//! completely before later ones are touched.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{GroupIO, GroupIoCtx, NodeIO};
use crate::database::entity::copy::CopyState;
use crate::database::entity::copy_request::CopyRequestModel;
use crate::database::entity::group::GroupModel;
use crate::database::entity::node::{NodeModel, StorageType};
use crate::database::DataIndex;
use crate::error::{DaemonError, DaemonResult};
use crate::io::ioutil;
use crate::State;

pub struct TransportGroupIO {
    state: State,
    group: RwLock<GroupModel>,
    nodes: RwLock<Vec<Arc<dyn NodeIO>>>,
}

impl TransportGroupIO {
    pub fn new(ctx: GroupIoCtx) -> DaemonResult<Arc<dyn GroupIO>> {
        Ok(Arc::new(Self {
            state: ctx.state,
            group: RwLock::new(ctx.group),
            nodes: RwLock::new(Vec::new()),
        }))
    }
}

/// Orders candidate nodes fullest-first, ties broken by name.
///
/// Nodes with unmeasured free space sort last.
pub fn fill_order_key(node: &NodeModel) -> (u8, u64, String) {
    match node.avail_gb {
        Some(avail) => (0, (avail * 1048576.0).max(0.0) as u64, node.name.clone()),
        None => (1, 0, node.name.clone()),
    }
}

#[async_trait]
impl GroupIO for TransportGroupIO {
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
        let group_name = self.group.read().unwrap().name.clone();

        let mut usable = Vec::new();
        for node in nodes {
            let db_node = node.node();
            if db_node.storage_type != StorageType::Transport {
                tracing::warn!(
                    "Ignoring non-transport node \"{}\" in Transport group \"{}\"",
                    db_node.name,
                    group_name
                );
            } else {
                usable.push(node);
            }
        }

        if usable.is_empty() {
            return Err(DaemonError::InvalidIoConfig(anyhow::anyhow!(
                "no usable nodes in Transport group {}",
                group_name
            )));
        }

        let count = usable.len();
        *self.nodes.write().unwrap() = usable;
        Ok(count)
    }

    fn nodes(&self) -> Vec<Arc<dyn NodeIO>> {
        let mut nodes = self.nodes.read().unwrap().clone();
        nodes.sort_by_key(|n| fill_order_key(&n.node()));
        nodes
    }

    async fn pull(&self, req: CopyRequestModel, node_from: NodeModel) {
        let group = self.group();

        // Transport media only accept local data
        if !node_from.local_to(&self.state.hostname) {
            tracing::info!(
                "Skipping pull request #{} from node {} to group {}: non-local transfer request.",
                req.id,
                node_from.name,
                group.name
            );
            return;
        }

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
        let path = format!("{}/{}", acq.name, file.name);

        // Group-level pre-pull search: a transport group has many
        // members, and the Index may not know about bytes already on one
        // of them
        for node in self.nodes() {
            if node.exists(&path).await {
                let db_node = node.node();
                if !db
                    .copy_state(file.id, db_node.id)
                    .await
                    .map(|s| s.on_disk())
                    .unwrap_or(true)
                {
                    tracing::warn!(
                        "Skipping pull request for {}: file already on disk in group {}.",
                        path,
                        group.name
                    );
                    let _ = db
                        .upsert_copy(file.id, db_node.id, CopyState::Suspect, None)
                        .await;
                    return;
                }
            }
        }

        // Fill a medium before starting the next
        let mut target = None;
        for node in self.nodes() {
            if node.fits(file.size_b.max(0) as u64).await {
                target = Some(node);
                break;
            }
            tracing::debug!("Ignoring transport node {}: not enough space", node.fifo());
        }

        match target {
            Some(node) => ioutil::schedule_pull(&self.state, node, req, node_from, file, acq),
            None => tracing::debug!("Unable to find a transport node for \"{}\"", path),
        }
    }
}
