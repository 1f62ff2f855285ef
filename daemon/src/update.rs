//! The main update loop.
//!
//! Once per update interval the daemon re-reads the set of nodes it is
//! responsible for, reconciles each one with the Index, and turns
//! pending work into queue tasks. The loop itself never blocks on node
//! I/O; everything long-running goes through the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::Instant;
use tracing::instrument;

use crate::auto_import::{self, import_request_done, WatcherSet};
use crate::database::entity::copy::{CopyModel, CopyState};
use crate::database::entity::copy_request::CopyRequestModel;
use crate::database::entity::node::NodeModel;
use crate::database::DataIndex;
use crate::error::{DaemonError, DaemonResult};
use crate::fs;
use crate::io::{GroupIO, GroupIoCtx, NodeIO, NodeIoCtx};
use crate::queue::{Outcome, Task};
use crate::State;
use alpenhorn::util::{pretty_bytes, pretty_deltat};

/// Ticks between periodic tidy-up sweeps on an idle node.
const TIDY_PERIOD_TICKS: u32 = 360;

/// Ticks between catch-up scans on auto-import nodes whose I/O class
/// has no filesystem-event notification (the Polling class).
const POLL_PERIOD_TICKS: u32 = 6;

/// Copies deleted per deletion task.
const DELETE_BATCH: usize = 10;

fn parse_io_config(raw: &Option<String>) -> DaemonResult<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| DaemonError::InvalidIoConfig(anyhow::anyhow!("{}", e)))?;
            if !value.is_object() {
                return Err(DaemonError::InvalidIoConfig(anyhow::anyhow!(
                    "invalid io_config: \"{}\"",
                    raw
                )));
            }
            Ok(value)
        }
    }
}

/// A storage node paired with its I/O instance and update logic.
pub struct UpdateableNode {
    pub io: Arc<dyn NodeIO>,
    node_id: i64,
    io_class: Option<String>,
    io_config: Option<String>,
    root: Option<String>,
    ticks_since_tidy: u32,
    ticks_since_poll: u32,
}

impl UpdateableNode {
    fn new(state: &State, node: NodeModel) -> DaemonResult<Self> {
        let io_config = parse_io_config(&node.io_config)?;
        let factory = state.registry.node_io(node.io_class.as_deref())?;

        let io = factory(NodeIoCtx {
            state: state.clone(),
            node: node.clone(),
            io_config,
        })?;

        Ok(Self {
            io,
            node_id: node.id,
            io_class: node.io_class,
            io_config: node.io_config,
            root: node.root,
            ticks_since_tidy: TIDY_PERIOD_TICKS,
            ticks_since_poll: POLL_PERIOD_TICKS,
        })
    }

    /// Does the newly-fetched row demand a fresh I/O instance?
    fn needs_reinit(&self, new: &NodeModel) -> bool {
        self.node_id != new.id
            || self.io_class != new.io_class
            || self.io_config != new.io_config
            || self.root != new.root
    }

    pub fn name(&self) -> String {
        self.io.fifo()
    }

    fn idle(&self, state: &State) -> bool {
        state.queue.fifo_idle(&self.name())
    }
}

/// A storage group paired with its I/O instance.
pub struct UpdateableGroup {
    pub io: Arc<dyn GroupIO>,
    group_id: i64,
    io_class: Option<String>,
    io_config: Option<String>,
    /// Whether set_nodes accepted this tick's nodes.
    usable: bool,
    /// Whether the group was idle when the tick began.
    init_idle: bool,
}

impl UpdateableGroup {
    fn new(state: &State, group: crate::database::entity::group::GroupModel) -> DaemonResult<Self> {
        let io_config = parse_io_config(&group.io_config)?;
        let factory = state.registry.group_io(group.io_class.as_deref())?;

        let io = factory(GroupIoCtx {
            state: state.clone(),
            group: group.clone(),
            io_config,
        })?;

        Ok(Self {
            io,
            group_id: group.id,
            io_class: group.io_class,
            io_config: group.io_config,
            usable: false,
            init_idle: false,
        })
    }

    fn needs_reinit(&self, new: &crate::database::entity::group::GroupModel) -> bool {
        self.group_id != new.id
            || self.io_class != new.io_class
            || self.io_config != new.io_config
    }
}

/// Schedules the init task for an uninitialized node with a pending
/// init request.
///
/// Returns true if the node is available (already initialized).
async fn check_node_init(state: &State, node_io: &Arc<dyn NodeIO>, idle: bool) -> bool {
    let node = node_io.node();

    if !node.active {
        tracing::warn!("Ignoring node \"{}\": deactivated during update.", node.name);
        return false;
    }

    if node_io.check_init().await {
        return true;
    }

    let db = match state.database().await {
        Ok(db) => db,
        Err(_) => return false,
    };

    match db.pending_init_request(node.id).await {
        Ok(Some(req)) => {
            if idle {
                tracing::info!("Requesting init of node \"{}\".", node.name);

                let io = node_io.clone();
                let task_state = state.clone();
                state.queue.put(Task::new(
                    format!("Init Node \"{}\"", node.name),
                    node_io.fifo(),
                    move |_ctx| {
                        let io = io.clone();
                        let state = task_state.clone();
                        let req = req.clone();
                        async move {
                            let node = io.node();

                            // Recheck: another task may have beaten us
                            if io.check_init().await {
                                tracing::info!("Node \"{}\" already initialised.", node.name);
                                import_request_done(&state, Some(&req), "duplicate").await;
                                return Outcome::Done;
                            }

                            if io.init().await && io.check_init().await {
                                tracing::info!("Node \"{}\" initialised.", node.name);
                                import_request_done(&state, Some(&req), "success").await;
                                return Outcome::Done;
                            }

                            // Leave the request pending for another try
                            tracing::warn!("Initialisation failed for node \"{}\".", node.name);
                            Outcome::Done
                        }
                    },
                ));
            }
        }
        Ok(None) => {
            tracing::warn!("Ignoring node \"{}\": not initialised.", node.name);
        }
        Err(e) => {
            tracing::warn!("Ignoring node \"{}\": {}", node.name, e);
        }
    }

    false
}

/// One update pass over a node.
#[instrument(skip_all, fields(node = %unode.name()))]
async fn update_node(state: &State, unode: &UpdateableNode) -> DaemonResult<()> {
    let node = unode.io.node();
    let db = state.database().await?;

    // If this node's FIFO isn't empty we skip the pass: we couldn't
    // tell whether we'd be queueing duplicate work.
    let idle = unode.idle(state);

    // Free space is refreshed even when skipping
    let avail = unode.io.bytes_avail(false).await;
    db.update_avail_bytes(node.id, avail).await?;
    if let Some(avail) = avail {
        tracing::info!("Node {}: {} available.", node.name, pretty_bytes(avail));
    }

    if !idle {
        tracing::info!("Skipping update for node {}: busy", node.name);
        return Ok(());
    }

    tracing::info!("Updating node \"{}\".", node.name);

    // Verify suspect copies, a bounded batch per tick
    let suspects = db
        .copies_in_state(
            node.id,
            CopyState::Suspect,
            Some(state.config.daemon.verify_per_tick as u64),
        )
        .await?;
    for copy in suspects {
        tracing::info!("Checking copy #{} on node {}.", copy.id, node.name);
        let io = unode.io.clone();
        state.queue.put(Task::new(
            format!("Check copy #{} on {}", copy.id, node.name),
            unode.name(),
            move |_ctx| {
                let io = io.clone();
                let copy = copy.clone();
                async move {
                    io.check_copy(copy).await;
                    Outcome::Done
                }
            },
        ));
    }

    // Delete released copies, unless they're feeding a pending transfer
    let released = db.copies_in_state(node.id, CopyState::Released, None).await?;
    let mut batch: Vec<CopyModel> = Vec::new();
    for copy in released {
        if db.has_pending_outbound(copy.file_id, node.id).await? {
            tracing::info!(
                "Skipping delete of copy #{} on node {}: transfer pending",
                copy.id,
                node.name
            );
            continue;
        }
        batch.push(copy);
    }
    for chunk in batch.chunks(DELETE_BATCH) {
        let io = unode.io.clone();
        let copies = chunk.to_vec();
        state.queue.put(Task::new(
            format!("Delete copies on {}", node.name),
            unode.name(),
            move |_ctx| {
                let io = io.clone();
                let copies = copies.clone();
                async move {
                    io.delete_copies(copies).await;
                    Outcome::Done
                }
            },
        ));
    }

    // Import requests
    for req in db.pending_import_requests(node.id).await? {
        if req.path == fs::NODE_MARKER {
            // This pass only runs on initialized nodes
            tracing::info!(
                "Ignoring node init request for \"{}\": already initialised.",
                node.name
            );
            import_request_done(state, Some(&req), "duplicate").await;
            continue;
        }

        if req.recurse {
            let scan_path = req.path.trim_end_matches('/').to_string();
            if scan_path != "." {
                if let Some(reason) = fs::invalid_import_path(&scan_path) {
                    tracing::warn!(
                        "Ignoring request for scan of invalid path \"{}\": {}",
                        req.path,
                        reason
                    );
                    import_request_done(state, Some(&req), "invalid").await;
                    continue;
                }
            }
            auto_import::schedule_scan(
                state,
                unode.io.clone(),
                scan_path,
                req.register_new,
                Some(req),
            );
        } else {
            auto_import::schedule_import(
                state,
                unode.io.clone(),
                req.path.clone(),
                req.register_new,
                Some(req),
            );
        }
    }

    Ok(())
}

/// Idle-time work on a node: periodic tidy-up and auto-verification.
async fn update_node_idle(state: &State, unode: &mut UpdateableNode) -> DaemonResult<()> {
    if !unode.idle(state) {
        return Ok(());
    }

    let node = unode.io.node();

    unode.ticks_since_tidy += 1;
    if unode.ticks_since_tidy >= TIDY_PERIOD_TICKS {
        unode.ticks_since_tidy = 0;
        schedule_tidy_up(state, unode);
    }

    // Auto-import without filesystem events falls back to scanning
    if node.auto_import && !unode.io.auto_import_supported() {
        unode.ticks_since_poll += 1;
        if unode.ticks_since_poll >= POLL_PERIOD_TICKS {
            unode.ticks_since_poll = 0;
            auto_import::schedule_scan(state, unode.io.clone(), ".".to_string(), true, None);
        }
    }

    if node.auto_verify > 0 {
        let db = state.database().await?;
        let cutoff =
            Utc::now() - ChronoDuration::days(state.config.daemon.auto_verify_min_days as i64);
        let candidates = db
            .auto_verify_candidates(node.id, cutoff, node.auto_verify as u64)
            .await?;

        for copy in candidates {
            tracing::info!(
                "Auto-verifying copy #{} on node {}.",
                copy.id,
                node.name
            );
            db.set_copy_state(copy.id, CopyState::Suspect, None, false)
                .await?;
        }
    }

    Ok(())
}

fn schedule_tidy_up(state: &State, unode: &UpdateableNode) {
    let node_name = unode.name();
    let io = unode.io.clone();

    state.queue.put(
        Task::new(
            format!("Tidy up {}", node_name),
            node_name.clone(),
            move |_ctx| {
                let io = io.clone();
                async move {
                    io.tidy_up().await;
                    Outcome::Done
                }
            },
        )
        .exclusive(),
    );
}

/// Pre-dispatch checks for one pull request into a group.
#[instrument(skip_all, fields(req = req.id))]
async fn update_pull(state: &State, ugroup: &UpdateableGroup, req: CopyRequestModel) {
    let group = ugroup.io.group();

    let db = match state.database().await {
        Ok(db) => db,
        Err(e) => {
            tracing::warn!("Skipping pull request #{}: {}", req.id, e);
            return;
        }
    };

    // What's the current situation on the destination?
    match db.group_copy_state(req.file_id, group.id).await {
        Ok(CopyState::Healthy) | Ok(CopyState::Released) => {
            // This request clearly wasn't responsible for creating the
            // copy, so it's cancelled rather than completed
            tracing::info!(
                "Cancelling pull request #{}: file already present in group {}.",
                req.id,
                group.name
            );
            let _ = db.cancel_copy_request(req.id).await;
            state.metrics.pulls.with_label_values(&["duplicate"]).inc();
            return;
        }
        Ok(CopyState::Suspect) => {
            tracing::warn!(
                "Skipping pull request #{}: existing copy in group {} needs check.",
                req.id,
                group.name
            );
            return;
        }
        // A corrupt copy is overwritten by the pull
        Ok(CopyState::Corrupt) | Ok(CopyState::Missing) | Ok(CopyState::Removed) => {}
        Err(e) => {
            tracing::warn!("Skipping pull request #{}: {}", req.id, e);
            return;
        }
    }

    // And on the source?
    let node_from = match db.node_by_id(req.node_from_id).await {
        Ok(node) => node,
        Err(e) => {
            tracing::warn!("Skipping pull request #{}: {}", req.id, e);
            return;
        }
    };

    if !node_from.active {
        tracing::warn!(
            "Skipping pull request #{}: source node {} is not active.",
            req.id,
            node_from.name
        );
        return;
    }

    match db.copy_state(req.file_id, node_from.id).await {
        Ok(CopyState::Healthy) | Ok(CopyState::Released) => {}
        Ok(CopyState::Suspect) => {
            tracing::info!(
                "Skipping pull request #{}: source needs check on node {}.",
                req.id,
                node_from.name
            );
            return;
        }
        Ok(_) => {
            tracing::warn!(
                "Cancelling pull request #{}: file not available on node {}.",
                req.id,
                node_from.name
            );
            let _ = db.cancel_copy_request(req.id).await;
            state.metrics.pulls.with_label_values(&["missing"]).inc();
            return;
        }
        Err(e) => {
            tracing::warn!("Skipping pull request #{}: {}", req.id, e);
            return;
        }
    }

    // Early checks passed: the group I/O picks the destination
    ugroup.io.pull(req, node_from).await;
}

/// One update pass over a group.
async fn update_group(state: &State, ugroup: &UpdateableGroup) -> DaemonResult<()> {
    let group = ugroup.io.group();

    if !ugroup.usable {
        return Ok(());
    }

    if !ugroup.init_idle {
        tracing::info!("Skipping update for group {}: busy", group.name);
        return Ok(());
    }

    tracing::info!("Updating group \"{}\".", group.name);

    let db = state.database().await?;
    let requests = db.pending_copy_requests_to(group.id).await?;

    // Coalesce duplicate requests for the same file: overlapping pulls
    // would write to the same destination path
    let mut seen_files = std::collections::HashSet::new();
    for req in requests {
        if seen_files.insert(req.file_id) {
            update_pull(state, ugroup, req).await;
        }
    }

    Ok(())
}

/// One full pass of the update loop.
async fn run_tick(
    state: &State,
    nodes: &mut HashMap<String, UpdateableNode>,
    groups: &mut HashMap<String, UpdateableGroup>,
    watchers: &mut WatcherSet,
) -> DaemonResult<()> {
    let db = state.database().await?;

    // Nodes are re-queried every pass so storage coming and going is
    // noticed
    let new_nodes: HashMap<String, NodeModel> = db
        .active_nodes(&state.hostname)
        .await?
        .into_iter()
        .map(|n| (n.name.clone(), n))
        .collect();

    if new_nodes.is_empty() {
        tracing::warn!("No active nodes on host ({})!", state.hostname);
    }

    // Drop nodes that have gone away
    let vanished: Vec<String> = nodes
        .keys()
        .filter(|name| !new_nodes.contains_key(*name))
        .cloned()
        .collect();
    for name in vanished {
        if let Some(unode) = nodes.remove(&name) {
            watchers.update(state, &unode.io, true);
        }
        tracing::info!("Node \"{}\" no longer available.", name);
    }

    // Available groups this tick: group id -> (member I/O, all idle)
    let mut group_members: HashMap<i64, (Vec<Arc<dyn NodeIO>>, bool)> = HashMap::new();

    for (name, model) in new_nodes {
        let rebuild = match nodes.get(&name) {
            Some(existing) => existing.needs_reinit(&model),
            None => true,
        };

        if rebuild {
            if !nodes.contains_key(&name) {
                tracing::info!("Node \"{}\" now available.", name);
            }

            match UpdateableNode::new(state, model.clone()) {
                Ok(unode) => {
                    nodes.insert(name.clone(), unode);
                }
                Err(e) => {
                    tracing::error!("Ignoring node \"{}\": {}", name, e);
                    nodes.remove(&name);
                    continue;
                }
            }
        } else if let Some(existing) = nodes.get(&name) {
            existing.io.set_node(model.clone());
        }

        let (io, idle) = {
            let unode = nodes.get(&name).unwrap();
            (unode.io.clone(), unode.idle(state))
        };

        // An uninitialized node isn't available (but may have had an
        // init task scheduled)
        if !check_node_init(state, &io, idle).await {
            watchers.update(state, &io, true);
            nodes.remove(&name);
            continue;
        }

        // Start or stop the auto-import watcher as flags demand
        watchers.update(state, &io, false);

        let entry = group_members
            .entry(model.group_id)
            .or_insert_with(|| (Vec::new(), true));
        entry.0.push(io);
        entry.1 &= idle;
    }

    // Drop groups that no longer have available nodes here
    let live_group_ids: Vec<i64> = group_members.keys().copied().collect();
    let vanished: Vec<String> = groups
        .iter()
        .filter(|(_, g)| !live_group_ids.contains(&g.group_id))
        .map(|(name, _)| name.clone())
        .collect();
    for name in vanished {
        groups.remove(&name);
        tracing::info!("Group \"{}\" no longer available.", name);
    }

    // Update the group set
    for (group_id, (members, idle)) in group_members {
        let model = match db.group_by_id(group_id).await {
            Ok(model) => model,
            Err(e) => {
                tracing::warn!("Ignoring group #{}: {}", group_id, e);
                continue;
            }
        };
        let name = model.name.clone();

        let rebuild = match groups.get(&name) {
            Some(existing) => existing.needs_reinit(&model),
            None => true,
        };

        if rebuild {
            if !groups.contains_key(&name) {
                tracing::info!("Group \"{}\" now available.", name);
            }

            match UpdateableGroup::new(state, model) {
                Ok(ugroup) => {
                    groups.insert(name.clone(), ugroup);
                }
                Err(e) => {
                    tracing::error!("Ignoring group \"{}\": {}", name, e);
                    groups.remove(&name);
                    continue;
                }
            }
        } else if let Some(existing) = groups.get(&name) {
            existing.io.set_group(model);
        }

        let ugroup = groups.get_mut(&name).unwrap();
        ugroup.init_idle = idle;
        ugroup.usable = match ugroup.io.set_nodes(members) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        };
    }

    // Node updates
    for unode in nodes.values() {
        if let Err(e) = update_node(state, unode).await {
            tracing::warn!("Update failed for node {}: {}", unode.name(), e);
        }
    }

    // Group updates
    for ugroup in groups.values() {
        if let Err(e) = update_group(state, ugroup).await {
            tracing::warn!(
                "Update failed for group {}: {}",
                ugroup.io.group().name,
                e
            );
        }
    }

    // Idle updates
    for unode in nodes.values_mut() {
        if let Err(e) = update_node_idle(state, unode).await {
            tracing::warn!("Idle update failed for node {}: {}", unode.name(), e);
        }
    }

    Ok(())
}

/// The daemon's main loop. Returns the process exit code.
pub async fn update_loop(state: State, once: bool) -> i32 {
    let mut nodes = HashMap::new();
    let mut groups = HashMap::new();
    let mut watchers = WatcherSet::new();
    let shutdown = state.queue.shutdown_token();

    let update_interval = state.config.daemon.update_interval;

    while !shutdown.is_cancelled() {
        let tick_start = Instant::now();

        if let Err(e) = run_tick(&state, &mut nodes, &mut groups, &mut watchers).await {
            // Transient trouble (often the database); try again next
            // tick rather than exiting
            tracing::warn!("Update pass failed: {}", e);
        }

        let elapsed = tick_start.elapsed();
        tracing::info!(
            "Main loop execution was {}.",
            pretty_deltat(elapsed.as_secs_f64())
        );
        if elapsed > update_interval {
            tracing::warn!(
                "Main loop overran the update interval ({} > {}).",
                pretty_deltat(elapsed.as_secs_f64()),
                pretty_deltat(update_interval.as_secs_f64())
            );
        }

        let stats = state.queue.stats();
        state.metrics.main_loops.inc();
        state.metrics.main_loop_seconds.set(elapsed.as_secs_f64());
        state.metrics.tasks_queued.set(stats.queued as i64);
        state.metrics.tasks_deferred.set(stats.deferred as i64);
        state
            .metrics
            .tasks_in_progress
            .set(stats.in_progress as i64);
        tracing::info!(
            "Tasks: {} queued, {} deferred, {} in-progress",
            stats.queued,
            stats.deferred,
            stats.in_progress
        );

        if once {
            // Exit-after-update mode: wait for the queue to drain
            tracing::info!("Waiting for updates to complete.");
            while !state.queue.is_empty() && !shutdown.is_cancelled() {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            tracing::info!("Update complete. Exiting.");
            watchers.stop_all();
            return 0;
        }

        let remaining = update_interval.saturating_sub(tick_start.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    watchers.stop_all();
    0
}

#[cfg(test)]
mod tests;
