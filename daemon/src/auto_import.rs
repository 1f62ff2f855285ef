//! File import.
//!
//! Covers both halves of getting files into the Index: the
//! filesystem-event watchers that notice new files on auto-import nodes,
//! and the import/scan engine that registers acquisitions, files and
//! copies. Import requests from the CLI funnel through the same engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::database::entity::copy::CopyState;
use crate::database::entity::import_request::ImportRequestModel;
use crate::database::DataIndex;
use crate::error::{DaemonError, DaemonResult};
use crate::fs;
use crate::io::NodeIO;
use crate::queue::{Outcome, Task, TaskCtx};
use crate::State;

/// How long an import waits for a path that isn't ready for I/O.
const READY_WAIT: Duration = Duration::from_secs(600);

/// Records a completed import request and counts the result.
pub async fn import_request_done(
    state: &State,
    req: Option<&ImportRequestModel>,
    result: &str,
) {
    state.metrics.imports.with_label_values(&[result]).inc();

    let Some(req) = req else { return };
    let db = match state.database().await {
        Ok(db) => db,
        Err(e) => {
            tracing::warn!("Failed to complete import request #{}: {}", req.id, e);
            return;
        }
    };

    match db.complete_import_request(req.id).await {
        Ok(true) => tracing::info!("Completed import request #{}.", req.id),
        // Someone else completed it; fine
        Ok(false) => {}
        Err(e) => tracing::warn!("Failed to complete import request #{}: {}", req.id, e),
    }
}

/// Queues a task to import one path on a node.
pub fn schedule_import(
    state: &State,
    node_io: Arc<dyn NodeIO>,
    path: String,
    register: bool,
    req: Option<ImportRequestModel>,
) {
    let name = format!("Import {} on {}", path, node_io.fifo());
    let key = node_io.fifo();
    let task_state = state.clone();

    state.queue.put(Task::new(name, key, move |ctx| {
        import_file_task(
            ctx,
            task_state.clone(),
            node_io.clone(),
            path.clone(),
            register,
            req.clone(),
        )
    }));
}

/// Queues a scan of a directory tree on a node.
pub fn schedule_scan(
    state: &State,
    node_io: Arc<dyn NodeIO>,
    path: String,
    register: bool,
    req: Option<ImportRequestModel>,
) {
    let name = if path == "." {
        format!("Catch-up on {}", node_io.fifo())
    } else {
        format!("Scan \"{}\" on {}", path, node_io.fifo())
    };
    let key = node_io.fifo();
    let task_state = state.clone();

    state.queue.put(Task::new(name, key, move |ctx| {
        scan_task(
            ctx,
            task_state.clone(),
            node_io.clone(),
            path.clone(),
            register,
            req.clone(),
        )
    }));
}

/// Imports `path` on a node. The body of an import task.
pub(crate) async fn import_file_task(
    _ctx: TaskCtx,
    state: State,
    node_io: Arc<dyn NodeIO>,
    path: String,
    register: bool,
    req: Option<ImportRequestModel>,
) -> Outcome {
    let node = node_io.node();
    let req = req.as_ref();

    // Watchers hand us absolute paths; requests are node-relative
    let rel = {
        let p = Path::new(&path);
        if p.is_absolute() {
            match p.strip_prefix(node_io.fs().root()) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => {
                    tracing::warn!(
                        "Ignoring import of {}: not rooted under node {}",
                        path,
                        node.name
                    );
                    import_request_done(&state, req, "ignored").await;
                    return Outcome::Done;
                }
            }
        } else {
            path.clone()
        }
    };

    // The watcher occasionally reports the node root itself
    if rel.is_empty() {
        tracing::debug!("Skipping import request of node root");
        import_request_done(&state, req, "ignored").await;
        return Outcome::Done;
    }

    if rel == fs::NODE_MARKER {
        tracing::debug!("Ignoring node file during import");
        import_request_done(&state, req, "ignored").await;
        return Outcome::Done;
    }

    if let Some(reason) = fs::invalid_import_path(&rel) {
        tracing::warn!("Ignoring import of invalid path \"{}\": {}", rel, reason);
        import_request_done(&state, req, "invalid").await;
        return Outcome::Done;
    }

    let basename = rel.rsplit('/').next().unwrap_or(&rel).to_owned();
    if fs::is_hidden(&basename) {
        tracing::info!("Not importing \"{}\": filename starts with a dot.", rel);
        import_request_done(&state, req, "bad_name").await;
        return Outcome::Done;
    }

    if !node_io.fs().is_file(&rel).await {
        tracing::info!("Not importing \"{}\": not a file.", rel);
        import_request_done(&state, req, "invalid").await;
        return Outcome::Done;
    }

    if !node_io.ready_path(&rel).await {
        tracing::info!(
            "Path \"{}\" not ready for I/O during import. Waiting {} seconds.",
            rel,
            READY_WAIT.as_secs()
        );
        return Outcome::Requeue(READY_WAIT);
    }

    // A lock file suppresses import while present. Its removal raises a
    // fresh filesystem event, which re-queues us, so the request is left
    // pending rather than completed.
    let lock_rel = match rel.rsplit_once('/') {
        Some((dir, base)) => format!("{}/{}", dir, fs::lock_file_for(base)),
        None => fs::lock_file_for(&rel),
    };
    if node_io.exists(&lock_rel).await {
        tracing::info!("Skipping \"{}\": locked.", rel);
        return Outcome::Done;
    }

    tracing::debug!("Considering \"{}\" for import to node {}.", rel, node.name);

    // First detector to accept wins
    let detection = state
        .registry
        .detectors()
        .iter()
        .find_map(|detector| detector.detect(&rel));
    let Some(detection) = detection else {
        tracing::info!("Not importing non-acquisition path: {}", rel);
        import_request_done(&state, req, "no_detection").await;
        return Outcome::Done;
    };

    if let Some(reason) = fs::invalid_import_path(&detection.acq_name) {
        tracing::warn!(
            "Rejecting invalid acq path \"{}\": {}",
            detection.acq_name,
            reason
        );
        import_request_done(&state, req, "bad_acq").await;
        return Outcome::Done;
    }

    let db = match state.database().await {
        Ok(db) => db,
        Err(e) => {
            tracing::warn!("Deferring import of {}: {}", rel, e);
            return Outcome::Requeue(Duration::from_secs(60));
        }
    };

    // Duplicate import is benign
    let known = db
        .find_file(&detection.acq_name, &detection.file_name)
        .await;
    let known = match known {
        Ok(known) => known,
        Err(e) => {
            tracing::warn!("Deferring import of {}: {}", rel, e);
            return Outcome::Requeue(Duration::from_secs(60));
        }
    };
    if let Some((file, _)) = &known {
        match db.copy_for(file.id, node.id).await {
            Ok(Some(copy)) if copy.state.on_disk() => {
                tracing::debug!("Not importing {}: already known", rel);
                import_request_done(&state, req, "duplicate").await;
                return Outcome::Done;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Deferring import of {}: {}", rel, e);
                return Outcome::Requeue(Duration::from_secs(60));
            }
        }
    }

    if known.is_none() && !register {
        tracing::info!("Not importing unregistered file: \"{}\".", rel);
        import_request_done(&state, req, "unregistered").await;
        return Outcome::Done;
    }

    tracing::debug!("Computing md5sum of \"{}\".", rel);
    let (size_b, md5sum) = match (
        node_io.fs().file_size(&rel).await,
        node_io.fs().md5sum(&rel).await,
    ) {
        (Ok(size), Ok(md5)) => (size as i64, md5),
        _ => {
            tracing::warn!("Failed to stat \"{}\" during import.", rel);
            return Outcome::Requeue(Duration::from_secs(60));
        }
    };

    let file = match known {
        Some((file, _)) => {
            // Never overwrite an existing registration
            if file.size_b != size_b || file.md5sum != md5sum.to_hex() {
                tracing::error!(
                    "Not importing {}: size or hash differs from existing registration.",
                    rel
                );
                import_request_done(&state, req, "conflict").await;
                return Outcome::Done;
            }
            file
        }
        None => {
            let acq = match db.get_or_create_acq(&detection.acq_name).await {
                Ok(acq) => acq,
                Err(e) => {
                    tracing::warn!("Deferring import of {}: {}", rel, e);
                    return Outcome::Requeue(Duration::from_secs(60));
                }
            };

            match db
                .get_or_create_file(&acq, &detection.file_name, size_b, &md5sum)
                .await
            {
                Ok(file) => file,
                Err(DaemonError::RegistrationConflict { path }) => {
                    tracing::error!(
                        "Not importing {}: size or hash differs from existing registration.",
                        path
                    );
                    import_request_done(&state, req, "conflict").await;
                    return Outcome::Done;
                }
                Err(e) => {
                    tracing::warn!("Deferring import of {}: {}", rel, e);
                    return Outcome::Requeue(Duration::from_secs(60));
                }
            }
        }
    };

    // A previously missing copy turning up is grounds for suspicion
    let prior = db.copy_for(file.id, node.id).await.ok().flatten();
    let new_state = match prior.as_ref().map(|c| c.state) {
        Some(CopyState::Missing) => {
            tracing::warn!(
                "Imported missing file \"{}\" on node {}. Marking suspect.",
                rel,
                node.name
            );
            CopyState::Suspect
        }
        _ => CopyState::Healthy,
    };

    match db.upsert_copy(file.id, node.id, new_state, Some(size_b)).await {
        Ok(_) => {
            if new_state == CopyState::Healthy {
                tracing::info!("Imported file copy \"{}\" on node \"{}\".", rel, node.name);
            }
        }
        Err(e) => {
            tracing::warn!("Deferring import of {}: {}", rel, e);
            return Outcome::Requeue(Duration::from_secs(60));
        }
    }

    import_request_done(&state, req, "success").await;

    Outcome::Done
}

/// Scans a directory tree for unregistered files. The body of a scan or
/// catch-up task.
pub(crate) async fn scan_task(
    _ctx: TaskCtx,
    state: State,
    node_io: Arc<dyn NodeIO>,
    path: String,
    register: bool,
    req: Option<ImportRequestModel>,
) -> Outcome {
    let node = node_io.node();

    let db = match state.database().await {
        Ok(db) => db,
        Err(e) => {
            tracing::warn!("Deferring scan of {}: {}", path, e);
            return Outcome::Requeue(Duration::from_secs(60));
        }
    };

    let tracked = match db.tracked_paths(node.id).await {
        Ok(tracked) => tracked,
        Err(e) => {
            tracing::warn!("Deferring scan of {}: {}", path, e);
            return Outcome::Requeue(Duration::from_secs(60));
        }
    };

    tracing::info!("Scanning \"{}\" on \"{}\" for new files.", path, node.name);

    let files = match node_io.fs().walk(&path).await {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!("Deferring scan of {}: {}", path, e);
            return Outcome::Requeue(Duration::from_secs(60));
        }
    };

    for file in files {
        if tracked.contains(&file) {
            tracing::debug!("Skipping already-registered file \"{}\".", file);
        } else {
            schedule_import(&state, node_io.clone(), file, register, None);
        }
    }

    // The scan succeeded whether or not anything was importable
    import_request_done(&state, req.as_ref(), "success").await;

    Outcome::Done
}

/// The running auto-import watchers, one per watched node.
pub struct WatcherSet {
    watchers: HashMap<String, NodeWatcher>,
}

struct NodeWatcher {
    // Dropping the watcher stops event delivery
    _watcher: RecommendedWatcher,
    pump: tokio::task::JoinHandle<()>,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self {
            watchers: HashMap::new(),
        }
    }

    /// Starts or stops the watcher for a node, as its flags demand.
    ///
    /// When a watcher starts, a catch-up scan is queued to find files
    /// that arrived while nobody was watching.
    pub fn update(&mut self, state: &State, node_io: &Arc<dyn NodeIO>, force_stop: bool) {
        let node = node_io.node();
        let wanted = !force_stop && node.auto_import && node_io.auto_import_supported();

        if !wanted {
            if let Some(watcher) = self.watchers.remove(&node.name) {
                watcher.pump.abort();
                tracing::info!("Stopped watching node \"{}\".", node.name);
            }
            return;
        }

        if self.watchers.contains_key(&node.name) {
            return;
        }

        match start_watcher(state.clone(), node_io.clone()) {
            Ok(watcher) => {
                tracing::info!(
                    "Watching node \"{}\" root \"{}\" for auto import.",
                    node.name,
                    node_io.fs().root().display()
                );
                self.watchers.insert(node.name.clone(), watcher);

                // Catch up with files the watcher missed
                schedule_scan(state, node_io.clone(), ".".to_string(), true, None);
            }
            Err(e) => {
                tracing::warn!(
                    "Unable to start auto import on node \"{}\": {}",
                    node.name,
                    e
                );
            }
        }
    }

    pub fn stop_all(&mut self) {
        for (name, watcher) in self.watchers.drain() {
            watcher.pump.abort();
            tracing::debug!("Stopped watching node \"{}\".", name);
        }
    }
}

impl Default for WatcherSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides what, if anything, a filesystem event should import.
///
/// Creation or modification of a visible file imports it; removal of a
/// lock file imports the file it was locking (the data file's own close
/// event may have fired while the lock was still present).
fn event_import_path(kind: &EventKind, path: &Path) -> Option<PathBuf> {
    let basename = path.file_name()?.to_str()?;

    match kind {
        EventKind::Remove(_) => fs::locked_name(basename)
            .map(|locked| path.with_file_name(locked)),
        EventKind::Create(_) | EventKind::Modify(_) => {
            if fs::is_hidden(basename) {
                None
            } else {
                Some(path.to_path_buf())
            }
        }
        _ => None,
    }
}

fn start_watcher(state: State, node_io: Arc<dyn NodeIO>) -> DaemonResult<NodeWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let root = node_io.fs().root().to_path_buf();

    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for path in &event.paths {
                    if let Some(import) = event_import_path(&event.kind, path) {
                        let _ = tx.send(import);
                    }
                }
            }
            Err(e) => tracing::warn!("Error during watch: {:?}", e),
        })
        .map_err(DaemonError::filesystem_error)?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(DaemonError::filesystem_error)?;

    let pump = tokio::spawn(async move {
        while let Some(path) = rx.recv().await {
            schedule_import(
                &state,
                node_io.clone(),
                path.to_string_lossy().into_owned(),
                true,
                None,
            );
        }
    });

    Ok(NodeWatcher {
        _watcher: watcher,
        pump,
    })
}
