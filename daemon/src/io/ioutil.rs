//! Transfer plumbing.
//!
//! Pulls run external tools (`bbcp`, `rsync`, `cp`) or hardlink into a
//! hidden temporary name beside the final destination, verify size and
//! hash, then rename into place under the tree lock. The auto-import
//! watcher is required to ignore the hidden temporaries.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::TransferTool;
use crate::database::entity::acq::AcqModel;
use crate::database::entity::copy::CopyState;
use crate::database::entity::copy_request::CopyRequestModel;
use crate::database::entity::file::FileModel;
use crate::database::entity::node::NodeModel;
use crate::database::DataIndex;
use crate::fs;
use crate::io::NodeIO;
use crate::queue::{Outcome, Task, TaskCtx};
use crate::State;
use alpenhorn::util::{pretty_bytes, pretty_deltat};

/// First retry delay after a failed transfer.
const RETRY_BASE: Duration = Duration::from_secs(30);

/// Retry delay ceiling.
const RETRY_CAP: Duration = Duration::from_secs(3600);

/// Exponential backoff for transfer retries: 30 s doubling to 1 h.
pub fn retry_backoff(attempt: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(1u32 << attempt.min(7))
        .min(RETRY_CAP)
}

/// Is an executable on the PATH?
pub fn command_available(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };

    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

/// Which tool handles a remote pull.
pub fn resolve_remote_tool(
    forced: Option<TransferTool>,
    bbcp_available: bool,
    rsync_available: bool,
) -> Option<TransferTool> {
    match forced {
        Some(TransferTool::Bbcp) if bbcp_available => Some(TransferTool::Bbcp),
        Some(TransferTool::Rsync) if rsync_available => Some(TransferTool::Rsync),
        Some(_) => None,
        None if bbcp_available => Some(TransferTool::Bbcp),
        None if rsync_available => Some(TransferTool::Rsync),
        None => None,
    }
}

/// Result of one transfer attempt.
struct IoResult {
    success: bool,
    /// Source-side MD5 reported by the tool, if any.
    md5sum: Option<String>,
    stderr: Option<String>,
    /// Whether a failure implicates the source file.
    check_src: bool,
}

impl IoResult {
    fn failure(stderr: impl Into<String>, check_src: bool) -> Self {
        Self {
            success: false,
            md5sum: None,
            stderr: Some(stderr.into()),
            check_src,
        }
    }
}

/// Runs a subprocess with a timeout, killing it on expiry.
async fn run_command(argv: &[String], timeout: Duration) -> (Option<i32>, String, String) {
    tracing::debug!("Running: {}", argv.join(" "));

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return (None, String::new(), e.to_string()),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => (
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Ok(Err(e)) => (None, String::new(), e.to_string()),
        // Dropping the in-flight future kills the child
        Err(_) => (
            None,
            String::new(),
            format!("command timed out after {:?}", timeout),
        ),
    }
}

/// Pulls a remote file with bbcp.
///
/// bbcp computes an MD5 sum on the source as a side effect, which saves
/// hashing the destination afterwards.
async fn bbcp(from_spec: &str, to_path: &str, timeout: Duration) -> IoResult {
    let argv: Vec<String> = [
        "bbcp", "-f", "-e", "-E", "md5=", "-s", "16", from_spec, to_path,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let (code, _stdout, stderr) = run_command(&argv, timeout).await;

    if code != Some(0) {
        return IoResult::failure(stderr, true);
    }

    let md5_re = Regex::new("md5 ([a-f0-9]{32})").unwrap();
    match md5_re.captures(&stderr) {
        Some(captures) => IoResult {
            success: true,
            md5sum: Some(captures[1].to_string()),
            stderr: None,
            check_src: true,
        },
        None => IoResult::failure("unable to read md5sum from bbcp output", false),
    }
}

/// Pulls a file with rsync, remotely over SSH or locally.
async fn rsync(from_spec: &str, to_path: &str, timeout: Duration) -> IoResult {
    let argv: Vec<String> = [
        "rsync",
        "-aH",
        "--inplace",
        "--partial-dir=.alpenhorn_partial",
        from_spec,
        to_path,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let (code, _stdout, stderr) = run_command(&argv, timeout).await;

    if code == Some(0) {
        return IoResult {
            success: true,
            md5sum: None,
            stderr: None,
            check_src: true,
        };
    }

    // Failures creating or writing the destination aren't the source's
    // fault
    let check_src = !(stderr.contains("mkstemp") || stderr.contains("write failed on"));
    IoResult::failure(stderr, check_src)
}

/// Copies a local file with cp.
async fn local_copy(from_path: &str, to_path: &str, timeout: Duration) -> IoResult {
    let argv: Vec<String> = ["cp", from_path, to_path]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let (code, _stdout, stderr) = run_command(&argv, timeout).await;

    if code == Some(0) {
        IoResult {
            success: true,
            md5sum: None,
            stderr: None,
            check_src: true,
        }
    } else {
        IoResult::failure(stderr, true)
    }
}

/// Hardlinks a local file, if source and destination share a filesystem.
///
/// Returns `None` when linking isn't possible (the caller falls back to
/// a copy).
async fn hardlink(from_path: &str, to_path: &str) -> Option<IoResult> {
    match tokio::fs::hard_link(from_path, to_path).await {
        Ok(()) => Some(IoResult {
            success: true,
            md5sum: None,
            stderr: None,
            check_src: true,
        }),
        Err(e) => {
            tracing::debug!("hardlink failed: {}", e);
            None
        }
    }
}

/// Reserves space and queues the pull task for a chosen destination.
///
/// Pull tasks are `parallel`: they may overlap other work on the
/// destination node, bounded by the node's pull-permit gate.
pub fn schedule_pull(
    state: &State,
    node_io: Arc<dyn NodeIO>,
    req: CopyRequestModel,
    node_from: NodeModel,
    file: FileModel,
    acq: AcqModel,
) {
    let size_b = file.size_b.max(0) as u64;
    let node_name = node_io.fifo();

    if !node_io.reserve_bytes(size_b) {
        tracing::info!(
            "Skipping pull of {}/{}: no room on node {}",
            acq.name,
            file.name,
            node_name
        );
        return;
    }

    let task_state = state.clone();
    let task = Task::new(
        format!("Pull {}/{} onto {}", acq.name, file.name, node_name),
        node_name.clone(),
        move |ctx| {
            pull_task(
                ctx,
                task_state.clone(),
                node_io.clone(),
                req.clone(),
                node_from.clone(),
                file.clone(),
                acq.clone(),
            )
        },
    )
    .parallel()
    .on_finish({
        let state = state.clone();
        move || state.sub_reservation(&node_name, size_b)
    });

    state.queue.put(task);
}

/// One attempt at fulfilling a pull request.
async fn pull_task(
    ctx: TaskCtx,
    state: State,
    node_io: Arc<dyn NodeIO>,
    req: CopyRequestModel,
    node_from: NodeModel,
    file: FileModel,
    acq: AcqModel,
) -> Outcome {
    let dest = node_io.node();
    let path = format!("{}/{}", acq.name, file.name);
    let size_b = file.size_b.max(0) as u64;

    // Bounded concurrency per destination node
    let permits = node_io.pull_permits();
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Outcome::Done,
    };

    if ctx.shutdown.is_cancelled() {
        // Leave the request pending for the next start
        return Outcome::Done;
    }

    let db = match state.database().await {
        Ok(db) => db,
        Err(e) => {
            tracing::warn!("Deferring pull of {}: {}", path, e);
            return Outcome::Requeue(retry_backoff(ctx.attempt));
        }
    };

    // We don't know how long we sat in the queue; re-check the request
    match db.copy_request_by_id(req.id).await {
        Ok(Some(fresh)) if !fresh.completed && !fresh.cancelled => {}
        Ok(_) => {
            tracing::info!("Skipping pull of {}: request #{} resolved.", path, req.id);
            return Outcome::Done;
        }
        Err(e) => {
            tracing::warn!("Deferring pull of {}: {}", path, e);
            return Outcome::Requeue(retry_backoff(ctx.attempt));
        }
    }

    // Pre-pull search: perhaps the file arrived some other way
    match db.copy_state(file.id, dest.id).await {
        Ok(CopyState::Healthy) => {
            tracing::info!(
                "Completing pull request #{}: {} already healthy on node {}.",
                req.id,
                path,
                dest.name
            );
            let _ = db.complete_copy_request(req.id).await;
            state.metrics.pulls.with_label_values(&["duplicate"]).inc();
            return Outcome::Done;
        }
        Ok(state_known) => {
            if !state_known.on_disk() && node_io.exists(&path).await {
                // Bytes on disk the Index doesn't know about: force a
                // check instead of overwriting them
                tracing::warn!(
                    "Skipping pull of {}: file already on disk on node {}.",
                    path,
                    dest.name
                );
                let _ = db
                    .upsert_copy(file.id, dest.id, CopyState::Suspect, None)
                    .await;
                return Outcome::Done;
            }
        }
        Err(e) => {
            tracing::warn!("Deferring pull of {}: {}", path, e);
            return Outcome::Requeue(retry_backoff(ctx.attempt));
        }
    }

    // Source spec
    let local = node_from.local_to(&state.hostname);
    let Some(source_root) = node_from.root.clone() else {
        tracing::warn!(
            "Skipping pull of {}: source node {} has no root.",
            path,
            node_from.name
        );
        return Outcome::Done;
    };
    let source_path = format!("{}/{}", source_root, path);

    let from_spec = if local {
        source_path.clone()
    } else {
        let Some(address) = node_from.address.clone() else {
            tracing::warn!(
                "Skipping pull of {}: no route to host for node {}.",
                path,
                node_from.name
            );
            return Outcome::Done;
        };
        match &node_from.username {
            Some(username) => format!("{}@{}:{}", username, address, source_path),
            None => format!("{}:{}", address, source_path),
        }
    };

    // Hidden temporary beside the final destination
    let node_fs = node_io.fs();
    let temp_rel = match path.rsplit_once('/') {
        Some((dir, base)) => format!("{}/{}", dir, fs::temp_name(base)),
        None => fs::temp_name(&path),
    };
    let temp_abs = node_fs.full_path(&temp_rel).to_string_lossy().into_owned();

    {
        let _guard = node_io.tree_lock().up().await;
        if let Err(e) = node_fs.mkdir_parents(&path).await {
            tracing::error!("Failed to create directories for {}: {}", path, e);
            return Outcome::Requeue(retry_backoff(ctx.attempt));
        }
    }

    if ctx.attempt == 0 {
        let _ = db.start_copy_request(req.id).await;
    }

    let daemon = &state.config.daemon;
    let timeout = daemon.pull_timeout_base
        + Duration::from_secs(size_b / daemon.pull_bytes_per_second.max(1));

    let start = Instant::now();

    let ioresult = if !local {
        let tool = resolve_remote_tool(
            daemon.pull_transfer_tool,
            command_available("bbcp"),
            command_available("rsync"),
        );
        match tool {
            Some(TransferTool::Bbcp) => {
                tracing::info!("Pulling remote file {} using bbcp", path);
                bbcp(&from_spec, &temp_abs, timeout).await
            }
            Some(TransferTool::Rsync) => {
                tracing::info!("Pulling remote file {} using rsync", path);
                rsync(&from_spec, &temp_abs, timeout).await
            }
            None => {
                tracing::error!("No commands available to complete remote pull.");
                IoResult::failure("no transfer tool available", false)
            }
        }
    } else {
        // Hardlinking across the archive boundary would let one side
        // mutate the other's bytes
        let linked = if node_from.archive() == dest.archive() {
            hardlink(&source_path, &temp_abs).await
        } else {
            None
        };

        match linked {
            Some(result) => {
                tracing::info!("Hardlinked local file {}", path);
                result
            }
            None if command_available("rsync") => {
                tracing::info!("Pulling local file {} using rsync", path);
                rsync(&source_path, &temp_abs, timeout).await
            }
            None => {
                tracing::info!("Pulling local file {} using cp", path);
                local_copy(&source_path, &temp_abs, timeout).await
            }
        }
    };

    let failure = if !ioresult.success {
        Some((
            ioresult.stderr.unwrap_or_else(|| "unspecified error".to_string()),
            ioresult.check_src,
        ))
    } else {
        // Verify the bytes that landed
        match verify_temp(&state, node_io.as_ref(), &temp_rel, &file, ioresult.md5sum).await {
            Ok(()) => None,
            Err(reason) => Some((reason, true)),
        }
    };

    if let Some((reason, check_src)) = failure {
        let _ = node_fs.remove_file(&temp_rel).await;
        state.metrics.pulls.with_label_values(&["failure"]).inc();

        if check_src {
            tracing::error!("Copy failed: {}; marking source file suspect.", reason);
            let _ = db
                .upsert_copy(file.id, node_from.id, CopyState::Suspect, None)
                .await;
        } else {
            tracing::error!("Copy failed: {}", reason);
        }

        if ctx.attempt + 1 >= daemon.max_pull_attempts {
            tracing::error!(
                "Giving up on pull of {} after {} attempts.",
                path,
                ctx.attempt + 1
            );
            let _ = db
                .upsert_copy(file.id, dest.id, CopyState::Missing, None)
                .await;
            return Outcome::Done;
        }

        return Outcome::Requeue(retry_backoff(ctx.attempt));
    }

    // Rename into place. Nothing ever observes a partial file at the
    // final path.
    {
        let _guard = node_io.tree_lock().up().await;
        if let Err(e) = node_fs.atomic_rename(&temp_rel, &path).await {
            tracing::error!("Failed to rename {} into place: {}", path, e);
            let _ = node_fs.remove_file(&temp_rel).await;
            return Outcome::Requeue(retry_backoff(ctx.attempt));
        }
    }

    let size_on_node = node_fs.file_size(&path).await.ok().map(|s| s as i64);
    if let Err(e) = db
        .upsert_copy(file.id, dest.id, CopyState::Healthy, size_on_node)
        .await
    {
        tracing::error!("Failed to record pulled copy {}: {}", path, e);
        return Outcome::Requeue(retry_backoff(ctx.attempt));
    }
    let _ = db.complete_copy_request(req.id).await;

    state.metrics.pulls.with_label_values(&["success"]).inc();
    let elapsed = start.elapsed().as_secs_f64();
    let rate = size_b as f64 / elapsed.max(1e-9);
    tracing::info!(
        "Pull complete. Transferred {} in {} [{}/s]",
        pretty_bytes(size_b),
        pretty_deltat(elapsed),
        pretty_bytes(rate as u64)
    );

    // Whatever happened, refresh free space
    let avail = node_io.bytes_avail(false).await;
    let _ = db.update_avail_bytes(dest.id, avail).await;

    Outcome::Done
}

/// Checks a landed temporary against the file's registration.
async fn verify_temp(
    state: &State,
    node_io: &dyn NodeIO,
    temp_rel: &str,
    file: &FileModel,
    tool_md5: Option<String>,
) -> Result<(), String> {
    let node_fs = node_io.fs();

    let size = node_fs
        .file_size(temp_rel)
        .await
        .map_err(|e| format!("can't stat transferred file: {}", e))?;
    if size as i64 != file.size_b {
        return Err(format!(
            "size mismatch: got {}, expected {}",
            size, file.size_b
        ));
    }

    if let Some(md5) = tool_md5 {
        if md5 != file.md5sum {
            return Err(format!("md5 mismatch: got {}, expected {}", md5, file.md5sum));
        }
        return Ok(());
    }

    if state.config.verify_pull_to(node_io.node().archive()) {
        let md5 = node_fs
            .md5sum(temp_rel)
            .await
            .map_err(|e| format!("can't hash transferred file: {}", e))?
            .to_hex();
        if md5 != file.md5sum {
            return Err(format!("md5 mismatch: got {}, expected {}", md5, file.md5sum));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_ladder() {
        assert_eq!(retry_backoff(0), Duration::from_secs(30));
        assert_eq!(retry_backoff(1), Duration::from_secs(60));
        assert_eq!(retry_backoff(2), Duration::from_secs(120));
        assert_eq!(retry_backoff(6), Duration::from_secs(1920));
        // Capped at one hour from here on
        assert_eq!(retry_backoff(7), Duration::from_secs(3600));
        assert_eq!(retry_backoff(30), Duration::from_secs(3600));
    }

    #[test]
    fn test_resolve_remote_tool() {
        use TransferTool::*;

        // Runtime detection prefers bbcp
        assert_eq!(resolve_remote_tool(None, true, true), Some(Bbcp));
        assert_eq!(resolve_remote_tool(None, false, true), Some(Rsync));
        assert_eq!(resolve_remote_tool(None, true, false), Some(Bbcp));
        assert_eq!(resolve_remote_tool(None, false, false), None);

        // A forced tool is used only if present
        assert_eq!(resolve_remote_tool(Some(Rsync), true, true), Some(Rsync));
        assert_eq!(resolve_remote_tool(Some(Bbcp), true, true), Some(Bbcp));
        assert_eq!(resolve_remote_tool(Some(Bbcp), false, true), None);
    }

    #[test]
    fn test_command_available() {
        assert!(command_available("sh"));
        assert!(!command_available("definitely-not-a-real-tool-9000"));
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let argv: Vec<String> = ["sh", "-c", "echo out; echo err >&2"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let (code, stdout, stderr) = run_command(&argv, Duration::from_secs(10)).await;
        assert_eq!(code, Some(0));
        assert_eq!(stdout.trim(), "out");
        assert_eq!(stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_command_timeout_kills() {
        let argv: Vec<String> = ["sleep", "600"].iter().map(|s| s.to_string()).collect();

        let start = std::time::Instant::now();
        let (code, _stdout, stderr) = run_command(&argv, Duration::from_millis(100)).await;
        assert!(code.is_none());
        assert!(stderr.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_hardlink_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.dat");
        let dst = dir.path().join(".src.dat.abcd1234");
        tokio::fs::write(&src, b"hello world").await.unwrap();

        let result = hardlink(src.to_str().unwrap(), dst.to_str().unwrap())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_hardlink_missing_source_declines() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst.dat");

        assert!(hardlink("/definitely/not/here", dst.to_str().unwrap())
            .await
            .is_none());
    }
}
