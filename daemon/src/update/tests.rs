use super::*;

use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};

use crate::database::entity::copy_request::{self, Entity as CopyRequest};
use crate::database::entity::import_request::{self, Entity as ImportRequest};
use crate::database::entity::node::StorageType;
use crate::extensions::Registry;
use crate::io::default::DefaultNodeIO;
use crate::io::NodeIoCtx;
use crate::pool::WorkerPool;
use crate::testing::{make_file, make_group, make_node, make_node_at, test_index, test_state};

async fn make_copy_request(
    db: &DatabaseConnection,
    file_id: i64,
    group_to_id: i64,
    node_from_id: i64,
) -> CopyRequestModel {
    let res = CopyRequest::insert(copy_request::ActiveModel {
        file_id: Set(file_id),
        group_to_id: Set(group_to_id),
        node_from_id: Set(node_from_id),
        completed: Set(false),
        cancelled: Set(false),
        timestamp: Set(Utc::now()),
        n_requests: Set(1),
        ..Default::default()
    })
    .exec(db)
    .await
    .unwrap();

    CopyRequest::find_by_id(res.last_insert_id)
        .one(db)
        .await
        .unwrap()
        .unwrap()
}

/// A destination group with one local node, plus a remote source node.
struct PullFixture {
    _root: tempfile::TempDir,
    state: State,
    group: UpdateableGroup,
    dest_node: NodeModel,
    source: NodeModel,
    file_id: i64,
}

async fn pull_fixture() -> PullFixture {
    let root = tempfile::tempdir().unwrap();
    let db = test_index().await;

    let dest_group = make_group(&db, "dest").await;
    let dest_node = make_node_at(
        &db,
        "dest1",
        &dest_group,
        StorageType::Archive,
        root.path().to_str().unwrap(),
    )
    .await;

    let source_group = make_group(&db, "src").await;
    let source = make_node(&db, "src1", &source_group, StorageType::Archive).await;

    let file = make_file(&db, "2025/02/21", "meta.txt").await;

    // Seed the measured free space so fits() works from the cache
    db.update_avail_bytes(dest_node.id, Some(10 << 30))
        .await
        .unwrap();
    let dest_node = db.node_by_id(dest_node.id).await.unwrap();

    let state = test_state(db, Registry::new());

    let group_model = {
        let db = state.database().await.unwrap();
        db.group_by_id(dest_group.id).await.unwrap()
    };
    let mut group = UpdateableGroup::new(&state, group_model).unwrap();

    let node_io = DefaultNodeIO::new(NodeIoCtx {
        state: state.clone(),
        node: dest_node.clone(),
        io_config: serde_json::Value::Null,
    })
    .unwrap();
    group.usable = group.io.set_nodes(vec![node_io]).is_ok();
    group.init_idle = true;

    PullFixture {
        _root: root,
        state,
        group,
        dest_node,
        source,
        file_id: file.id,
    }
}

#[tokio::test]
async fn test_update_pull_cancels_when_already_present() {
    let fx = pull_fixture().await;
    let db = fx.state.database().await.unwrap();

    db.upsert_copy(fx.file_id, fx.dest_node.id, CopyState::Healthy, None)
        .await
        .unwrap();
    db.upsert_copy(fx.file_id, fx.source.id, CopyState::Healthy, None)
        .await
        .unwrap();
    let req = make_copy_request(db, fx.file_id, fx.group.group_id, fx.source.id).await;

    update_pull(&fx.state, &fx.group, req.clone()).await;

    let req = db.copy_request_by_id(req.id).await.unwrap().unwrap();
    assert!(req.cancelled);
    assert!(!req.completed);
    // Nothing was scheduled
    assert_eq!(fx.state.queue.stats().queued, 0);
}

#[tokio::test]
async fn test_update_pull_skips_suspect_destination() {
    let fx = pull_fixture().await;
    let db = fx.state.database().await.unwrap();

    db.upsert_copy(fx.file_id, fx.dest_node.id, CopyState::Suspect, None)
        .await
        .unwrap();
    db.upsert_copy(fx.file_id, fx.source.id, CopyState::Healthy, None)
        .await
        .unwrap();
    let req = make_copy_request(db, fx.file_id, fx.group.group_id, fx.source.id).await;

    update_pull(&fx.state, &fx.group, req.clone()).await;

    // Left pending: the check has to resolve first
    let req = db.copy_request_by_id(req.id).await.unwrap().unwrap();
    assert!(!req.cancelled);
    assert!(!req.completed);
    assert_eq!(fx.state.queue.stats().queued, 0);
}

#[tokio::test]
async fn test_update_pull_cancels_unavailable_source() {
    let fx = pull_fixture().await;
    let db = fx.state.database().await.unwrap();

    // No source copy at all
    let req = make_copy_request(db, fx.file_id, fx.group.group_id, fx.source.id).await;

    update_pull(&fx.state, &fx.group, req.clone()).await;

    let req = db.copy_request_by_id(req.id).await.unwrap().unwrap();
    assert!(req.cancelled);
}

#[tokio::test]
async fn test_update_pull_skips_inactive_source() {
    let fx = pull_fixture().await;
    let db = fx.state.database().await.unwrap();

    db.upsert_copy(fx.file_id, fx.source.id, CopyState::Healthy, None)
        .await
        .unwrap();

    let mut am: crate::database::entity::node::ActiveModel = fx.source.clone().into();
    am.active = Set(false);
    am.update(db).await.unwrap();

    let req = make_copy_request(db, fx.file_id, fx.group.group_id, fx.source.id).await;
    update_pull(&fx.state, &fx.group, req.clone()).await;

    // Skipped, not cancelled: the source may come back
    let req = db.copy_request_by_id(req.id).await.unwrap().unwrap();
    assert!(!req.cancelled);
    assert!(!req.completed);
    assert_eq!(fx.state.queue.stats().queued, 0);
}

#[tokio::test]
async fn test_update_pull_schedules_transfer_task() {
    let fx = pull_fixture().await;
    let db = fx.state.database().await.unwrap();

    db.upsert_copy(fx.file_id, fx.source.id, CopyState::Healthy, None)
        .await
        .unwrap();
    let req = make_copy_request(db, fx.file_id, fx.group.group_id, fx.source.id).await;

    update_pull(&fx.state, &fx.group, req).await;

    // A pull task landed on the destination node's FIFO
    assert_eq!(fx.state.queue.stats().queued, 1);
    assert!(!fx.state.queue.fifo_idle("dest1"));
}

#[tokio::test]
async fn test_update_node_schedules_checks_and_deletes() {
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

    let suspect_file = make_file(&db, "2025/02/21", "suspect.dat").await;
    let released_file = make_file(&db, "2025/02/21", "released.dat").await;
    let feeding_file = make_file(&db, "2025/02/21", "feeding.dat").await;

    db.upsert_copy(suspect_file.id, node.id, CopyState::Suspect, None)
        .await
        .unwrap();
    db.upsert_copy(released_file.id, node.id, CopyState::Released, None)
        .await
        .unwrap();
    db.upsert_copy(feeding_file.id, node.id, CopyState::Released, None)
        .await
        .unwrap();

    // feeding.dat is the source of a pending transfer; its deletion
    // must wait
    let other_group = make_group(&db, "g2").await;
    make_copy_request(&db, feeding_file.id, other_group.id, node.id).await;

    let state = test_state(db, Registry::new());
    let unode = UpdateableNode::new(&state, node).unwrap();

    update_node(&state, &unode).await.unwrap();

    // One check task and one delete batch (without feeding.dat)
    assert_eq!(state.queue.stats().queued, 2);
}

#[tokio::test]
async fn test_node_init_via_request() {
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

    // A node-init request, as written by the CLI
    ImportRequest::insert(import_request::ActiveModel {
        node_id: Set(node.id),
        path: Set(fs::NODE_MARKER.to_string()),
        recurse: Set(false),
        register_new: Set(false),
        completed: Set(false),
        timestamp: Set(Utc::now()),
        ..Default::default()
    })
    .exec(&db)
    .await
    .unwrap();

    let state = test_state(db, Registry::new());
    let unode = UpdateableNode::new(&state, node.clone()).unwrap();

    // Not yet available, but an init task is now queued
    assert!(!check_node_init(&state, &unode.io, true).await);
    assert_eq!(state.queue.stats().queued, 1);

    // Run it
    let pool = WorkerPool::start(1, state.queue.clone());
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while !state.queue.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(check_node_init(&state, &unode.io, true).await);
    assert_eq!(unode.io.fs().read_marker().await.as_deref(), Some("n1"));

    let db = state.database().await.unwrap();
    assert!(db.pending_import_requests(node.id).await.unwrap().is_empty());

    state.queue.shutdown_token().cancel();
    pool.shutdown(std::time::Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_parse_io_config() {
    assert_eq!(parse_io_config(&None).unwrap(), serde_json::Value::Null);

    let parsed = parse_io_config(&Some("{\"quota\": 5}".to_string())).unwrap();
    assert_eq!(parsed["quota"], 5);

    assert!(parse_io_config(&Some("[1, 2]".to_string())).is_err());
    assert!(parse_io_config(&Some("not json".to_string())).is_err());
}
