use super::*;

use crate::testing::{make_file, make_group, make_node, test_index};

use entity::SCHEMA_VERSION;

#[tokio::test]
async fn test_schema_version() {
    let db = test_index().await;
    assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
}

#[tokio::test]
async fn test_active_nodes_filters_host() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let n1 = make_node(&db, "n1", &group, StorageType::Archive).await;

    let other = node::ActiveModel {
        name: Set("elsewhere".to_owned()),
        group_id: Set(group.id),
        host: Set(Some("otherhost".to_owned())),
        active: Set(true),
        storage_type: Set(StorageType::Field),
        auto_import: Set(false),
        auto_verify: Set(0),
        root: Set(Some("/data/elsewhere".to_owned())),
        min_avail_gb: Set(0.0),
        ..Default::default()
    };
    Node::insert(other).exec(&db).await.unwrap();

    let nodes = db.active_nodes("testhost").await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, n1.id);

    assert_eq!(db.active_nodes("nowhere").await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_get_or_create_acq_is_idempotent() {
    let db = test_index().await;

    let a = db.get_or_create_acq("2025/02/21").await.unwrap();
    let b = db.get_or_create_acq("2025/02/21").await.unwrap();
    assert_eq!(a.id, b.id);

    assert_eq!(Acq::find().count(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn test_get_or_create_file_conflict() {
    let db = test_index().await;
    let acq = db.get_or_create_acq("2025/02/21").await.unwrap();

    let hash = Hash::md5_from_bytes(b"hello world");
    let f = db
        .get_or_create_file(&acq, "meta.txt", 52, &hash)
        .await
        .unwrap();

    // Same registration converges
    let again = db
        .get_or_create_file(&acq, "meta.txt", 52, &hash)
        .await
        .unwrap();
    assert_eq!(f.id, again.id);

    // Differing size is a conflict, not an overwrite
    let conflict = db.get_or_create_file(&acq, "meta.txt", 53, &hash).await;
    assert!(matches!(
        conflict,
        Err(DaemonError::RegistrationConflict { .. })
    ));

    // Differing hash too
    let other_hash = Hash::md5_from_bytes(b"other bytes");
    let conflict = db
        .get_or_create_file(&acq, "meta.txt", 52, &other_hash)
        .await;
    assert!(matches!(
        conflict,
        Err(DaemonError::RegistrationConflict { .. })
    ));
}

#[tokio::test]
async fn test_upsert_copy_and_state() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let node = make_node(&db, "n1", &group, StorageType::Archive).await;
    let file = make_file(&db, "2025/02/21", "meta.txt").await;

    assert_eq!(
        db.copy_state(file.id, node.id).await.unwrap(),
        CopyState::Removed
    );

    let copy = db
        .upsert_copy(file.id, node.id, CopyState::Suspect, Some(52))
        .await
        .unwrap();
    assert_eq!(copy.state, CopyState::Suspect);
    assert!(copy.has_file);
    assert!(copy.last_check.is_none());

    // Upserting again updates the same row
    let copy2 = db
        .upsert_copy(file.id, node.id, CopyState::Healthy, None)
        .await
        .unwrap();
    assert_eq!(copy2.id, copy.id);
    assert_eq!(copy2.state, CopyState::Healthy);
    assert_eq!(copy2.size_b, Some(52));

    db.set_copy_state(copy.id, CopyState::Corrupt, None, true)
        .await
        .unwrap();
    let copy3 = db.copy_for(file.id, node.id).await.unwrap().unwrap();
    assert_eq!(copy3.state, CopyState::Corrupt);
    assert!(copy3.has_file);
    assert!(copy3.last_check.is_some());

    db.set_copy_state(copy.id, CopyState::Removed, None, false)
        .await
        .unwrap();
    let copy4 = db.copy_for(file.id, node.id).await.unwrap().unwrap();
    assert!(!copy4.has_file);
}

#[tokio::test]
async fn test_archive_copy_count_excluding() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let field = make_node(&db, "field", &group, StorageType::Field).await;
    let arch1 = make_node(&db, "arch1", &group, StorageType::Archive).await;
    let arch2 = make_node(&db, "arch2", &group, StorageType::Archive).await;
    let file = make_file(&db, "2025/02/21", "meta.txt").await;

    db.upsert_copy(file.id, field.id, CopyState::Healthy, Some(52))
        .await
        .unwrap();
    db.upsert_copy(file.id, arch1.id, CopyState::Healthy, Some(52))
        .await
        .unwrap();

    // One archive copy elsewhere: not enough to delete from `field`
    assert_eq!(
        db.archive_copy_count_excluding(file.id, field.id)
            .await
            .unwrap(),
        1
    );

    // A suspect archive copy doesn't count
    db.upsert_copy(file.id, arch2.id, CopyState::Suspect, Some(52))
        .await
        .unwrap();
    assert_eq!(
        db.archive_copy_count_excluding(file.id, field.id)
            .await
            .unwrap(),
        1
    );

    db.upsert_copy(file.id, arch2.id, CopyState::Healthy, Some(52))
        .await
        .unwrap();
    assert_eq!(
        db.archive_copy_count_excluding(file.id, field.id)
            .await
            .unwrap(),
        2
    );

    // The excluded node's own copy never counts
    assert_eq!(
        db.archive_copy_count_excluding(file.id, arch1.id)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_group_copy_state_ranking() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let n1 = make_node(&db, "n1", &group, StorageType::Archive).await;
    let n2 = make_node(&db, "n2", &group, StorageType::Archive).await;
    let file = make_file(&db, "2025/02/21", "meta.txt").await;

    assert_eq!(
        db.group_copy_state(file.id, group.id).await.unwrap(),
        CopyState::Removed
    );

    db.upsert_copy(file.id, n1.id, CopyState::Corrupt, None)
        .await
        .unwrap();
    assert_eq!(
        db.group_copy_state(file.id, group.id).await.unwrap(),
        CopyState::Corrupt
    );

    // A healthy copy on any node wins
    db.upsert_copy(file.id, n2.id, CopyState::Healthy, None)
        .await
        .unwrap();
    assert_eq!(
        db.group_copy_state(file.id, group.id).await.unwrap(),
        CopyState::Healthy
    );
}

#[tokio::test]
async fn test_tracked_paths() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let node = make_node(&db, "n1", &group, StorageType::Archive).await;

    let f1 = make_file(&db, "2025/02/21", "meta.txt").await;
    let f2 = make_file(&db, "2025/02/22", "data.bin").await;
    let f3 = make_file(&db, "2025/02/22", "gone.bin").await;

    db.upsert_copy(f1.id, node.id, CopyState::Healthy, None)
        .await
        .unwrap();
    db.upsert_copy(f2.id, node.id, CopyState::Suspect, None)
        .await
        .unwrap();
    db.upsert_copy(f3.id, node.id, CopyState::Removed, None)
        .await
        .unwrap();

    let paths = db.tracked_paths(node.id).await.unwrap();
    assert!(paths.contains("2025/02/21/meta.txt"));
    assert!(paths.contains("2025/02/22/data.bin"));
    assert!(!paths.contains("2025/02/22/gone.bin"));
}

#[tokio::test]
async fn test_import_request_completion_is_once() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let node = make_node(&db, "n1", &group, StorageType::Archive).await;

    let res = ImportRequest::insert(import_request::ActiveModel {
        node_id: Set(node.id),
        path: Set("2025/02/21/meta.txt".to_owned()),
        recurse: Set(false),
        register_new: Set(true),
        completed: Set(false),
        timestamp: Set(Utc::now()),
        ..Default::default()
    })
    .exec(&db)
    .await
    .unwrap();

    let pending = db.pending_import_requests(node.id).await.unwrap();
    assert_eq!(pending.len(), 1);

    assert!(db
        .complete_import_request(res.last_insert_id)
        .await
        .unwrap());
    // A second completion reports that someone else got there first
    assert!(!db
        .complete_import_request(res.last_insert_id)
        .await
        .unwrap());

    assert!(db.pending_import_requests(node.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_copy_request_lifecycle() {
    let db = test_index().await;
    let g1 = make_group(&db, "g1").await;
    let g2 = make_group(&db, "g2").await;
    let n1 = make_node(&db, "n1", &g1, StorageType::Archive).await;
    let file = make_file(&db, "2025/02/21", "meta.txt").await;

    let res = CopyRequest::insert(copy_request::ActiveModel {
        file_id: Set(file.id),
        group_to_id: Set(g2.id),
        node_from_id: Set(n1.id),
        completed: Set(false),
        cancelled: Set(false),
        timestamp: Set(Utc::now()),
        n_requests: Set(1),
        ..Default::default()
    })
    .exec(&db)
    .await
    .unwrap();
    let req_id = res.last_insert_id;

    assert_eq!(db.pending_copy_requests_to(g2.id).await.unwrap().len(), 1);
    assert_eq!(db.pending_copy_requests_from(n1.id).await.unwrap().len(), 1);
    assert!(db.has_pending_outbound(file.id, n1.id).await.unwrap());

    db.start_copy_request(req_id).await.unwrap();
    db.complete_copy_request(req_id).await.unwrap();

    assert!(db.pending_copy_requests_to(g2.id).await.unwrap().is_empty());
    assert!(!db.has_pending_outbound(file.id, n1.id).await.unwrap());

    let req = CopyRequest::find_by_id(req_id).one(&db).await.unwrap().unwrap();
    assert!(req.completed);
    assert!(req.transfer_started.is_some());
    assert!(req.transfer_completed.is_some());
}

#[tokio::test]
async fn test_update_avail_bytes() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let node = make_node(&db, "n1", &group, StorageType::Archive).await;

    db.update_avail_bytes(node.id, Some(3 << 30)).await.unwrap();

    let node = db.node_by_id(node.id).await.unwrap();
    assert_eq!(node.avail_gb, Some(3.0));
    assert!(node.last_checked.is_some());

    // Unknown free space keeps the last value but stamps the check time
    db.update_avail_bytes(node.id, None).await.unwrap();
    let node = db.node_by_id(node.id).await.unwrap();
    assert_eq!(node.avail_gb, Some(3.0));
}

#[tokio::test]
async fn test_total_bytes_on_node() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let node = make_node(&db, "n1", &group, StorageType::Archive).await;
    let f1 = make_file(&db, "2025/02/21", "meta.txt").await;
    let f2 = make_file(&db, "2025/02/21", "more.txt").await;

    db.upsert_copy(f1.id, node.id, CopyState::Healthy, Some(52))
        .await
        .unwrap();
    db.upsert_copy(f2.id, node.id, CopyState::Suspect, Some(52))
        .await
        .unwrap();

    // Only healthy copies count toward the total
    assert_eq!(db.total_bytes_on_node(node.id).await.unwrap(), 11);
}

#[tokio::test]
async fn test_copies_in_state_limit() {
    let db = test_index().await;
    let group = make_group(&db, "g1").await;
    let node = make_node(&db, "n1", &group, StorageType::Archive).await;

    for i in 0..5 {
        let f = make_file(&db, "2025/02/21", &format!("f{}.dat", i)).await;
        db.upsert_copy(f.id, node.id, CopyState::Suspect, None)
            .await
            .unwrap();
    }

    let all = db
        .copies_in_state(node.id, CopyState::Suspect, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 5);

    let capped = db
        .copies_in_state(node.id, CopyState::Suspect, Some(2))
        .await
        .unwrap();
    assert_eq!(capped.len(), 2);
}
