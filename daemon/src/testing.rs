//! Shared test fixtures.

use sea_orm::{
    ActiveValue::Set, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, Schema,
};
use tokio_util::sync::CancellationToken;

use crate::config::load_config_from_str;
use crate::database::entity::acq::Entity as Acq;
use crate::database::entity::copy::Entity as Copy;
use crate::database::entity::copy_request::Entity as CopyRequest;
use crate::database::entity::file::{Entity as File, FileModel};
use crate::database::entity::group::{self, Entity as Group, GroupModel};
use crate::database::entity::import_request::Entity as ImportRequest;
use crate::database::entity::node::{self, Entity as Node, NodeModel, StorageType};
use crate::database::entity::version::{self, Entity as Version};
use crate::database::entity::SCHEMA_VERSION;
use crate::database::DataIndex;
use crate::extensions::Registry;
use crate::{State, StateInner};
use alpenhorn::hash::Hash;

/// The hostname test nodes live on.
pub(crate) const TEST_HOST: &str = "testhost";

/// Builds an in-memory Data Index with the full schema.
pub(crate) async fn test_index() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:".to_owned());
    // One pooled connection, or every query gets its own empty database
    options.max_connections(1);

    let db = Database::connect(options).await.unwrap();
    let schema = Schema::new(DbBackend::Sqlite);
    let backend = db.get_database_backend();

    db.execute(backend.build(&schema.create_table_from_entity(Group)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(Node)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(Acq)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(File)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(Copy)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(ImportRequest)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(CopyRequest)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(Version)))
        .await
        .unwrap();

    Version::insert(version::ActiveModel {
        ver: Set(SCHEMA_VERSION),
    })
    .exec(&db)
    .await
    .unwrap();

    db
}

/// Builds a daemon state around an existing test index.
pub(crate) fn test_state(db: DatabaseConnection, registry: Registry) -> State {
    test_state_with_config(
        db,
        registry,
        &format!(
            "database:\n  url: \"sqlite::memory:\"\ndaemon:\n  hostname: {}\n",
            TEST_HOST
        ),
    )
}

/// Builds a daemon state with a custom configuration.
pub(crate) fn test_state_with_config(
    db: DatabaseConnection,
    registry: Registry,
    config_yaml: &str,
) -> State {
    let config = load_config_from_str(config_yaml).unwrap();

    let state = StateInner::new(config, registry, CancellationToken::new());
    state.provide_database(db);
    state
}

pub(crate) async fn make_group(db: &DatabaseConnection, name: &str) -> GroupModel {
    let res = Group::insert(group::ActiveModel {
        name: Set(name.to_owned()),
        ..Default::default()
    })
    .exec(db)
    .await
    .unwrap();

    db.group_by_id(res.last_insert_id).await.unwrap()
}

pub(crate) async fn make_node_at(
    db: &DatabaseConnection,
    name: &str,
    group: &GroupModel,
    storage_type: StorageType,
    root: &str,
) -> NodeModel {
    let res = Node::insert(node::ActiveModel {
        name: Set(name.to_owned()),
        group_id: Set(group.id),
        host: Set(Some(TEST_HOST.to_owned())),
        active: Set(true),
        storage_type: Set(storage_type),
        auto_import: Set(false),
        auto_verify: Set(0),
        root: Set(Some(root.to_owned())),
        min_avail_gb: Set(0.0),
        ..Default::default()
    })
    .exec(db)
    .await
    .unwrap();

    db.node_by_id(res.last_insert_id).await.unwrap()
}

pub(crate) async fn make_node(
    db: &DatabaseConnection,
    name: &str,
    group: &GroupModel,
    storage_type: StorageType,
) -> NodeModel {
    make_node_at(db, name, group, storage_type, &format!("/data/{}", name)).await
}

pub(crate) async fn make_file(
    db: &DatabaseConnection,
    acq_name: &str,
    name: &str,
) -> FileModel {
    let acq = db.get_or_create_acq(acq_name).await.unwrap();
    db.get_or_create_file(&acq, name, 11, &Hash::md5_from_bytes(b"hello world"))
        .await
        .unwrap()
}
