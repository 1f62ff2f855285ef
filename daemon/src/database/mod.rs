//! The Data Index client.
//!
//! The Index is the sole coordination channel between sites: every daemon
//! and the CLI mutate it concurrently. All mutations here are single-row
//! upserts or updates wrapped in [`with_retry`], and no transaction spans
//! more than one logical unit of work, so crash recovery is bounded by
//! the last committed row.

pub mod entity;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sea_orm::entity::prelude::*;
use sea_orm::query::{JoinType, QueryOrder, QuerySelect};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveValue::Set, DatabaseConnection, FromQueryResult, PaginatorTrait};
use tokio::time;

use crate::error::{DaemonError, DaemonResult};
use alpenhorn::hash::Hash;
use entity::acq::{self, AcqModel, Entity as Acq};
use entity::copy::{self, CopyModel, CopyState, Entity as Copy};
use entity::copy_request::{self, CopyRequestModel, Entity as CopyRequest};
use entity::file::{self, Entity as File, FileModel};
use entity::group::{Entity as Group, GroupModel};
use entity::import_request::{self, Entity as ImportRequest, ImportRequestModel};
use entity::node::{self, Entity as Node, NodeModel, StorageType};
use entity::version::Entity as Version;

/// How many times a transient database failure is retried.
const MAX_DB_ATTEMPTS: u32 = 4;

/// Is this an error worth retrying after a backoff?
///
/// sea-orm surfaces driver errors as strings, so this is a string match
/// on the usual MySQL/SQLite deadlock and lock-wait signatures.
fn is_transient(err: &DbErr) -> bool {
    let msg = err.to_string().to_ascii_lowercase();

    msg.contains("deadlock")
        || msg.contains("lock wait timeout")
        || msg.contains("database is locked")
        || msg.contains("try restarting transaction")
}

/// Runs a database operation, retrying transient failures.
///
/// On a deadlock or lock-wait signal, backs off a uniform random
/// 50-500 ms before retrying, up to [`MAX_DB_ATTEMPTS`] attempts.
pub async fn with_retry<T, F, Fut>(op: F) -> DaemonResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, DbErr>>,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt + 1 < MAX_DB_ATTEMPTS => {
                attempt += 1;
                let backoff = Duration::from_millis(rand::thread_rng().gen_range(50..=500));
                tracing::warn!(
                    "Transient database error (attempt {}): {}. Retrying in {:?}.",
                    attempt,
                    e,
                    backoff
                );
                time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Ranks a copy state for group-level lookups.
///
/// When a file has copies on several nodes of a group, the group-level
/// state is the highest-ranked one.
fn group_state_rank(state: CopyState) -> u8 {
    match state {
        CopyState::Healthy => 5,
        CopyState::Released => 4,
        CopyState::Suspect => 3,
        CopyState::Corrupt => 2,
        CopyState::Missing => 1,
        CopyState::Removed => 0,
    }
}

#[derive(FromQueryResult)]
struct PathRow {
    acq_name: String,
    file_name: String,
}

#[async_trait]
pub trait DataIndex: Send + Sync {
    /// Reads the Data Index schema version.
    async fn schema_version(&self) -> DaemonResult<i32>;

    /// All active nodes whose daemon host is `host`.
    async fn active_nodes(&self, host: &str) -> DaemonResult<Vec<NodeModel>>;

    /// Retrieves a group by ID.
    async fn group_by_id(&self, id: i64) -> DaemonResult<GroupModel>;

    /// Retrieves a node by ID.
    async fn node_by_id(&self, id: i64) -> DaemonResult<NodeModel>;

    /// Retrieves a file along with its acquisition.
    async fn file_with_acq(&self, file_id: i64) -> DaemonResult<(FileModel, AcqModel)>;

    /// Uncompleted import requests for a node, oldest first.
    async fn pending_import_requests(&self, node_id: i64)
        -> DaemonResult<Vec<ImportRequestModel>>;

    /// Is there a pending init request (reserved marker path) for a node?
    async fn pending_init_request(&self, node_id: i64)
        -> DaemonResult<Option<ImportRequestModel>>;

    /// Pending copy requests into a group, oldest first.
    async fn pending_copy_requests_to(&self, group_id: i64)
        -> DaemonResult<Vec<CopyRequestModel>>;

    /// Pending copy requests out of a node, oldest first.
    async fn pending_copy_requests_from(&self, node_id: i64)
        -> DaemonResult<Vec<CopyRequestModel>>;

    /// Is a file the source of any pending copy request from a node?
    async fn has_pending_outbound(&self, file_id: i64, node_id: i64) -> DaemonResult<bool>;

    /// Re-fetches a copy request.
    async fn copy_request_by_id(&self, id: i64) -> DaemonResult<Option<CopyRequestModel>>;

    /// Copies on a node in a given state, oldest-updated first.
    async fn copies_in_state(
        &self,
        node_id: i64,
        state: CopyState,
        limit: Option<u64>,
    ) -> DaemonResult<Vec<CopyModel>>;

    /// Retrieves the copy row for (file, node), if any.
    async fn copy_for(&self, file_id: i64, node_id: i64) -> DaemonResult<Option<CopyModel>>;

    /// The state of a file on a node. [`CopyState::Removed`] if untracked.
    async fn copy_state(&self, file_id: i64, node_id: i64) -> DaemonResult<CopyState>;

    /// The best state of a file across the nodes of a group.
    async fn group_copy_state(&self, file_id: i64, group_id: i64) -> DaemonResult<CopyState>;

    /// Counts healthy copies of a file on archive nodes other than `node_id`.
    async fn archive_copy_count_excluding(
        &self,
        file_id: i64,
        node_id: i64,
    ) -> DaemonResult<u64>;

    /// The relative paths of all copies believed on-disk on a node.
    async fn tracked_paths(&self, node_id: i64) -> DaemonResult<HashSet<String>>;

    /// Finds a registered file by acquisition and file name.
    async fn find_file(
        &self,
        acq_name: &str,
        file_name: &str,
    ) -> DaemonResult<Option<(FileModel, AcqModel)>>;

    /// Finds or registers an acquisition.
    async fn get_or_create_acq(&self, name: &str) -> DaemonResult<AcqModel>;

    /// Finds or registers a file.
    ///
    /// An existing registration with a different size or hash is never
    /// overwritten; that's a [`DaemonError::RegistrationConflict`].
    async fn get_or_create_file(
        &self,
        acq: &AcqModel,
        name: &str,
        size_b: i64,
        md5sum: &Hash,
    ) -> DaemonResult<FileModel>;

    /// Creates or updates the copy row for (file, node).
    async fn upsert_copy(
        &self,
        file_id: i64,
        node_id: i64,
        state: CopyState,
        size_b: Option<i64>,
    ) -> DaemonResult<CopyModel>;

    /// Updates the state of a copy row.
    ///
    /// `checked` also stamps `last_check`, for state changes produced by
    /// a verification pass.
    async fn set_copy_state(
        &self,
        copy_id: i64,
        state: CopyState,
        size_b: Option<i64>,
        checked: bool,
    ) -> DaemonResult<()>;

    /// Marks an import request completed.
    ///
    /// Returns false if some other worker completed it first.
    async fn complete_import_request(&self, id: i64) -> DaemonResult<bool>;

    /// Stamps a copy request's transfer start time.
    async fn start_copy_request(&self, id: i64) -> DaemonResult<()>;

    /// Marks a copy request completed.
    async fn complete_copy_request(&self, id: i64) -> DaemonResult<()>;

    /// Marks a copy request cancelled.
    async fn cancel_copy_request(&self, id: i64) -> DaemonResult<()>;

    /// Records a node's measured free space.
    async fn update_avail_bytes(&self, node_id: i64, bytes: Option<u64>) -> DaemonResult<()>;

    /// Sums the logical size of healthy copies on a node.
    async fn total_bytes_on_node(&self, node_id: i64) -> DaemonResult<u64>;

    /// Healthy copies on a node not verified since `cutoff`, oldest first.
    async fn auto_verify_candidates(
        &self,
        node_id: i64,
        cutoff: chrono::DateTime<Utc>,
        limit: u64,
    ) -> DaemonResult<Vec<CopyModel>>;
}

#[async_trait]
impl DataIndex for DatabaseConnection {
    async fn schema_version(&self) -> DaemonResult<i32> {
        let row = Version::find()
            .one(self)
            .await?
            .ok_or_else(|| DaemonError::SchemaVersionMismatch {
                found: 0,
                required: entity::SCHEMA_VERSION,
            })?;

        Ok(row.ver)
    }

    async fn active_nodes(&self, host: &str) -> DaemonResult<Vec<NodeModel>> {
        let nodes = Node::find()
            .filter(node::Column::Host.eq(host))
            .filter(node::Column::Active.eq(true))
            .all(self)
            .await?;

        Ok(nodes)
    }

    async fn group_by_id(&self, id: i64) -> DaemonResult<GroupModel> {
        Group::find_by_id(id)
            .one(self)
            .await?
            .ok_or(DaemonError::NoSuchGroup)
    }

    async fn node_by_id(&self, id: i64) -> DaemonResult<NodeModel> {
        Node::find_by_id(id)
            .one(self)
            .await?
            .ok_or(DaemonError::NoSuchNode)
    }

    async fn file_with_acq(&self, file_id: i64) -> DaemonResult<(FileModel, AcqModel)> {
        let file = File::find_by_id(file_id)
            .one(self)
            .await?
            .ok_or_else(|| DaemonError::DatabaseError(anyhow::anyhow!("no file {}", file_id)))?;

        let acq = Acq::find_by_id(file.acq_id)
            .one(self)
            .await?
            .ok_or_else(|| {
                DaemonError::DatabaseError(anyhow::anyhow!("no acq {}", file.acq_id))
            })?;

        Ok((file, acq))
    }

    async fn pending_import_requests(
        &self,
        node_id: i64,
    ) -> DaemonResult<Vec<ImportRequestModel>> {
        let reqs = ImportRequest::find()
            .filter(import_request::Column::NodeId.eq(node_id))
            .filter(import_request::Column::Completed.eq(false))
            .order_by_asc(import_request::Column::Id)
            .all(self)
            .await?;

        Ok(reqs)
    }

    async fn pending_init_request(
        &self,
        node_id: i64,
    ) -> DaemonResult<Option<ImportRequestModel>> {
        let req = ImportRequest::find()
            .filter(import_request::Column::NodeId.eq(node_id))
            .filter(import_request::Column::Path.eq(crate::fs::NODE_MARKER))
            .filter(import_request::Column::Completed.eq(false))
            .one(self)
            .await?;

        Ok(req)
    }

    async fn pending_copy_requests_to(
        &self,
        group_id: i64,
    ) -> DaemonResult<Vec<CopyRequestModel>> {
        let reqs = CopyRequest::find()
            .filter(copy_request::Column::GroupToId.eq(group_id))
            .filter(copy_request::Column::Completed.eq(false))
            .filter(copy_request::Column::Cancelled.eq(false))
            .order_by_asc(copy_request::Column::Id)
            .all(self)
            .await?;

        Ok(reqs)
    }

    async fn pending_copy_requests_from(
        &self,
        node_id: i64,
    ) -> DaemonResult<Vec<CopyRequestModel>> {
        let reqs = CopyRequest::find()
            .filter(copy_request::Column::NodeFromId.eq(node_id))
            .filter(copy_request::Column::Completed.eq(false))
            .filter(copy_request::Column::Cancelled.eq(false))
            .order_by_asc(copy_request::Column::Id)
            .all(self)
            .await?;

        Ok(reqs)
    }

    async fn has_pending_outbound(&self, file_id: i64, node_id: i64) -> DaemonResult<bool> {
        let count = CopyRequest::find()
            .filter(copy_request::Column::FileId.eq(file_id))
            .filter(copy_request::Column::NodeFromId.eq(node_id))
            .filter(copy_request::Column::Completed.eq(false))
            .filter(copy_request::Column::Cancelled.eq(false))
            .count(self)
            .await?;

        Ok(count > 0)
    }

    async fn copy_request_by_id(&self, id: i64) -> DaemonResult<Option<CopyRequestModel>> {
        Ok(CopyRequest::find_by_id(id).one(self).await?)
    }

    async fn copies_in_state(
        &self,
        node_id: i64,
        state: CopyState,
        limit: Option<u64>,
    ) -> DaemonResult<Vec<CopyModel>> {
        let mut query = Copy::find()
            .filter(copy::Column::NodeId.eq(node_id))
            .filter(copy::Column::State.eq(state))
            .order_by_asc(copy::Column::LastUpdate);

        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        Ok(query.all(self).await?)
    }

    async fn copy_for(&self, file_id: i64, node_id: i64) -> DaemonResult<Option<CopyModel>> {
        let copy = Copy::find()
            .filter(copy::Column::FileId.eq(file_id))
            .filter(copy::Column::NodeId.eq(node_id))
            .one(self)
            .await?;

        Ok(copy)
    }

    async fn copy_state(&self, file_id: i64, node_id: i64) -> DaemonResult<CopyState> {
        Ok(self
            .copy_for(file_id, node_id)
            .await?
            .map(|c| c.state)
            .unwrap_or(CopyState::Removed))
    }

    async fn group_copy_state(&self, file_id: i64, group_id: i64) -> DaemonResult<CopyState> {
        let copies: Vec<CopyModel> = Copy::find()
            .join(JoinType::InnerJoin, copy::Relation::Node.def())
            .filter(copy::Column::FileId.eq(file_id))
            .filter(node::Column::GroupId.eq(group_id))
            .all(self)
            .await?;

        Ok(copies
            .into_iter()
            .map(|c| c.state)
            .max_by_key(|s| group_state_rank(*s))
            .unwrap_or(CopyState::Removed))
    }

    async fn archive_copy_count_excluding(
        &self,
        file_id: i64,
        node_id: i64,
    ) -> DaemonResult<u64> {
        let count = Copy::find()
            .join(JoinType::InnerJoin, copy::Relation::Node.def())
            .filter(copy::Column::FileId.eq(file_id))
            .filter(copy::Column::State.eq(CopyState::Healthy))
            .filter(copy::Column::NodeId.ne(node_id))
            .filter(node::Column::StorageType.eq(StorageType::Archive))
            .count(self)
            .await?;

        Ok(count)
    }

    async fn tracked_paths(&self, node_id: i64) -> DaemonResult<HashSet<String>> {
        let rows = Copy::find()
            .select_only()
            .column_as(acq::Column::Name, "acq_name")
            .column_as(file::Column::Name, "file_name")
            .join(JoinType::InnerJoin, copy::Relation::File.def())
            .join(JoinType::InnerJoin, file::Relation::Acq.def())
            .filter(copy::Column::NodeId.eq(node_id))
            .filter(copy::Column::HasFile.eq(true))
            .into_model::<PathRow>()
            .all(self)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| format!("{}/{}", r.acq_name, r.file_name))
            .collect())
    }

    async fn find_file(
        &self,
        acq_name: &str,
        file_name: &str,
    ) -> DaemonResult<Option<(FileModel, AcqModel)>> {
        let Some(acq) = Acq::find()
            .filter(acq::Column::Name.eq(acq_name))
            .one(self)
            .await?
        else {
            return Ok(None);
        };

        let file = File::find()
            .filter(file::Column::AcqId.eq(acq.id))
            .filter(file::Column::Name.eq(file_name))
            .one(self)
            .await?;

        Ok(file.map(|file| (file, acq)))
    }

    async fn get_or_create_acq(&self, name: &str) -> DaemonResult<AcqModel> {
        with_retry(|| async {
            if let Some(acq) = Acq::find()
                .filter(acq::Column::Name.eq(name))
                .one(self)
                .await?
            {
                return Ok(acq);
            }

            let insert = Acq::insert(acq::ActiveModel {
                name: Set(name.to_owned()),
                ..Default::default()
            })
            .exec(self)
            .await;

            match insert {
                Ok(res) => Acq::find_by_id(res.last_insert_id)
                    .one(self)
                    .await?
                    .ok_or_else(|| DbErr::RecordNotFound(format!("acq {}", name))),
                // Lost the race to another importer; theirs is as good as ours
                Err(_) => Acq::find()
                    .filter(acq::Column::Name.eq(name))
                    .one(self)
                    .await?
                    .ok_or_else(|| DbErr::RecordNotFound(format!("acq {}", name))),
            }
        })
        .await
    }

    async fn get_or_create_file(
        &self,
        acq: &AcqModel,
        name: &str,
        size_b: i64,
        md5sum: &Hash,
    ) -> DaemonResult<FileModel> {
        let find = || async {
            File::find()
                .filter(file::Column::AcqId.eq(acq.id))
                .filter(file::Column::Name.eq(name))
                .one(self)
                .await
        };

        let file = with_retry(|| async {
            if let Some(file) = find().await? {
                return Ok(file);
            }

            let insert = File::insert(file::ActiveModel {
                acq_id: Set(acq.id),
                name: Set(name.to_owned()),
                size_b: Set(size_b),
                md5sum: Set(md5sum.to_hex()),
                registered: Set(Utc::now()),
                ..Default::default()
            })
            .exec(self)
            .await;

            match insert {
                Ok(res) => File::find_by_id(res.last_insert_id)
                    .one(self)
                    .await?
                    .ok_or_else(|| DbErr::RecordNotFound(format!("file {}", name))),
                Err(_) => find()
                    .await?
                    .ok_or_else(|| DbErr::RecordNotFound(format!("file {}", name))),
            }
        })
        .await?;

        if file.size_b != size_b || file.md5sum != md5sum.to_hex() {
            return Err(DaemonError::RegistrationConflict {
                path: format!("{}/{}", acq.name, name),
            });
        }

        Ok(file)
    }

    async fn upsert_copy(
        &self,
        file_id: i64,
        node_id: i64,
        state: CopyState,
        size_b: Option<i64>,
    ) -> DaemonResult<CopyModel> {
        with_retry(|| async {
            if let Some(existing) = Copy::find()
                .filter(copy::Column::FileId.eq(file_id))
                .filter(copy::Column::NodeId.eq(node_id))
                .one(self)
                .await?
            {
                let mut am: copy::ActiveModel = existing.into();
                am.state = Set(state);
                am.has_file = Set(state.on_disk());
                if size_b.is_some() {
                    am.size_b = Set(size_b);
                }
                am.last_update = Set(Utc::now());
                return am.update(self).await;
            }

            let insert = Copy::insert(copy::ActiveModel {
                file_id: Set(file_id),
                node_id: Set(node_id),
                state: Set(state),
                has_file: Set(state.on_disk()),
                size_b: Set(size_b),
                last_update: Set(Utc::now()),
                ..Default::default()
            })
            .exec(self)
            .await;

            match insert {
                Ok(res) => Copy::find_by_id(res.last_insert_id)
                    .one(self)
                    .await?
                    .ok_or_else(|| {
                        DbErr::RecordNotFound(format!("copy ({}, {})", file_id, node_id))
                    }),
                // (file, node) is unique: another worker beat us to it
                Err(_) => Copy::find()
                    .filter(copy::Column::FileId.eq(file_id))
                    .filter(copy::Column::NodeId.eq(node_id))
                    .one(self)
                    .await?
                    .ok_or_else(|| {
                        DbErr::RecordNotFound(format!("copy ({}, {})", file_id, node_id))
                    }),
            }
        })
        .await
    }

    async fn set_copy_state(
        &self,
        copy_id: i64,
        state: CopyState,
        size_b: Option<i64>,
        checked: bool,
    ) -> DaemonResult<()> {
        with_retry(|| async {
            let mut am = copy::ActiveModel {
                id: Set(copy_id),
                state: Set(state),
                has_file: Set(state.on_disk()),
                last_update: Set(Utc::now()),
                ..Default::default()
            };
            if size_b.is_some() {
                am.size_b = Set(size_b);
            }
            if checked {
                am.last_check = Set(Some(Utc::now()));
            }

            am.update(self).await.map(|_| ())
        })
        .await
    }

    async fn complete_import_request(&self, id: i64) -> DaemonResult<bool> {
        let result = with_retry(|| async {
            ImportRequest::update_many()
                .col_expr(import_request::Column::Completed, Expr::value(true))
                .filter(import_request::Column::Id.eq(id))
                .filter(import_request::Column::Completed.eq(false))
                .exec(self)
                .await
        })
        .await?;

        Ok(result.rows_affected > 0)
    }

    async fn start_copy_request(&self, id: i64) -> DaemonResult<()> {
        with_retry(|| async {
            CopyRequest::update_many()
                .col_expr(
                    copy_request::Column::TransferStarted,
                    Expr::value(Some(Utc::now())),
                )
                .filter(copy_request::Column::Id.eq(id))
                .exec(self)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn complete_copy_request(&self, id: i64) -> DaemonResult<()> {
        with_retry(|| async {
            CopyRequest::update_many()
                .col_expr(copy_request::Column::Completed, Expr::value(true))
                .col_expr(
                    copy_request::Column::TransferCompleted,
                    Expr::value(Some(Utc::now())),
                )
                .filter(copy_request::Column::Id.eq(id))
                .exec(self)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn cancel_copy_request(&self, id: i64) -> DaemonResult<()> {
        with_retry(|| async {
            CopyRequest::update_many()
                .col_expr(copy_request::Column::Cancelled, Expr::value(true))
                .filter(copy_request::Column::Id.eq(id))
                .exec(self)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn update_avail_bytes(&self, node_id: i64, bytes: Option<u64>) -> DaemonResult<()> {
        let avail_gb = bytes.map(|b| b as f64 / f64::powi(2.0, 30));

        with_retry(|| async {
            let mut am = node::ActiveModel {
                id: Set(node_id),
                last_checked: Set(Some(Utc::now())),
                ..Default::default()
            };
            if avail_gb.is_some() {
                am.avail_gb = Set(avail_gb);
            }

            am.update(self).await.map(|_| ())
        })
        .await
    }

    async fn total_bytes_on_node(&self, node_id: i64) -> DaemonResult<u64> {
        #[derive(FromQueryResult)]
        struct TotalRow {
            total: Option<i64>,
        }

        let row = Copy::find()
            .select_only()
            .column_as(file::Column::SizeB.sum(), "total")
            .join(JoinType::InnerJoin, copy::Relation::File.def())
            .filter(copy::Column::NodeId.eq(node_id))
            .filter(copy::Column::State.eq(CopyState::Healthy))
            .into_model::<TotalRow>()
            .one(self)
            .await?;

        Ok(row.and_then(|r| r.total).unwrap_or(0).max(0) as u64)
    }

    async fn auto_verify_candidates(
        &self,
        node_id: i64,
        cutoff: chrono::DateTime<Utc>,
        limit: u64,
    ) -> DaemonResult<Vec<CopyModel>> {
        let copies = Copy::find()
            .filter(copy::Column::NodeId.eq(node_id))
            .filter(copy::Column::State.eq(CopyState::Healthy))
            .filter(
                copy::Column::LastCheck
                    .is_null()
                    .or(copy::Column::LastCheck.lt(cutoff)),
            )
            .order_by_asc(copy::Column::LastCheck)
            .limit(limit)
            .all(self)
            .await?;

        Ok(copies)
    }
}

#[cfg(test)]
mod tests;
