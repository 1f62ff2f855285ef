//! A request to copy a file from a node into a group.

use sea_orm::entity::prelude::*;

pub type CopyRequestModel = Model;

/// A copy request.
///
/// The request is satisfied when, and only when, a copy of the file on
/// some node of the destination group becomes healthy. Requests are
/// append-only: they are marked completed or cancelled, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "copyrequest")]
pub struct Model {
    /// Unique numeric ID of the request.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the file to copy.
    #[sea_orm(indexed)]
    pub file_id: i64,

    /// ID of the destination group.
    #[sea_orm(indexed)]
    pub group_to_id: i64,

    /// ID of the source node.
    #[sea_orm(indexed)]
    pub node_from_id: i64,

    /// Set when the copy has succeeded.
    pub completed: bool,

    /// Set when the copy is no longer wanted.
    pub cancelled: bool,

    /// When the request was made.
    pub timestamp: ChronoDateTimeUtc,

    /// How many times this transfer has been requested.
    ///
    /// Incremented by the CLI when re-issuing an existing request; the
    /// daemon only reads it.
    pub n_requests: i32,

    /// When the transfer was started.
    #[sea_orm(nullable)]
    pub transfer_started: Option<ChronoDateTimeUtc>,

    /// When the transfer was completed.
    #[sea_orm(nullable)]
    pub transfer_completed: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::file::Entity",
        from = "Column::FileId",
        to = "super::file::Column::Id"
    )]
    File,

    #[sea_orm(
        belongs_to = "super::group::Entity",
        from = "Column::GroupToId",
        to = "super::group::Column::Id"
    )]
    GroupTo,

    #[sea_orm(
        belongs_to = "super::node::Entity",
        from = "Column::NodeFromId",
        to = "super::node::Column::Id"
    )]
    NodeFrom,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::GroupTo.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
