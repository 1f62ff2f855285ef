//! A request for a node to import a path.
//!
//! Node initialization is modeled as an import request whose path is the
//! reserved marker name `ALPENHORN_NODE`.

use sea_orm::entity::prelude::*;

pub type ImportRequestModel = Model;

/// An import request.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "importrequest")]
pub struct Model {
    /// Unique numeric ID of the request.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the node asked to import.
    #[sea_orm(indexed)]
    pub node_id: i64,

    /// The path to import, relative to the node root.
    pub path: String,

    /// If set, `path` is a directory to scan rather than a single file.
    pub recurse: bool,

    /// Should files without existing registrations be registered?
    pub register_new: bool,

    /// Set once the request has been handled.
    pub completed: bool,

    /// When the request was made.
    pub timestamp: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::node::Entity",
        from = "Column::NodeId",
        to = "super::node::Column::Id"
    )]
    Node,
}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Node.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
