//! A named collection of storage nodes.
//!
//! Groups are the destination unit for transfers: a copy request names a
//! destination group, and the daemon managing that group picks the node.

use sea_orm::entity::prelude::*;

pub type GroupModel = Model;

/// A storage group.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "storage_group")]
pub struct Model {
    /// Unique numeric ID of the group.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Unique name of the group.
    #[sea_orm(column_type = "String(Some(64))", unique, indexed)]
    pub name: String,

    /// Name of the group I/O class. `None` means "Default".
    pub io_class: Option<String>,

    /// Free-form notes about this group.
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,

    /// JSON blob of configuration interpreted by the I/O class.
    #[sea_orm(column_type = "Text", nullable)]
    pub io_config: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::node::Entity")]
    Node,
}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Node.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
