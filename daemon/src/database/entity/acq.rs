//! An acquisition: a logical bundle of related files.
//!
//! Acquisitions are identified by a path prefix (e.g. `2025/02/21`) and
//! are immutable once created. Extensions may attach per-acquisition
//! attributes in side tables of their own.

use sea_orm::entity::prelude::*;

pub type AcqModel = Model;

/// An acquisition.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "acq")]
pub struct Model {
    /// Unique numeric ID of the acquisition.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Unique name: the path prefix shared by the acquisition's files.
    #[sea_orm(unique, indexed)]
    pub name: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file::Entity")]
    File,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
