//! The Data Index schema version marker.

use sea_orm::entity::prelude::*;

pub type VersionModel = Model;

/// The schema version row.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "dataindex_version")]
pub struct Model {
    /// The schema version.
    #[sea_orm(primary_key, auto_increment = false)]
    pub ver: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
