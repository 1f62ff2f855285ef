//! A logical file in the archive.
//!
//! A file's existence is independent of any physical copy: copies come
//! and go across nodes while the file row is immutable after creation.

use sea_orm::entity::prelude::*;

pub type FileModel = Model;

/// An archived file.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "file")]
pub struct Model {
    /// Unique numeric ID of the file.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the acquisition the file belongs to.
    ///
    /// (acq_id, name) is unique.
    #[sea_orm(indexed)]
    pub acq_id: i64,

    /// Name of the file within the acquisition.
    pub name: String,

    /// Size of the file in bytes.
    pub size_b: i64,

    /// MD5 digest of the file contents, in hexadecimal.
    #[sea_orm(column_type = "String(Some(32))")]
    pub md5sum: String,

    /// Timestamp when the file was registered.
    pub registered: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::acq::Entity",
        from = "Column::AcqId",
        to = "super::acq::Column::Id"
    )]
    Acq,

    #[sea_orm(has_many = "super::copy::Entity")]
    Copy,
}

impl Related<super::acq::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Acq.def()
    }
}

impl Related<super::copy::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Copy.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
