//! A filesystem root on a specific host holding file copies.

use sea_orm::entity::prelude::*;

pub type NodeModel = Model;

/// The kind of storage behind a node.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(Some(1))")]
pub enum StorageType {
    /// Long-term archival storage.
    ///
    /// Archive copies are what the two-copies-before-delete rule counts.
    #[sea_orm(string_value = "A")]
    Archive,

    /// Field storage (acquisition machines and the like).
    #[sea_orm(string_value = "F")]
    Field,

    /// Transiting storage, physically carried between sites.
    #[sea_orm(string_value = "T")]
    Transport,

    /// Anything else.
    #[sea_orm(string_value = "-")]
    Other,
}

/// A storage node.
#[derive(Debug, Clone, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "storage_node")]
pub struct Model {
    /// Unique numeric ID of the node.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Unique name of the node.
    #[sea_orm(column_type = "String(Some(64))", unique, indexed)]
    pub name: String,

    /// ID of the group this node belongs to.
    #[sea_orm(indexed)]
    pub group_id: i64,

    /// Hostname of the daemon responsible for this node.
    #[sea_orm(column_type = "String(Some(64))", nullable)]
    pub host: Option<String>,

    /// Internet address for remote SSH access to this node.
    pub address: Option<String>,

    /// Login username for remote SSH access.
    #[sea_orm(column_type = "String(Some(64))", nullable)]
    pub username: Option<String>,

    /// Is the node active?
    pub active: bool,

    /// Name of the node I/O class. `None` means "Default".
    pub io_class: Option<String>,

    /// The kind of storage behind this node.
    pub storage_type: StorageType,

    /// Should files appearing under the root be imported automatically?
    pub auto_import: bool,

    /// If greater than zero, re-verify up to this many idle-time copies
    /// per update loop.
    pub auto_verify: i32,

    /// The root directory for data on this node.
    pub root: Option<String>,

    /// Free space, in GiB, as last measured by the daemon.
    #[sea_orm(nullable)]
    pub avail_gb: Option<f64>,

    /// Minimum free space to preserve, in GiB.
    pub min_avail_gb: f64,

    /// Maximum total size of file copies, in GiB. Unlimited if unset.
    #[sea_orm(nullable)]
    pub max_total_gb: Option<f64>,

    /// When `avail_gb` was last refreshed.
    #[sea_orm(nullable)]
    pub last_checked: Option<ChronoDateTimeUtc>,

    /// JSON blob of configuration interpreted by the I/O class.
    #[sea_orm(column_type = "Text", nullable)]
    pub io_config: Option<String>,

    /// Free-form notes about this node.
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::group::Entity",
        from = "Column::GroupId",
        to = "super::group::Column::Id"
    )]
    Group,

    #[sea_orm(has_many = "super::copy::Entity")]
    Copy,
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Group.def()
    }
}

impl Related<super::copy::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Copy.def()
    }
}

impl Model {
    /// Is this an archival node?
    pub fn archive(&self) -> bool {
        self.storage_type == StorageType::Archive
    }

    /// Is the daemon on `hostname` responsible for this node?
    pub fn local_to(&self, hostname: &str) -> bool {
        self.host.as_deref() == Some(hostname)
    }

    /// Is the measured free space below the configured minimum?
    ///
    /// `false` if the free space has never been measured.
    pub fn under_min(&self) -> bool {
        match self.avail_gb {
            Some(avail) => avail < self.min_avail_gb,
            None => false,
        }
    }
}

impl ActiveModelBehavior for ActiveModel {}
