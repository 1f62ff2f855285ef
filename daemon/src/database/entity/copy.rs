//! The physical presence of a file on a node.

use sea_orm::entity::prelude::*;

pub type CopyModel = Model;

/// The state of a file copy.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(Some(1))")]
pub enum CopyState {
    /// The copy is present and was healthy at its last verification.
    #[sea_orm(string_value = "H")]
    Healthy,

    /// The copy is present but has never been verified, or needs to be
    /// re-verified.
    ///
    /// This is the state freshly registered copies start in, and the
    /// state a verification request puts a copy back into.
    #[sea_orm(string_value = "M")]
    Suspect,

    /// Verification failed.
    ///
    /// A corrupt copy counts as absent for every operational purpose;
    /// the bytes are kept on disk for forensics until overwritten by a
    /// repair pull or released.
    #[sea_orm(string_value = "X")]
    Corrupt,

    /// The copy was expected on the node but was not found.
    #[sea_orm(string_value = "N")]
    Missing,

    /// The copy is marked for deletion but still on disk.
    #[sea_orm(string_value = "Y")]
    Released,

    /// The copy has been deleted.
    #[sea_orm(string_value = "-")]
    Removed,
}

impl CopyState {
    /// Should the node still have bytes on disk for this copy?
    pub fn on_disk(&self) -> bool {
        matches!(
            self,
            Self::Healthy | Self::Suspect | Self::Corrupt | Self::Released
        )
    }

    /// Does this state satisfy a pull request into the copy's group?
    pub fn satisfies_pull(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// A file copy.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "filecopy")]
pub struct Model {
    /// Unique numeric ID of the copy.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the file this is a copy of.
    ///
    /// (file_id, node_id) is unique.
    #[sea_orm(indexed)]
    pub file_id: i64,

    /// ID of the node the copy lives on.
    #[sea_orm(indexed)]
    pub node_id: i64,

    /// The state of the copy.
    pub state: CopyState,

    /// Whether the node is believed to hold bytes for this copy.
    ///
    /// Kept consistent with `state` by the daemon; recorded separately
    /// so operators can query for on-disk copies without decoding
    /// states.
    pub has_file: bool,

    /// Size of the copy on this node's storage, after block rounding.
    #[sea_orm(nullable)]
    pub size_b: Option<i64>,

    /// When this row was last updated.
    pub last_update: ChronoDateTimeUtc,

    /// When the copy was last verified. Unset if never verified.
    #[sea_orm(nullable)]
    pub last_check: Option<ChronoDateTimeUtc>,
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
        belongs_to = "super::node::Entity",
        from = "Column::NodeId",
        to = "super::node::Column::Id"
    )]
    Node,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Node.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
