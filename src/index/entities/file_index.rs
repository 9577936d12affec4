use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per live inode under a base. `id` is a UUID v7 assigned on
/// first sight and preserved across renames via the `(dev, ino)` lookup.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "file_index")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub id: String,

    #[sea_orm(column_type = "Text")]
    pub base_path: String,

    #[sea_orm(column_type = "Text")]
    pub rel_path: String,

    pub dev: i64,
    pub ino: i64,
    pub size: i64,
    pub mtime_ms: i64,
    pub is_dir: bool,

    /// Scan-generation stamp; rows older than a completed scan's start are
    /// gone from disk and get swept.
    pub indexed_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
