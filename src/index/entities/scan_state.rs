use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-directory mtime cache: lets a scan skip subtrees whose directory
/// mtime did not change since the last visit.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "scan_state")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub base_path: String,

    /// Directory path relative to the base; "" is the base root.
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub dir_path: String,

    pub mtime_ms: i64,
    pub scanned_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
