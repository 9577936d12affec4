//! Persistent filesystem index over SQLite or PostgreSQL via SeaORM.
//!
//! Identity rule: the `(base_path, rel_path)` lookup runs first, then the
//! `(dev, ino)` lookup (a rename keeps the id), then a fresh UUID v7 row.

use crate::index::entities::{file_index, scan_state, FileIndex, FileIndexModel, ScanState};
use sea_orm::sea_query::{Expr, LikeExpr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, ConnectOptions, ConnectionTrait,
    Database, DatabaseConnection, DbBackend, DbErr, EntityTrait, IntoActiveModel, PaginatorTrait,
    QueryFilter, Schema,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexAction {
    Added,
    Moved,
    Existing,
}

#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub id: String,
    pub action: IndexAction,
}

/// The stat fields the index cares about.
#[derive(Debug, Clone, Copy)]
pub struct EntryStat {
    pub dev: i64,
    pub ino: i64,
    pub size: i64,
    pub mtime_ms: i64,
    pub is_dir: bool,
}

impl EntryStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev() as i64,
            ino: meta.ino() as i64,
            size: meta.size() as i64,
            mtime_ms: mtime_millis(meta),
            is_dir: meta.is_dir(),
        }
    }
}

pub fn mtime_millis(meta: &Metadata) -> i64 {
    meta.mtime() * 1000 + i64::from(meta.mtime_nsec() / 1_000_000)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub entries: u64,
    pub files: u64,
    pub directories: u64,
}

pub struct IndexStore {
    db: DatabaseConnection,
}

impl IndexStore {
    /// Connect by URL (`sqlite::memory:`, `sqlite://...`, `postgres://...`)
    /// and create the schema if needed.
    pub async fn connect(url: &str) -> Result<Self, DbErr> {
        let db = Database::connect(ConnectOptions::new(url.to_owned())).await?;
        if db.get_database_backend() == DbBackend::Sqlite {
            db.execute_unprepared("PRAGMA journal_mode=WAL").await?;
            db.execute_unprepared("PRAGMA synchronous=NORMAL").await?;
        }
        Self::init_schema(&db).await?;
        info!(url, "file index ready");
        Ok(Self { db })
    }

    async fn init_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
        let builder = db.get_database_backend();
        let schema = Schema::new(builder);

        let stmts = vec![
            schema
                .create_table_from_entity(FileIndex)
                .if_not_exists()
                .to_owned(),
            schema
                .create_table_from_entity(ScanState)
                .if_not_exists()
                .to_owned(),
        ];
        for stmt in &stmts {
            db.execute(builder.build(stmt)).await?;
        }

        for sql in [
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_file_index_base_rel ON file_index (base_path, rel_path)",
            "CREATE INDEX IF NOT EXISTS idx_file_index_dev_ino ON file_index (dev, ino)",
            "CREATE INDEX IF NOT EXISTS idx_file_index_base ON file_index (base_path)",
        ] {
            db.execute_unprepared(sql).await?;
        }
        Ok(())
    }

    /// Record `(base, rel)` with the given stat. Existing path wins, then
    /// `(dev, ino)` identity (a move), else a new row.
    pub async fn index_file(
        &self,
        base: &str,
        rel: &str,
        stat: &EntryStat,
        indexed_at: i64,
    ) -> Result<IndexOutcome, DbErr> {
        if let Some(existing) = FileIndex::find()
            .filter(file_index::Column::BasePath.eq(base))
            .filter(file_index::Column::RelPath.eq(rel))
            .one(&self.db)
            .await?
        {
            let id = existing.id.clone();
            let mut active = existing.into_active_model();
            active.dev = Set(stat.dev);
            active.ino = Set(stat.ino);
            active.size = Set(stat.size);
            active.mtime_ms = Set(stat.mtime_ms);
            active.is_dir = Set(stat.is_dir);
            active.indexed_at = Set(indexed_at);
            active.update(&self.db).await?;
            return Ok(IndexOutcome {
                id,
                action: IndexAction::Existing,
            });
        }

        if let Some(moved) = FileIndex::find()
            .filter(file_index::Column::Dev.eq(stat.dev))
            .filter(file_index::Column::Ino.eq(stat.ino))
            .one(&self.db)
            .await?
        {
            let id = moved.id.clone();
            let mut active = moved.into_active_model();
            active.base_path = Set(base.to_string());
            active.rel_path = Set(rel.to_string());
            active.size = Set(stat.size);
            active.mtime_ms = Set(stat.mtime_ms);
            active.is_dir = Set(stat.is_dir);
            active.indexed_at = Set(indexed_at);
            active.update(&self.db).await?;
            return Ok(IndexOutcome {
                id,
                action: IndexAction::Moved,
            });
        }

        let id = Uuid::now_v7().to_string();
        let row = file_index::ActiveModel {
            id: Set(id.clone()),
            base_path: Set(base.to_string()),
            rel_path: Set(rel.to_string()),
            dev: Set(stat.dev),
            ino: Set(stat.ino),
            size: Set(stat.size),
            mtime_ms: Set(stat.mtime_ms),
            is_dir: Set(stat.is_dir),
            indexed_at: Set(indexed_at),
        };
        FileIndex::insert(row).exec_without_returning(&self.db).await?;
        Ok(IndexOutcome {
            id,
            action: IndexAction::Added,
        })
    }

    pub async fn resolve_id(&self, id: &str) -> Result<Option<FileIndexModel>, DbErr> {
        FileIndex::find_by_id(id).one(&self.db).await
    }

    /// Resolve many ids at once, preserving order; misses are `None`.
    pub async fn bulk_resolve(
        &self,
        ids: &[String],
    ) -> Result<Vec<Option<FileIndexModel>>, DbErr> {
        let rows = FileIndex::find()
            .filter(file_index::Column::Id.is_in(ids.iter().cloned()))
            .all(&self.db)
            .await?;
        let mut by_id: HashMap<String, FileIndexModel> =
            rows.into_iter().map(|r| (r.id.clone(), r)).collect();
        Ok(ids.iter().map(|id| by_id.remove(id)).collect())
    }

    pub async fn identify_path(&self, base: &str, rel: &str) -> Result<Option<String>, DbErr> {
        Ok(FileIndex::find()
            .filter(file_index::Column::BasePath.eq(base))
            .filter(file_index::Column::RelPath.eq(rel))
            .one(&self.db)
            .await?
            .map(|row| row.id))
    }

    pub async fn remove_from_index(&self, base: &str, rel: &str) -> Result<u64, DbErr> {
        let res = FileIndex::delete_many()
            .filter(file_index::Column::BasePath.eq(base))
            .filter(file_index::Column::RelPath.eq(rel))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    /// Remove `rel` and everything under it. The LIKE prefix escapes `\`,
    /// `%` and `_` so a directory literally named `a%b` cannot match its
    /// siblings.
    pub async fn remove_from_index_recursive(&self, base: &str, rel: &str) -> Result<u64, DbErr> {
        let res = FileIndex::delete_many()
            .filter(file_index::Column::BasePath.eq(base))
            .filter(
                Condition::any()
                    .add(file_index::Column::RelPath.eq(rel))
                    .add(
                        file_index::Column::RelPath
                            .like(LikeExpr::new(format!("{}/%", like_escape(rel))).escape('\\')),
                    ),
            )
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    /// Bulk-bump `indexed_at` for a directory row and its descendants;
    /// used when a scan skips an unchanged subtree.
    pub async fn touch_indexed_at_under_dir(
        &self,
        base: &str,
        dir: &str,
        ts: i64,
    ) -> Result<u64, DbErr> {
        let scope = if dir.is_empty() {
            Condition::all()
        } else {
            Condition::all().add(
                Condition::any()
                    .add(file_index::Column::RelPath.eq(dir))
                    .add(
                        file_index::Column::RelPath
                            .like(LikeExpr::new(format!("{}/%", like_escape(dir))).escape('\\')),
                    ),
            )
        };
        let res = FileIndex::update_many()
            .col_expr(file_index::Column::IndexedAt, Expr::value(ts))
            .filter(file_index::Column::BasePath.eq(base))
            .filter(scope)
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    /// Sweep rows the last scan generation never touched.
    pub async fn remove_stale_entries(&self, base: &str, before: i64) -> Result<u64, DbErr> {
        let res = FileIndex::delete_many()
            .filter(file_index::Column::BasePath.eq(base))
            .filter(file_index::Column::IndexedAt.lt(before))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn get_index_stats(&self) -> Result<IndexStats, DbErr> {
        let entries = FileIndex::find().count(&self.db).await?;
        let directories = FileIndex::find()
            .filter(file_index::Column::IsDir.eq(true))
            .count(&self.db)
            .await?;
        Ok(IndexStats {
            entries,
            directories,
            files: entries - directories,
        })
    }

    pub async fn get_scan_state(&self, base: &str, dir: &str) -> Result<Option<i64>, DbErr> {
        Ok(ScanState::find_by_id((base.to_string(), dir.to_string()))
            .one(&self.db)
            .await?
            .map(|row| row.mtime_ms))
    }

    pub async fn upsert_scan_state(
        &self,
        base: &str,
        dir: &str,
        mtime_ms: i64,
        scanned_at: i64,
    ) -> Result<(), DbErr> {
        let row = scan_state::ActiveModel {
            base_path: Set(base.to_string()),
            dir_path: Set(dir.to_string()),
            mtime_ms: Set(mtime_ms),
            scanned_at: Set(scanned_at),
        };
        ScanState::insert(row)
            .on_conflict(
                OnConflict::columns([scan_state::Column::BasePath, scan_state::Column::DirPath])
                    .update_columns([scan_state::Column::MtimeMs, scan_state::Column::ScannedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}

fn like_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
