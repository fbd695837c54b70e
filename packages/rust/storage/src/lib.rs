//! libSQL storage layer and the [`PersistenceGateway`] contract.
//!
//! The [`Storage`] struct wraps an embedded libSQL database holding per-source
//! detection state and the append-only publish pattern log.
//! [`MemoryGateway`] implements the same contract in-process.
//!
//! **Access rules:**
//! - Scheduler: read-write via [`Storage::open`]
//! - Operator inspection (`changewatch state`): read-only via [`Storage::open_readonly`]

mod gateway;
mod memory;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use changewatch_shared::{
    ChangeWatchError, PublishPatternRecord, Result, SourceState, StateUpsert,
};
use libsql::{Connection, Database, params};

pub use gateway::PersistenceGateway;
pub use memory::MemoryGateway;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ChangeWatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChangeWatchError::Persistence(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ChangeWatchError::Persistence(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ChangeWatchError::Persistence(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Publish patterns
    // -----------------------------------------------------------------------

    /// Most recent publish observations for a source, newest first.
    pub async fn list_publish_patterns(
        &self,
        source_id: &str,
        limit: u32,
    ) -> Result<Vec<PublishPatternRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, source_id, observed_publish_time, recorded_at
                 FROM publish_patterns WHERE source_id = ?1
                 ORDER BY observed_publish_time DESC
                 LIMIT ?2",
                params![source_id, limit],
            )
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;
            results.push(PublishPatternRecord {
                id: id
                    .parse()
                    .map_err(|e| ChangeWatchError::Persistence(format!("invalid id: {e}")))?,
                source_id: row
                    .get::<String>(1)
                    .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?,
                observed_publish_time: parse_ts(&row, 2)?,
                recorded_at: parse_ts(&row, 3)?,
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl PersistenceGateway for Storage {
    async fn get_source_state(&self, source_id: &str) -> Result<Option<SourceState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, last_known_item_id, last_known_item_url, last_check_at,
                        last_item_at, total_items_seen, updated_at
                 FROM source_state WHERE source_id = ?1",
                params![source_id],
            )
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_source_state(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ChangeWatchError::Persistence(e.to_string())),
        }
    }

    async fn upsert_source_state(&self, upsert: &StateUpsert) -> Result<()> {
        self.check_writable()?;
        let at = upsert.at.to_rfc3339();
        let increment = i64::try_from(upsert.increment).unwrap_or(i64::MAX);
        self.conn
            .execute(
                "INSERT INTO source_state (source_id, last_known_item_id, last_known_item_url,
                                           last_check_at, last_item_at, total_items_seen, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?4)
                 ON CONFLICT(source_id) DO UPDATE SET
                   last_known_item_id = excluded.last_known_item_id,
                   last_known_item_url = excluded.last_known_item_url,
                   last_check_at = excluded.last_check_at,
                   last_item_at = excluded.last_item_at,
                   total_items_seen = source_state.total_items_seen + excluded.total_items_seen,
                   updated_at = excluded.updated_at",
                params![
                    upsert.source_id.as_str(),
                    upsert.last_known_item_id.as_str(),
                    upsert.last_known_item_url.as_str(),
                    at.as_str(),
                    increment,
                ],
            )
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn touch_source_state(&self, source_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        let at = at.to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO source_state (source_id, last_check_at, total_items_seen, updated_at)
                 VALUES (?1, ?2, 0, ?2)
                 ON CONFLICT(source_id) DO UPDATE SET
                   last_check_at = excluded.last_check_at,
                   updated_at = excluded.updated_at",
                params![source_id, at.as_str()],
            )
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn insert_publish_pattern(&self, record: &PublishPatternRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO publish_patterns (id, source_id, observed_publish_time, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id.to_string(),
                    record.source_id.as_str(),
                    record.observed_publish_time.to_rfc3339(),
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn list_source_states(&self) -> Result<Vec<SourceState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, last_known_item_id, last_known_item_url, last_check_at,
                        last_item_at, total_items_seen, updated_at
                 FROM source_state ORDER BY source_id",
                params![],
            )
            .await
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_source_state(&row)?);
        }
        Ok(results)
    }
}

/// Convert a database row to a [`SourceState`].
fn row_to_source_state(row: &libsql::Row) -> Result<SourceState> {
    Ok(SourceState {
        source_id: row
            .get::<String>(0)
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?,
        last_known_item_id: row.get::<String>(1).ok(),
        last_known_item_url: row.get::<String>(2).ok(),
        last_check_at: parse_ts(row, 3)?,
        last_item_at: row
            .get::<String>(4)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        total_items_seen: row
            .get::<i64>(5)
            .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?
            .max(0) as u64,
        updated_at: parse_ts(row, 6)?,
    })
}

/// Parse a non-null RFC 3339 column.
fn parse_ts(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    let s: String = row
        .get(idx)
        .map_err(|e| ChangeWatchError::Persistence(e.to_string()))?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ChangeWatchError::Persistence(format!("invalid date: {e}")))
}
