//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{AssetRepo, JsonDataRepo, UpdateRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UpdateRepo + AssetRepo + JsonDataRepo + Send + Sync {
    /// Create tables if they do not exist yet.
    async fn migrate(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a database and run migrations.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if path != Path::new(":memory:")
            && let Some(parent) = path.parent()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One connection serializes transactions and keeps an in-memory
            // database alive for the lifetime of the pool.
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "Opened update database");

        Ok(store)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use serde_json::Value;
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use updraft_core::{Asset, ManifestAsset, NewAsset, Update};
    use uuid::Uuid;

    // SQLite has a limit of ~999 parameters per statement.
    const BATCH_SIZE: usize = 900;

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }

    fn sort_oldest_first(updates: &mut [Update]) {
        updates.sort_by(|a, b| a.commit_time.cmp(&b.commit_time).then(a.id.cmp(&b.id)));
    }

    /// Insert an asset unless its key already has a row; return the row id.
    async fn insert_asset_row(
        conn: &mut SqliteConnection,
        asset: &NewAsset,
    ) -> MetadataResult<i64> {
        sqlx::query(
            "INSERT INTO assets (key, relative_path, hash, url, embedded_locator, content_type, \
             is_launch_asset, expected_hash, download_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(key) DO NOTHING",
        )
        .bind(&asset.key)
        .bind(&asset.relative_path)
        .bind(asset.hash.to_hex())
        .bind(asset.url.as_ref().map(|u| u.as_str()))
        .bind(asset.embedded_locator.as_deref())
        .bind(&asset.content_type)
        .bind(asset.is_launch_asset)
        .bind(asset.expected_hash.as_deref())
        .bind(asset.download_time)
        .execute(&mut *conn)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM assets WHERE key = ?")
            .bind(&asset.key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(id)
    }

    async fn link_asset_row(
        conn: &mut SqliteConnection,
        update_id: Uuid,
        asset_id: i64,
        is_launch_asset: bool,
    ) -> MetadataResult<()> {
        sqlx::query("INSERT OR IGNORE INTO updates_assets (update_id, asset_id) VALUES (?, ?)")
            .bind(update_id)
            .bind(asset_id)
            .execute(&mut *conn)
            .await?;

        if is_launch_asset {
            sqlx::query("UPDATE updates SET launch_asset_id = ? WHERE id = ?")
                .bind(asset_id)
                .bind(update_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn mark_ready_row(conn: &mut SqliteConnection, id: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE updates SET status = 'ready', keep = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("update {id} not found")));
        }
        Ok(())
    }

    // =========================================================================
    // Updates
    // =========================================================================

    #[async_trait]
    impl UpdateRepo for SqliteStore {
        async fn get_update(&self, id: Uuid) -> MetadataResult<Option<Update>> {
            let row = sqlx::query_as::<_, UpdateRow>("SELECT * FROM updates WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(UpdateRow::into_update).transpose()
        }

        async fn insert_update(&self, update: &Update) -> MetadataResult<()> {
            let row = UpdateRow::from_update(update);
            sqlx::query(
                "INSERT INTO updates (id, scope_key, commit_time, runtime_version, manifest, \
                 status, keep, last_accessed, successful_launch_count, failed_launch_count, \
                 launch_asset_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.id)
            .bind(&row.scope_key)
            .bind(row.commit_time)
            .bind(&row.runtime_version)
            .bind(&row.manifest)
            .bind(&row.status)
            .bind(row.keep)
            .bind(row.last_accessed)
            .bind(row.successful_launch_count)
            .bind(row.failed_launch_count)
            .bind(row.launch_asset_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn mark_update_ready(&self, id: Uuid) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            mark_ready_row(&mut conn, id).await
        }

        async fn set_scope_key(&self, id: Uuid, scope_key: &str) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE updates SET scope_key = ? WHERE id = ?")
                .bind(scope_key)
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("update {id} not found")));
            }
            Ok(())
        }

        async fn set_update_commit_time(
            &self,
            id: Uuid,
            commit_time: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE updates SET commit_time = ? WHERE id = ?")
                .bind(commit_time)
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("update {id} not found")));
            }
            Ok(())
        }

        async fn all_updates(&self) -> MetadataResult<Vec<Update>> {
            let rows = sqlx::query_as::<_, UpdateRow>("SELECT * FROM updates")
                .fetch_all(&self.pool)
                .await?;
            let mut updates = rows_into_updates(rows)?;
            sort_oldest_first(&mut updates);
            Ok(updates)
        }

        async fn launchable_updates(&self, scope_key: &str) -> MetadataResult<Vec<Update>> {
            let rows = sqlx::query_as::<_, UpdateRow>(
                "SELECT * FROM updates WHERE scope_key = ? \
                 AND (successful_launch_count > 0 OR failed_launch_count < 1) \
                 AND status IN ('ready', 'embedded')",
            )
            .bind(scope_key)
            .fetch_all(&self.pool)
            .await?;
            let mut updates = rows_into_updates(rows)?;
            sort_oldest_first(&mut updates);
            Ok(updates)
        }

        async fn mark_update_accessed(&self, id: Uuid) -> MetadataResult<()> {
            sqlx::query("UPDATE updates SET last_accessed = ? WHERE id = ?")
                .bind(OffsetDateTime::now_utc())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn increment_successful_launch_count(&self, id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE updates SET successful_launch_count = successful_launch_count + 1 \
                 WHERE id = ?",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn increment_failed_launch_count(&self, id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE updates SET failed_launch_count = failed_launch_count + 1 WHERE id = ?",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn delete_updates(&self, ids: &[Uuid]) -> MetadataResult<u64> {
            if ids.is_empty() {
                return Ok(0);
            }

            let mut tx = self.pool.begin().await?;
            let mut deleted = 0;
            for batch in ids.chunks(BATCH_SIZE) {
                let query = format!(
                    "DELETE FROM updates WHERE id IN ({})",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query(&query);
                for id in batch {
                    q = q.bind(*id);
                }
                deleted += q.execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            Ok(deleted)
        }
    }

    // =========================================================================
    // Assets
    // =========================================================================

    #[async_trait]
    impl AssetRepo for SqliteStore {
        async fn get_asset_by_key(&self, key: &str) -> MetadataResult<Option<Asset>> {
            let row = sqlx::query_as::<_, AssetRow>("SELECT * FROM assets WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            row.map(AssetRow::into_asset).transpose()
        }

        async fn merge_asset(
            &self,
            existing: &Asset,
            incoming: &ManifestAsset,
        ) -> MetadataResult<Asset> {
            let mut merged = existing.clone();
            merged.is_launch_asset = incoming.is_launch_asset;

            if let Some(url) = incoming.url()
                && existing.url.as_ref() != Some(url)
            {
                sqlx::query("UPDATE assets SET url = ? WHERE id = ?")
                    .bind(url.as_str())
                    .bind(existing.id)
                    .execute(&self.pool)
                    .await?;
                merged.url = Some(url.clone());
            }
            Ok(merged)
        }

        async fn link_existing_asset(
            &self,
            update_id: Uuid,
            key: &str,
            is_launch_asset: bool,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            let asset_id: Option<i64> = sqlx::query_scalar("SELECT id FROM assets WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(asset_id) = asset_id else {
                return Ok(false);
            };
            link_asset_row(&mut tx, update_id, asset_id, is_launch_asset).await?;
            tx.commit().await?;
            Ok(true)
        }

        async fn insert_assets(
            &self,
            update_id: Uuid,
            assets: &[NewAsset],
        ) -> MetadataResult<Vec<Asset>> {
            let mut tx = self.pool.begin().await?;
            let mut inserted = Vec::with_capacity(assets.len());
            for asset in assets {
                let asset_id = insert_asset_row(&mut tx, asset).await?;
                link_asset_row(&mut tx, update_id, asset_id, asset.is_launch_asset).await?;
                let row = sqlx::query_as::<_, AssetRow>("SELECT * FROM assets WHERE id = ?")
                    .bind(asset_id)
                    .fetch_one(&mut *tx)
                    .await?;
                inserted.push(row);
            }
            tx.commit().await?;
            rows_into_assets(inserted)
        }

        async fn commit_update_assets(
            &self,
            update_id: Uuid,
            existing: &[Asset],
            new_assets: &[NewAsset],
            mark_ready: bool,
        ) -> MetadataResult<Vec<String>> {
            let mut tx = self.pool.begin().await?;
            let mut stale = Vec::new();
            for asset in existing {
                let current: Option<i64> =
                    sqlx::query_scalar("SELECT id FROM assets WHERE key = ?")
                        .bind(&asset.key)
                        .fetch_optional(&mut *tx)
                        .await?;
                match current {
                    Some(asset_id) => {
                        link_asset_row(&mut tx, update_id, asset_id, asset.is_launch_asset)
                            .await?;
                    }
                    None => stale.push(asset.key.clone()),
                }
            }
            for asset in new_assets {
                let asset_id = insert_asset_row(&mut tx, asset).await?;
                link_asset_row(&mut tx, update_id, asset_id, asset.is_launch_asset).await?;
            }
            if mark_ready && stale.is_empty() {
                mark_ready_row(&mut tx, update_id).await?;
            }
            tx.commit().await?;
            Ok(stale)
        }

        async fn assets_for_update(&self, update_id: Uuid) -> MetadataResult<Vec<Asset>> {
            let rows = sqlx::query_as::<_, AssetRow>(
                "SELECT assets.* FROM assets \
                 INNER JOIN updates_assets ON updates_assets.asset_id = assets.id \
                 WHERE updates_assets.update_id = ? ORDER BY assets.id",
            )
            .bind(update_id)
            .fetch_all(&self.pool)
            .await?;
            rows_into_assets(rows)
        }

        async fn launch_asset_for_update(&self, update_id: Uuid) -> MetadataResult<Option<Asset>> {
            let row = sqlx::query_as::<_, AssetRow>(
                "SELECT assets.* FROM assets \
                 INNER JOIN updates ON updates.launch_asset_id = assets.id \
                 WHERE updates.id = ?",
            )
            .bind(update_id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(AssetRow::into_asset).transpose()
        }

        async fn all_assets(&self) -> MetadataResult<Vec<Asset>> {
            let rows = sqlx::query_as::<_, AssetRow>("SELECT * FROM assets ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
            rows_into_assets(rows)
        }

        async fn mark_missing_assets(&self, asset_ids: &[i64]) -> MetadataResult<u64> {
            if asset_ids.is_empty() {
                return Ok(0);
            }

            let mut tx = self.pool.begin().await?;
            let mut demoted = 0;
            for batch in asset_ids.chunks(BATCH_SIZE) {
                let query = format!(
                    "UPDATE updates SET status = 'pending' WHERE id IN \
                     (SELECT DISTINCT update_id FROM updates_assets WHERE asset_id IN ({}))",
                    placeholders(batch.len())
                );
                let mut q = sqlx::query(&query);
                for id in batch {
                    q = q.bind(*id);
                }
                demoted += q.execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            Ok(demoted)
        }

        async fn delete_unused_assets(&self) -> MetadataResult<Vec<Asset>> {
            let mut tx = self.pool.begin().await?;

            sqlx::query("UPDATE assets SET marked_for_deletion = 1")
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE assets SET marked_for_deletion = 0 WHERE id IN \
                 (SELECT asset_id FROM updates_assets) \
                 OR id IN (SELECT launch_asset_id FROM updates WHERE launch_asset_id IS NOT NULL)",
            )
            .execute(&mut *tx)
            .await?;
            // A file may back more than one row.
            sqlx::query(
                "UPDATE assets SET marked_for_deletion = 0 WHERE relative_path IN \
                 (SELECT relative_path FROM assets WHERE marked_for_deletion = 0)",
            )
            .execute(&mut *tx)
            .await?;

            let rows = sqlx::query_as::<_, AssetRow>(
                "SELECT * FROM assets WHERE marked_for_deletion = 1 ORDER BY id",
            )
            .fetch_all(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM assets WHERE marked_for_deletion = 1")
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            rows_into_assets(rows)
        }
    }

    // =========================================================================
    // JSON side data
    // =========================================================================

    #[async_trait]
    impl JsonDataRepo for SqliteStore {
        async fn get_json_data(&self, key: &str, scope_key: &str) -> MetadataResult<Option<Value>> {
            let row = sqlx::query_as::<_, JsonDataRow>(
                "SELECT * FROM json_data WHERE key = ? AND scope_key = ?",
            )
            .bind(key)
            .bind(scope_key)
            .fetch_optional(&self.pool)
            .await?;

            row.map(|r| {
                serde_json::from_str(&r.value)
                    .map_err(|e| MetadataError::Corrupt(format!("json_data {}: {e}", r.key)))
            })
            .transpose()
        }

        async fn set_json_data(
            &self,
            key: &str,
            value: &Value,
            scope_key: &str,
        ) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO json_data (key, value, scope_key, last_updated) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(key, scope_key) DO UPDATE SET value = excluded.value, \
                 last_updated = excluded.last_updated",
            )
            .bind(key)
            .bind(value.to_string())
            .bind(scope_key)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Assets: one row per content-addressing key
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    relative_path TEXT NOT NULL,
    hash TEXT NOT NULL,
    url TEXT,
    embedded_locator TEXT,
    content_type TEXT NOT NULL,
    is_launch_asset INTEGER NOT NULL DEFAULT 0,
    expected_hash TEXT,
    download_time TEXT NOT NULL,
    marked_for_deletion INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_assets_relative_path ON assets(relative_path);

-- Updates
CREATE TABLE IF NOT EXISTS updates (
    id BLOB PRIMARY KEY,
    scope_key TEXT NOT NULL,
    commit_time TEXT NOT NULL,
    runtime_version TEXT NOT NULL,
    manifest TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    keep INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT NOT NULL,
    successful_launch_count INTEGER NOT NULL DEFAULT 0,
    failed_launch_count INTEGER NOT NULL DEFAULT 0,
    launch_asset_id INTEGER REFERENCES assets(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_updates_scope ON updates(scope_key);

-- Update to asset links
CREATE TABLE IF NOT EXISTS updates_assets (
    update_id BLOB NOT NULL REFERENCES updates(id) ON DELETE CASCADE,
    asset_id INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    PRIMARY KEY (update_id, asset_id)
);
CREATE INDEX IF NOT EXISTS idx_updates_assets_asset ON updates_assets(asset_id);

-- Scoped JSON side data
CREATE TABLE IF NOT EXISTS json_data (
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (key, scope_key)
);
"#;
