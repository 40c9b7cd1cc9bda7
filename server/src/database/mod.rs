//! Narrow persistence interface.
//!
//! The database is an opaque sink: the listener writes implant state, hidden
//! check-in lines, file hash mappings, and transfer records, and reads back
//! only the hash mapping. Every call site treats an error as
//! log-and-continue; persistence trouble never changes an HTTP response.
//! Without a pool (no `DATABASE_URL`) the layer runs disabled and every
//! operation is a no-op.

use std::path::Path;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use sqlx_core::migrate::Migrator;

use crate::models::ImplantRecord;

pub struct Database {
    pool: Option<PgPool>,
}

impl Database {
    /// Connect to Postgres.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool: Some(pool) })
    }

    /// A database that drops every write and answers every read with "not
    /// found".
    #[must_use]
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Apply migrations from a runtime-loaded directory.
    pub async fn migrate(&self, migrations_dir: &Path) -> Result<()> {
        if let Some(pool) = &self.pool {
            Migrator::new(migrations_dir).await?.run(pool).await?;
        }
        Ok(())
    }

    /// Persist a freshly activated implant.
    pub async fn initialize_implant(&self, implant: &ImplantRecord, server_id: &str) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO implants (id, server_id, workspace_uuid, ip_external, ip_internal, \
             username, hostname, os_build, pid, process_name, risky_mode, first_seen, \
             last_checkin, checkin_count, late, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (id) DO UPDATE SET workspace_uuid = $3, ip_external = $4, \
             ip_internal = $5, username = $6, hostname = $7, os_build = $8, pid = $9, \
             process_name = $10, risky_mode = $11, last_checkin = $13, checkin_count = $14, \
             late = $15, status = $16",
        )
        .bind(&implant.id)
        .bind(server_id)
        .bind(&implant.workspace_uuid)
        .bind(&implant.ip_external)
        .bind(&implant.ip_internal)
        .bind(&implant.username)
        .bind(&implant.hostname)
        .bind(&implant.os_build)
        .bind(implant.pid.map(i64::from))
        .bind(&implant.process_name)
        .bind(implant.risky_mode)
        .bind(implant.first_seen)
        .bind(implant.last_checkin)
        .bind(implant.checkin_count as i64)
        .bind(implant.late)
        .bind(implant.status.as_str())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Refresh the mutable liveness and identification columns.
    pub async fn update_implant(&self, implant: &ImplantRecord) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            "UPDATE implants SET ip_external = $2, ip_internal = $3, last_checkin = $4, \
             checkin_count = $5, late = $6, status = $7 WHERE id = $1",
        )
        .bind(&implant.id)
        .bind(&implant.ip_external)
        .bind(&implant.ip_internal)
        .bind(implant.last_checkin)
        .bind(implant.checkin_count as i64)
        .bind(implant.late)
        .bind(implant.status.as_str())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Append a log line for an implant. Check-in lines are marked hidden so
    /// the operator console can filter them.
    pub async fn implant_log(&self, implant_id: &str, result: &str, is_checkin: bool) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO implant_log (implant_id, logged_at, is_checkin, result) \
             VALUES ($1, NOW(), $2, $3)",
        )
        .bind(implant_id)
        .bind(is_checkin)
        .bind(result)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Remember which file a content-id resolves to.
    pub async fn store_file_hash_mapping(&self, hash: &str, filename: &str, path: &str) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO file_hashes (hash, filename, path) VALUES ($1, $2, $3) \
             ON CONFLICT (hash) DO UPDATE SET filename = $2, path = $3",
        )
        .bind(hash)
        .bind(filename)
        .bind(path)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Look up the persistent hash mapping.
    pub async fn file_info_by_hash(&self, hash: &str) -> Result<Option<(String, String)>> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT filename, path FROM file_hashes WHERE hash = $1")
            .bind(hash)
            .fetch_optional(pool)
            .await?;
        Ok(match row {
            Some(row) => Some((row.try_get("filename")?, row.try_get("path")?)),
            None => None,
        })
    }

    /// Record a completed transfer, either direction.
    pub async fn log_file_transfer(
        &self,
        implant_id: &str,
        filename: &str,
        size: u64,
        direction: &str,
    ) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO file_transfers (implant_id, filename, size, direction, transferred_at) \
             VALUES ($1, $2, $3, $4, NOW())",
        )
        .bind(implant_id)
        .bind(filename)
        .bind(size as i64)
        .bind(direction)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_database_swallows_writes() {
        let db = Database::disabled();
        assert!(!db.is_enabled());

        let implant = ImplantRecord::new();
        db.initialize_implant(&implant, "server-1").await.unwrap();
        db.update_implant(&implant).await.unwrap();
        db.implant_log(&implant.id, "checked in", true).await.unwrap();
        db.store_file_hash_mapping("aa", "a.txt", "/srv/a.txt")
            .await
            .unwrap();
        db.log_file_transfer(&implant.id, "a.txt", 3, "UPLOAD")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_database_reads_nothing() {
        let db = Database::disabled();
        assert_eq!(db.file_info_by_hash("aa").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_database_skips_migrations() {
        let db = Database::disabled();
        db.migrate(Path::new("./does-not-exist")).await.unwrap();
    }
}
