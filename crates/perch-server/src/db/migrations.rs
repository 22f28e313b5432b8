//! Database migration system for Perch Server
//!
//! Compile-time embedded SQL migrations with version tracking via a
//! `_migrations` table, applied automatically on startup.

use super::Database;
use super::DatabaseError;
use tracing::{debug, info, instrument};

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (must be unique and incrementing)
    pub version: i64,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for the migration
    pub sql: &'static str,
}

/// Initial schema: local accounts, the email index, and the
/// issuer-keyed OIDC client registrations.
const V0001_AUTH_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    webid TEXT PRIMARY KEY,
    email TEXT,
    name TEXT,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts_by_email (
    email TEXT PRIMARY KEY,
    webid TEXT NOT NULL,
    FOREIGN KEY (webid) REFERENCES accounts(webid) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS oidc_clients (
    issuer TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    client_secret TEXT,
    redirect_uri TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    is_trusted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

/// Runs embedded migrations against a database
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    /// The full migration set for the global database.
    pub fn global() -> Self {
        Self {
            migrations: vec![Migration {
                version: 1,
                description: "accounts, email index, and oidc client registrations",
                sql: V0001_AUTH_SCHEMA,
            }],
        }
    }

    /// Run all pending migrations against the given database.
    ///
    /// Returns the versions that were newly applied.
    #[instrument(skip_all, fields(db_name = %db.name()))]
    pub async fn run(&self, db: &Database) -> Result<Vec<i64>, DatabaseError> {
        let guard = db.acquire().await?;
        let conn = guard.as_ref();

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to create migrations table: {}", e))
        })?;

        let mut applied = Vec::new();
        let mut rows = conn
            .query("SELECT version FROM _migrations ORDER BY version", ())
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to query migrations: {}", e))
            })?;
        while let Some(row) = rows.next().await.map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to read migration row: {}", e))
        })? {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::MigrationFailed(format!("Failed to get version from row: {}", e))
            })?;
            applied.push(version);
        }

        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                debug!("Skipping already applied migration v{}", migration.version);
                continue;
            }

            info!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Migration v{} failed: {}",
                    migration.version, e
                ))
            })?;

            conn.execute(
                "INSERT INTO _migrations (version, description) VALUES (?, ?)",
                (migration.version, migration.description),
            )
            .await
            .map_err(|e| {
                DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e
                ))
            })?;

            newly_applied.push(migration.version);
            info!("Applied migration v{}", migration.version);
        }

        if newly_applied.is_empty() {
            debug!("No new migrations to apply");
        } else {
            info!("Applied {} new migrations", newly_applied.len());
        }

        Ok(newly_applied)
    }

    /// Get the current schema version
    pub async fn current_version(&self, db: &Database) -> Result<Option<i64>, DatabaseError> {
        let guard = db.acquire().await?;
        let conn = guard.as_ref();

        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='_migrations'",
                (),
            )
            .await
            .map_err(|e| {
                DatabaseError::QueryFailed(format!("Failed to check migrations table: {}", e))
            })?;
        if rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to read result: {}", e)))?
            .is_none()
        {
            return Ok(None);
        }

        let mut rows = conn
            .query("SELECT MAX(version) FROM _migrations", ())
            .await
            .map_err(|e| {
                DatabaseError::QueryFailed(format!("Failed to query max version: {}", e))
            })?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to read max version: {}", e)))?
        {
            Some(row) => {
                let version: Option<i64> = row.get(0).ok();
                Ok(version)
            }
            None => Ok(None),
        }
    }
}
