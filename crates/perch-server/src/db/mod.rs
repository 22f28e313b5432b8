//! Database module for Perch Server
//!
//! Provides a libSQL database layer with:
//! - A single global database for accounts, the email index, and the
//!   issuer-keyed client registrations
//! - Automatic schema migrations
//! - Health check capabilities
//!
//! In-memory databases keep one persistent connection alive: libSQL
//! creates an isolated database per `:memory:` connection, so all
//! callers must share the same one. File-based databases hand out
//! fresh connections.

mod migrations;

use libsql::{Connection, Database as LibSqlDatabase};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

pub use migrations::{Migration, MigrationRunner};

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    /// Shared connection for `:memory:` databases.
    persistent: Option<Arc<Mutex<Connection>>>,
    name: String,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        Ok(Self {
            db: Arc::new(db),
            persistent: Some(Arc::new(Mutex::new(conn))),
            name: name.to_string(),
        })
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            persistent: None,
            name: name.to_string(),
        })
    }

    /// Get a new connection to the database
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    /// The shared connection, if this is an in-memory database.
    pub fn persistent_connection(&self) -> Option<&Arc<Mutex<Connection>>> {
        self.persistent.as_ref()
    }

    /// Acquire a connection appropriate for this database: the shared
    /// persistent connection for `:memory:`, a fresh one otherwise.
    pub async fn acquire(&self) -> Result<ConnectionGuard<'_>, DatabaseError> {
        match &self.persistent {
            Some(persistent) => Ok(ConnectionGuard::Persistent(persistent.lock().await)),
            None => Ok(ConnectionGuard::Owned(self.connect()?)),
        }
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.acquire().await?;
        match conn.as_ref().query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// A guard that wraps either the shared persistent connection (for
/// in-memory databases) or an owned connection (for file-based ones).
pub enum ConnectionGuard<'a> {
    Persistent(MutexGuard<'a, Connection>),
    Owned(Connection),
}

impl ConnectionGuard<'_> {
    /// Get a reference to the underlying connection
    pub fn as_ref(&self) -> &Connection {
        match self {
            ConnectionGuard::Persistent(guard) => guard,
            ConnectionGuard::Owned(conn) => conn,
        }
    }
}
