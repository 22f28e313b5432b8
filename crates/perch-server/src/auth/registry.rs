//! Issuer-keyed cache of OIDC client registrations.
//!
//! The registry is the single authority for "which client do we use
//! against issuer X". Records live in durable storage and in an
//! in-memory map; a per-issuer lock collapses concurrent first
//! requests for an unknown issuer into one registration run, so an
//! issuer is never double-registered.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::db::Database;

use super::provider::{ClientRecord, RegistrationProtocol};
use super::AuthError;

/// Canonical issuer form: parsed URL, trailing slash stripped.
pub fn normalize_issuer(raw: &str) -> Result<String, AuthError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AuthError::Validation(format!("invalid issuer '{}': {}", raw, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AuthError::Validation(format!(
            "issuer must be an http(s) URL, got '{}'",
            raw
        )));
    }
    Ok(url.to_string().trim_end_matches('/').to_string())
}

/// Durable, issuer-keyed cache of client records with single-flight
/// registration.
pub struct ClientRegistry {
    db: Database,
    protocol: RegistrationProtocol,
    /// Records already resolved this process lifetime. Also serves as
    /// the best-effort fallback when a durable write fails after a
    /// successful registration.
    records: DashMap<String, ClientRecord>,
    /// Per-issuer registration locks; an entry exists only while a
    /// registration for that issuer may be in flight.
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ClientRegistry {
    pub fn new(db: Database, protocol: RegistrationProtocol) -> Self {
        Self {
            db,
            protocol,
            records: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Get the client record for an issuer, registering on first use.
    ///
    /// Concurrent calls for the same unknown issuer serialize on a
    /// per-issuer lock and re-check the cache after acquiring it, so
    /// exactly one registration runs and every caller receives the
    /// same record. A failed registration is not cached; the next call
    /// retries.
    #[instrument(skip(self))]
    pub async fn get(&self, issuer: &str) -> Result<ClientRecord, AuthError> {
        let issuer = normalize_issuer(issuer)?;

        if let Some(record) = self.lookup(&issuer).await? {
            return Ok(record);
        }

        let lock = self
            .in_flight
            .entry(issuer.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have finished registering while we waited.
        if let Some(record) = self.lookup(&issuer).await? {
            return Ok(record);
        }

        let record = match self.protocol.register(&issuer).await {
            Ok(record) => record,
            Err(e) => {
                // Settle the ledger so the next call retries.
                self.in_flight.remove(&issuer);
                return Err(e);
            }
        };

        // Publish before settling the ledger: a caller that misses the
        // lock entry must already find the record, or a second
        // registration could run.
        self.records.insert(issuer.clone(), record.clone());
        if let Err(e) = self.persist(&record).await {
            // Served from memory for the rest of this process lifetime.
            warn!(issuer = %issuer, error = %e, "Failed to persist client registration");
        }
        self.in_flight.remove(&issuer);

        Ok(record)
    }

    /// Idempotent upsert, also used to seed the trusted/local issuer
    /// at startup before the server accepts requests.
    #[instrument(skip(self, record), fields(issuer = %record.issuer))]
    pub async fn put(&self, record: ClientRecord) -> Result<(), AuthError> {
        let issuer = normalize_issuer(&record.issuer)?;
        let mut record = record;
        record.issuer = issuer.clone();

        self.persist(&record).await?;
        self.records.insert(issuer, record);
        Ok(())
    }

    async fn lookup(&self, issuer: &str) -> Result<Option<ClientRecord>, AuthError> {
        if let Some(record) = self.records.get(issuer) {
            return Ok(Some(record.clone()));
        }

        let conn = self.db.acquire().await?;
        let mut rows = conn
            .as_ref()
            .query(
                "SELECT metadata_json FROM oidc_clients WHERE issuer = ?",
                libsql::params![issuer],
            )
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?
        {
            Some(row) => {
                let json: String = row.get(0).map_err(|e| AuthError::Storage(e.to_string()))?;
                let record: ClientRecord = serde_json::from_str(&json).map_err(|e| {
                    AuthError::Storage(format!("corrupt client record for {}: {}", issuer, e))
                })?;
                debug!(issuer = %issuer, "Client record loaded from storage");
                self.records.insert(issuer.to_string(), record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn persist(&self, record: &ClientRecord) -> Result<(), AuthError> {
        let json = serde_json::to_string(record)
            .map_err(|e| AuthError::Storage(format!("failed to encode client record: {}", e)))?;

        let conn = self.db.acquire().await?;
        conn.as_ref()
            .execute(
                r#"
                INSERT OR REPLACE INTO oidc_clients
                    (issuer, client_id, client_secret, redirect_uri, metadata_json, is_trusted, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
                (
                    record.issuer.as_str(),
                    record.client_id.as_str(),
                    record.client_secret.as_deref(),
                    record.redirect_uri.as_str(),
                    json.as_str(),
                    record.is_trusted as i64,
                    chrono::Utc::now().to_rfc3339().as_str(),
                ),
            )
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Build the trusted/local issuer's record without a network round
/// trip. The local issuer's endpoints follow the conventional layout
/// under its base URL.
pub fn trusted_client_record(
    issuer: &str,
    client_id: &str,
    client_secret: Option<&str>,
    redirect_uri: &str,
) -> Result<ClientRecord, AuthError> {
    let issuer = normalize_issuer(issuer)?;
    Ok(ClientRecord {
        client_id: client_id.to_string(),
        client_secret: client_secret.map(str::to_string),
        redirect_uri: redirect_uri.to_string(),
        provider: super::provider::ProviderMetadata {
            issuer: issuer.clone(),
            authorization_endpoint: format!("{}/authorize", issuer),
            token_endpoint: format!("{}/token", issuer),
            registration_endpoint: Some(format!("{}/register", issuer)),
            jwks_uri: Some(format!("{}/jwks", issuer)),
            userinfo_endpoint: Some(format!("{}/userinfo", issuer)),
            revocation_endpoint: None,
            end_session_endpoint: Some(format!("{}/logout", issuer)),
        },
        registration: Value::Null,
        dynamically_registered: false,
        is_trusted: true,
        issuer,
    })
}
