//! Local password account storage.
//!
//! Accounts are keyed by normalized WebID (an absolute HTTP(S) URL).
//! An optional email address is kept in a secondary unique index so an
//! account can also be looked up by email at sign-in.
//!
//! ## Security Model
//!
//! - Passwords are hashed using Argon2id (memory-hard, recommended by OWASP)
//! - Plaintext passwords are never stored
//! - Each account has a unique random salt
//! - Verification goes through the hash's own comparison primitive, so
//!   "no such account" and "wrong password" are indistinguishable by timing

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use chrono::Utc;
use tracing::{debug, instrument};
use url::Url;

use crate::db::Database;

use super::AuthError;

/// A stored local account. The password hash never leaves this module.
#[derive(Debug, Clone)]
pub struct LocalAccount {
    /// WebID, the primary key (normalized absolute URL).
    pub webid: String,
    /// Optional email (normalized lowercase), secondary unique index.
    pub email: Option<String>,
    /// Optional display name.
    pub name: Option<String>,
    /// Argon2id password hash.
    password_hash: String,
}

/// Input for account creation.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub password: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Store for local accounts and their email index.
#[derive(Clone)]
pub struct PasswordAccountStore {
    db: Database,
    hasher: Argon2<'static>,
}

impl PasswordAccountStore {
    /// Create a store with the default Argon2id cost (tuned for
    /// roughly hundred-millisecond verification on commodity hardware).
    pub fn new(db: Database) -> Self {
        Self {
            db,
            hasher: Argon2::default(),
        }
    }

    /// Create a store with explicit Argon2 cost parameters.
    pub fn with_params(db: Database, params: Params) -> Self {
        Self {
            db,
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Create a new local account.
    ///
    /// Fails with a validation error if the WebID is not an absolute
    /// HTTP(S) URL, the password is empty, or the email is already
    /// registered to a different WebID. The primary row is written
    /// before the email index entry; both are keyed writes, so a retry
    /// of the same creation repairs a failure between the two.
    #[instrument(skip(self, request), fields(webid = %webid))]
    pub async fn create_account(
        &self,
        webid: &str,
        request: NewAccount,
    ) -> Result<LocalAccount, AuthError> {
        let webid = normalize_webid(webid)?;
        if request.password.is_empty() {
            return Err(AuthError::Validation("password cannot be empty".to_string()));
        }
        let email = request.email.as_deref().map(normalize_email).transpose()?;

        if self.find_by_webid(&webid).await?.is_some() {
            return Err(AuthError::AccountExists(webid));
        }
        if let Some(email) = &email {
            if let Some(owner) = self.email_owner(email).await? {
                if owner != webid {
                    return Err(AuthError::Validation(format!(
                        "email '{}' is already registered",
                        email
                    )));
                }
            }
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = self
            .hasher
            .hash_password(request.password.as_bytes(), &salt)
            .map_err(|e| AuthError::Crypto(format!("Failed to hash password: {}", e)))?
            .to_string();

        let now = Utc::now().to_rfc3339();
        let conn = self.db.acquire().await?;
        conn.as_ref()
            .execute(
                r#"
                INSERT INTO accounts (webid, email, name, password_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                (
                    webid.as_str(),
                    email.as_deref(),
                    request.name.as_deref(),
                    password_hash.as_str(),
                    now.as_str(),
                    now.as_str(),
                ),
            )
            .await
            .map_err(db_err)?;

        if let Some(email) = &email {
            conn.as_ref()
                .execute(
                    "INSERT OR REPLACE INTO accounts_by_email (email, webid) VALUES (?, ?)",
                    (email.as_str(), webid.as_str()),
                )
                .await
                .map_err(db_err)?;
        }

        debug!(webid = %webid, "Local account created");

        Ok(LocalAccount {
            webid,
            email,
            name: request.name,
            password_hash,
        })
    }

    /// Exact lookup by normalized key: a WebID URL, or an email which
    /// resolves through the index. No partial matching.
    pub async fn find_account(&self, key: &str) -> Result<Option<LocalAccount>, AuthError> {
        if let Ok(webid) = normalize_webid(key) {
            return self.find_by_webid(&webid).await;
        }
        let email = normalize_email(key)?;
        match self.email_owner(&email).await? {
            Some(webid) => self.find_by_webid(&webid).await,
            None => Ok(None),
        }
    }

    /// Verify a candidate password against a stored account.
    pub fn verify_password(
        &self,
        account: &LocalAccount,
        candidate: &str,
    ) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(&account.password_hash)
            .map_err(|e| AuthError::Crypto(format!("Invalid password hash: {}", e)))?;
        Ok(self
            .hasher
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok())
    }

    /// Replace an account's password with a freshly salted hash.
    #[instrument(skip(self, new_password))]
    pub async fn update_password(&self, webid: &str, new_password: &str) -> Result<(), AuthError> {
        let webid = normalize_webid(webid)?;
        if new_password.is_empty() {
            return Err(AuthError::Validation("password cannot be empty".to_string()));
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = self
            .hasher
            .hash_password(new_password.as_bytes(), &salt)
            .map_err(|e| AuthError::Crypto(format!("Failed to hash password: {}", e)))?
            .to_string();

        let conn = self.db.acquire().await?;
        let affected = conn
            .as_ref()
            .execute(
                "UPDATE accounts SET password_hash = ?, updated_at = ? WHERE webid = ?",
                (
                    password_hash.as_str(),
                    Utc::now().to_rfc3339().as_str(),
                    webid.as_str(),
                ),
            )
            .await
            .map_err(db_err)?;

        if affected == 0 {
            return Err(AuthError::Validation(format!("no account for {}", webid)));
        }

        debug!(webid = %webid, "Password updated");
        Ok(())
    }

    async fn find_by_webid(&self, webid: &str) -> Result<Option<LocalAccount>, AuthError> {
        let conn = self.db.acquire().await?;
        let mut rows = conn
            .as_ref()
            .query(
                "SELECT webid, email, name, password_hash FROM accounts WHERE webid = ?",
                libsql::params![webid],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(LocalAccount {
                webid: row.get(0).map_err(db_err)?,
                email: row.get(1).ok(),
                name: row.get(2).ok(),
                password_hash: row.get(3).map_err(db_err)?,
            })),
            None => Ok(None),
        }
    }

    async fn email_owner(&self, email: &str) -> Result<Option<String>, AuthError> {
        let conn = self.db.acquire().await?;
        let mut rows = conn
            .as_ref()
            .query(
                "SELECT webid FROM accounts_by_email WHERE email = ?",
                libsql::params![email],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }
}

/// Normalize a WebID: absolute HTTP(S) URL, trailing slash stripped.
pub fn normalize_webid(raw: &str) -> Result<String, AuthError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AuthError::Validation(format!("invalid WebID '{}': {}", raw, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AuthError::Validation(format!(
            "WebID must be an http(s) URL, got '{}'",
            raw
        )));
    }
    Ok(url.to_string().trim_end_matches('/').to_string())
}

/// Normalize an email: trimmed, lowercased, must contain '@'.
fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::Validation(format!("invalid email '{}'", raw)));
    }
    Ok(email)
}

fn db_err<E: std::fmt::Display>(e: E) -> AuthError {
    AuthError::Storage(e.to_string())
}
