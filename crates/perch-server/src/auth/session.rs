//! Sessions and the binding of verified identities onto them.
//!
//! Sessions are process-local and cookie-addressed. A session starts
//! anonymous; the binder attaches an identity to it only after the
//! local password check or the federated flow has fully succeeded, so
//! a session is never half-identified.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::accounts::PasswordAccountStore;
use super::flow::FederatedIdentity;
use super::registry::ClientRegistry;
use super::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session token, also the cookie value.
    pub id: String,
    /// The WebID this session is bound to, once identified.
    pub user_id: Option<String>,
    pub identified: bool,
    /// Issuer that vouched for the identity; the local server for
    /// password sign-ins.
    pub issuer: Option<String>,
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Where the user asked to land after sign-in completes.
    pub return_to_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            identified: false,
            issuer: None,
            access_token: None,
            id_token: None,
            refresh_token: None,
            return_to_url: None,
            // 30-day session by default.
            expires_at: Some(Utc::now() + Duration::days(30)),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|v| Utc::now() >= v).unwrap_or(false)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local session map keyed by session id.
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a fresh anonymous session.
    pub fn create(&self) -> Session {
        let session = Session::new();
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Look up a live session, dropping it if it has expired.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.get(session_id)?.clone();
        if session.is_expired() {
            drop(self.sessions.remove(session_id));
            return None;
        }
        Some(session)
    }

    /// Write back a modified session.
    pub fn update(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Attaches verified identities to sessions and tears them down.
pub struct SessionBinder {
    accounts: Arc<PasswordAccountStore>,
    registry: Arc<ClientRegistry>,
    http: Client,
    /// Issuer recorded on password-authenticated sessions.
    local_issuer: String,
}

impl SessionBinder {
    pub fn new(
        accounts: Arc<PasswordAccountStore>,
        registry: Arc<ClientRegistry>,
        http: Client,
        local_issuer: &str,
    ) -> Self {
        Self {
            accounts,
            registry,
            http,
            local_issuer: local_issuer.trim_end_matches('/').to_string(),
        }
    }

    /// Verify a password credential and bind the account's WebID to
    /// the session. The credential may be a WebID or a registered
    /// email address. Fails with a uniform invalid-credentials error
    /// whether the account is missing or the password is wrong.
    #[instrument(skip(self, password, session), fields(session_id = %session.id))]
    pub async fn signin_local(
        &self,
        username: &str,
        password: &str,
        session: &mut Session,
    ) -> Result<String, AuthError> {
        let account = self
            .accounts
            .find_account(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !self.accounts.verify_password(&account, password)? {
            return Err(AuthError::InvalidCredentials);
        }

        session.user_id = Some(account.webid.clone());
        session.identified = true;
        session.issuer = Some(self.local_issuer.clone());
        debug!(webid = %account.webid, "Local sign-in bound to session");
        Ok(account.webid)
    }

    /// Commit a verified federated identity onto the session. Called
    /// only after callback validation has fully succeeded.
    pub fn bind_federated(&self, session: &mut Session, identity: FederatedIdentity) {
        debug!(session_id = %session.id, webid = %identity.web_id, issuer = %identity.issuer,
               "Federated sign-in bound to session");
        session.user_id = Some(identity.web_id);
        session.identified = true;
        session.issuer = Some(identity.issuer);
        session.access_token = Some(identity.access_token);
        session.id_token = Some(identity.id_token);
        session.refresh_token = identity.refresh_token;
    }

    /// Clear the session's identity, revoking upstream tokens first
    /// when the issuer exposes a revocation endpoint. Revocation is
    /// best effort; local sign-out always completes.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn signout(&self, session: &mut Session) {
        if let (Some(issuer), Some(token)) = (&session.issuer, &session.access_token) {
            if issuer != &self.local_issuer {
                self.revoke_upstream(issuer, token).await;
            }
        }

        session.user_id = None;
        session.identified = false;
        session.issuer = None;
        session.access_token = None;
        session.id_token = None;
        session.refresh_token = None;
        session.return_to_url = None;
        debug!("Session signed out");
    }

    async fn revoke_upstream(&self, issuer: &str, access_token: &str) {
        let record = match self.registry.get(issuer).await {
            Ok(record) => record,
            Err(e) => {
                warn!(issuer = %issuer, error = %e, "No client record for revocation");
                return;
            }
        };
        let Some(endpoint) = record.provider.revocation_endpoint.as_deref() else {
            debug!(issuer = %issuer, "Issuer exposes no revocation endpoint");
            return;
        };

        let mut params = vec![
            ("token", access_token),
            ("token_type_hint", "access_token"),
            ("client_id", record.client_id.as_str()),
        ];
        if let Some(secret) = record.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        match self.http.post(endpoint).form(&params).send().await {
            Ok(res) if res.status().is_success() => {
                debug!(issuer = %issuer, "Upstream token revoked");
            }
            Ok(res) => {
                warn!(issuer = %issuer, status = %res.status(), "Token revocation rejected");
            }
            Err(e) => {
                warn!(issuer = %issuer, error = %e, "Token revocation failed");
            }
        }
    }
}
