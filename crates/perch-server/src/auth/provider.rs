//! OIDC provider metadata and dynamic client registration.
//!
//! For each new issuer this server fetches the well-known discovery
//! document and, unless a pre-shared client is configured for that
//! issuer, registers itself dynamically to obtain a client id/secret.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::AuthError;

/// Scope requested for every federated sign-in.
pub const OIDC_SCOPE: &str = "openid profile";

const GRANT_TYPES: &[&str] = &[
    "authorization_code",
    "implicit",
    "refresh_token",
    "client_credentials",
];
const RESPONSE_TYPES: &[&str] = &["code", "id_token token", "code id_token token"];

/// The subset of an issuer's discovery document this server uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// One client registration, uniquely keyed by normalized issuer.
///
/// Created on first successful registration and effectively immutable
/// afterwards; every request for that issuer shares this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub provider: ProviderMetadata,
    /// Extra metadata returned by the registration endpoint.
    #[serde(default)]
    pub registration: Value,
    /// False when a pre-shared client id/secret was reused.
    pub dynamically_registered: bool,
    pub is_trusted: bool,
}

/// Pre-shared credentials for an issuer that does not need dynamic
/// registration (typically the local/trusted issuer).
#[derive(Debug, Clone)]
pub struct PresharedClient {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    client_name: String,
    redirect_uris: Vec<String>,
    grant_types: &'a [&'a str],
    response_types: &'a [&'a str],
    scope: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(flatten)]
    extra: Value,
}

/// Fetch an issuer's well-known discovery document.
pub async fn fetch_metadata(client: &Client, issuer: &str) -> Result<ProviderMetadata, AuthError> {
    let issuer = issuer.trim_end_matches('/');
    let url = format!("{}/.well-known/openid-configuration", issuer);

    let res = client
        .get(&url)
        .send()
        .await
        .map_err(|e| AuthError::Registration(format!("metadata fetch failed: {}", e)))?;

    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(AuthError::Registration(format!(
            "metadata endpoint {}: {}",
            status, body
        )));
    }

    res.json::<ProviderMetadata>()
        .await
        .map_err(|e| AuthError::Registration(format!("invalid discovery document: {}", e)))
}

/// Performs discovery plus dynamic registration for new issuers.
pub struct RegistrationProtocol {
    http: Client,
    /// Callback base; per-issuer redirect URIs hang off this.
    redirect_uri_base: String,
    preshared: Option<PresharedClient>,
}

impl RegistrationProtocol {
    pub fn new(http: Client, redirect_uri_base: &str, preshared: Option<PresharedClient>) -> Self {
        Self {
            http,
            redirect_uri_base: redirect_uri_base.trim_end_matches('/').to_string(),
            preshared,
        }
    }

    /// The redirect URI registered for an issuer. The trusted/local
    /// issuer uses the bare callback base; any other issuer gets the
    /// percent-encoded issuer appended so the callback can be routed
    /// back without a stored reverse lookup.
    pub fn redirect_uri_for(&self, issuer: &str, is_trusted: bool) -> String {
        if is_trusted {
            self.redirect_uri_base.clone()
        } else {
            format!(
                "{}/{}",
                self.redirect_uri_base,
                utf8_percent_encode(issuer, NON_ALPHANUMERIC)
            )
        }
    }

    /// Register this server with an issuer, producing a ClientRecord.
    ///
    /// Fails with a registration error on metadata or registration
    /// problems and leaves no partial record behind.
    #[instrument(skip(self))]
    pub async fn register(&self, issuer: &str) -> Result<ClientRecord, AuthError> {
        let provider = fetch_metadata(&self.http, issuer).await?;

        if let Some(preshared) = &self.preshared {
            if preshared.issuer.trim_end_matches('/') == issuer {
                debug!(issuer = %issuer, "Reusing pre-shared client credentials");
                return Ok(ClientRecord {
                    issuer: issuer.to_string(),
                    client_id: preshared.client_id.clone(),
                    client_secret: preshared.client_secret.clone(),
                    redirect_uri: self.redirect_uri_for(issuer, true),
                    provider,
                    registration: Value::Null,
                    dynamically_registered: false,
                    is_trusted: true,
                });
            }
        }

        let registration_endpoint = provider.registration_endpoint.as_deref().ok_or_else(|| {
            AuthError::Registration(format!(
                "issuer {} does not support dynamic registration",
                issuer
            ))
        })?;

        let redirect_uri = self.redirect_uri_for(issuer, false);
        let request = RegistrationRequest {
            client_name: client_name_for(issuer),
            redirect_uris: vec![redirect_uri.clone()],
            grant_types: GRANT_TYPES,
            response_types: RESPONSE_TYPES,
            scope: OIDC_SCOPE,
        };

        let res = self
            .http
            .post(registration_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthError::Registration(format!("registration failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::Registration(format!(
                "registration endpoint {}: {}",
                status, body
            )));
        }

        let registered = res.json::<RegistrationResponse>().await.map_err(|e| {
            AuthError::Registration(format!("invalid registration response: {}", e))
        })?;

        info!(issuer = %issuer, client_id = %registered.client_id, "Dynamically registered client");

        Ok(ClientRecord {
            issuer: issuer.to_string(),
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            redirect_uri,
            provider,
            registration: registered.extra,
            dynamically_registered: true,
            is_trusted: false,
        })
    }
}

/// Display name submitted at registration, derived from the issuer.
fn client_name_for(issuer: &str) -> String {
    let host = url::Url::parse(issuer)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    match host {
        Some(host) => format!("Perch at {}", host),
        None => "Perch".to_string(),
    }
}
