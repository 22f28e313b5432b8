//! The federated authorization-code round trip.
//!
//! From a resolved client record this module builds the authorization
//! redirect, validates the provider's callback, exchanges the
//! authorization code for tokens, and checks the ID token against the
//! issuer's JWKS before any identity is produced.

use base64::prelude::*;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use percent_encoding::percent_decode_str;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

use super::provider::{ClientRecord, OIDC_SCOPE};
use super::registry::ClientRegistry;
use super::session::Session;
use super::AuthError;

/// Supported OIDC workflows, a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    AuthorizationCode,
    Implicit,
}

impl Workflow {
    fn response_type(self) -> &'static str {
        match self {
            Workflow::AuthorizationCode => "code",
            Workflow::Implicit => "id_token token",
        }
    }
}

/// A verified federated identity, produced only after the code
/// exchange and ID-token validation both succeed.
#[derive(Debug, Clone)]
pub struct FederatedIdentity {
    pub web_id: String,
    pub issuer: String,
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: Option<String>,
}

/// Query parameters a provider sends to the callback endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

/// Build the absolute authorization-endpoint URL for a workflow.
///
/// Pure apart from logging: no state is recorded here.
pub fn build_authorization_url(
    record: &ClientRecord,
    workflow: Workflow,
) -> Result<String, AuthError> {
    let mut url = Url::parse(&record.provider.authorization_endpoint).map_err(|e| {
        AuthError::Validation(format!(
            "issuer {} has an invalid authorization endpoint: {}",
            record.issuer, e
        ))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", &record.client_id);
        query.append_pair("redirect_uri", &record.redirect_uri);
        query.append_pair("response_type", workflow.response_type());
        query.append_pair("scope", OIDC_SCOPE);
        if workflow == Workflow::Implicit {
            query.append_pair("nonce", &generate_nonce());
        }
    }

    debug!(issuer = %record.issuer, ?workflow, "Built authorization URL");
    Ok(url.into())
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes[..]);
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

/// Orchestrates callback validation and the code-for-token exchange.
pub struct AuthFlowController {
    http: Client,
    registry: Arc<ClientRegistry>,
}

impl AuthFlowController {
    pub fn new(http: Client, registry: Arc<ClientRegistry>) -> Self {
        Self { http, registry }
    }

    /// Handle a provider callback for the issuer encoded in the path.
    ///
    /// Produces a verified identity or fails without side effects; a
    /// failed code exchange is never retried with the same code. The
    /// caller commits the identity onto the session afterwards, so no
    /// partial session state can exist.
    #[instrument(skip(self, params))]
    pub async fn handle_callback(
        &self,
        issuer_id: &str,
        params: &CallbackParams,
    ) -> Result<FederatedIdentity, AuthError> {
        if issuer_id.trim().is_empty() {
            return Err(AuthError::InvalidCallback(
                "missing issuer identifier in callback path".to_string(),
            ));
        }
        let issuer = percent_decode_str(issuer_id)
            .decode_utf8()
            .map_err(|e| AuthError::InvalidCallback(format!("undecodable issuer id: {}", e)))?
            .into_owned();

        if let Some(error) = &params.error {
            let detail = params.error_description.as_deref().unwrap_or("");
            return Err(AuthError::TokenExchange(format!(
                "provider returned '{}': {}",
                error, detail
            )));
        }
        let code = params.code.as_deref().ok_or_else(|| {
            AuthError::InvalidCallback("missing authorization code".to_string())
        })?;

        let record = self.registry.get(&issuer).await?;
        let tokens = self.exchange_code(&record, code).await?;

        let id_token = tokens.id_token.as_deref().ok_or_else(|| {
            AuthError::TokenExchange("provider did not return an id_token".to_string())
        })?;
        let claims = self.validate_id_token(&record, id_token).await?;
        let web_id = claims
            .get("sub")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AuthError::TokenExchange("id_token has no subject claim".to_string())
            })?;

        debug!(issuer = %record.issuer, web_id = %web_id, "Callback verified");

        Ok(FederatedIdentity {
            web_id,
            issuer: record.issuer,
            access_token: tokens.access_token,
            id_token: id_token.to_string(),
            refresh_token: tokens.refresh_token,
        })
    }

    async fn exchange_code(
        &self,
        record: &ClientRecord,
        code: &str,
    ) -> Result<TokenResponse, AuthError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("client_id", record.client_id.as_str()),
            ("code", code),
            ("redirect_uri", record.redirect_uri.as_str()),
        ];
        if let Some(secret) = record.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let res = self
            .http
            .post(&record.provider.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!(
                "token endpoint {}: {}",
                status, body
            )));
        }

        res.json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("invalid token response: {}", e)))
    }

    async fn validate_id_token(
        &self,
        record: &ClientRecord,
        id_token: &str,
    ) -> Result<Value, AuthError> {
        let header = decode_header(id_token)?;
        let jwks_uri = record.provider.jwks_uri.as_deref().ok_or_else(|| {
            AuthError::TokenExchange(format!("issuer {} exposes no JWKS", record.issuer))
        })?;
        let jwks = self.fetch_jwks(jwks_uri).await?;

        let jwk = select_jwk(&jwks, header.kid.as_deref())
            .ok_or_else(|| AuthError::TokenExchange("no jwk available for token".to_string()))?;
        let key = DecodingKey::from_jwk(jwk)?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[record.client_id.as_str()]);
        validation.set_issuer(&[record.provider.issuer.as_str()]);
        validation.validate_exp = true;

        let decoded = decode::<Value>(id_token, &key, &validation)?;
        Ok(decoded.claims)
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet, AuthError> {
        let res = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!(
                "jwks endpoint {}: {}",
                status, body
            )));
        }

        res.json::<JwkSet>()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("invalid JWKS payload: {}", e)))
    }
}

fn select_jwk<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    if let Some(kid) = kid {
        if let Some(found) = jwks
            .keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
        {
            return Some(found);
        }
    }
    jwks.keys.first()
}

/// Where to send the user once a sign-in flow completes.
///
/// Takes the saved pre-auth return URL from the session, appending the
/// access token when one was issued. Returns `None` when no return URL
/// was saved; callers then answer with the bound identity directly
/// instead of redirecting.
pub fn resume_user_flow(session: &mut Session) -> Option<String> {
    let return_to = session.return_to_url.take()?;
    match (&session.access_token, Url::parse(&return_to)) {
        (Some(token), Ok(mut url)) => {
            url.query_pairs_mut().append_pair("access_token", token);
            Some(url.into())
        }
        _ => Some(return_to),
    }
}
