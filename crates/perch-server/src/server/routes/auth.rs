//! Sign-in, sign-out, and provider-callback routes.
//!
//! - POST /signin - local password sign-in
//! - POST /accounts/new - create a local account
//! - POST /accounts/discover - resolve an identity URL and redirect to
//!   its issuer's authorization endpoint
//! - GET /rp/:issuer_id - provider callback for that issuer
//! - GET|POST /signout - clear the session
//! - GET /session - current session info

use crate::auth::flow::{self, CallbackParams, Workflow};
use crate::auth::{AuthError, NewAccount, Session};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Session cookie name.
pub const SESSION_COOKIE: &str = "perch_session";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/signin", post(signin_handler))
        .route("/accounts/new", post(new_account_handler))
        .route("/accounts/discover", post(discover_handler))
        .route("/rp", get(callback_missing_issuer_handler))
        .route("/rp/", get(callback_missing_issuer_handler))
        .route("/rp/:issuer_id", get(callback_handler))
        .route("/signout", get(signout_handler).post(signout_handler))
        .route("/goodbye", get(goodbye_handler))
        .route("/session", get(session_info_handler))
        .with_state(state)
}

/// Either `username`+`password` (local) or `webid` (federated).
#[derive(Debug, Deserialize)]
pub struct SigninRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub webid: Option<String>,
    #[serde(rename = "returnToUrl")]
    pub return_to_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SigninResponse {
    pub webid: String,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverRequest {
    pub webid: String,
    #[serde(rename = "returnToUrl")]
    pub return_to_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewAccountRequest {
    pub webid: String,
    pub password: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NewAccountResponse {
    pub webid: String,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfoResponse {
    pub session_id: String,
    pub webid: String,
    pub issuer: Option<String>,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Convert AuthError to an HTTP response.
fn auth_error_to_response(err: AuthError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, error_code) = match &err {
        AuthError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        AuthError::Discovery(_) => (StatusCode::BAD_REQUEST, "discovery_failed"),
        AuthError::Registration(_) => (StatusCode::BAD_GATEWAY, "registration_failed"),
        AuthError::TokenExchange(_) => (StatusCode::BAD_GATEWAY, "token_exchange_failed"),
        AuthError::InvalidCallback(_) => (StatusCode::BAD_REQUEST, "invalid_callback"),
        AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
        AuthError::AccountExists(_) => (StatusCode::CONFLICT, "account_exists"),
        AuthError::FederatedAuthDisabled => (StatusCode::FORBIDDEN, "federated_auth_disabled"),
        AuthError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        AuthError::Crypto(_) => (StatusCode::INTERNAL_SERVER_ERROR, "crypto_error"),
    };

    (
        status,
        Json(ErrorResponse::new(error_code, &err.to_string())),
    )
}

/// The session referenced by the cookie, or a fresh anonymous one.
fn load_or_create_session(state: &AppState, jar: &CookieJar) -> Session {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.get(cookie.value()))
        .unwrap_or_else(|| state.sessions.create())
}

fn session_cookie(session: &Session) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session.id.clone()))
        .path("/")
        .http_only(true)
        .build()
}

/// POST /signin
///
/// With `webid`, starts the federated flow: discover the issuer and
/// redirect to its authorization endpoint. With `username`+`password`,
/// local sign-in; the username may be a WebID or a registered email
/// address. Redirects to `returnToUrl` when one was given.
#[instrument(skip(state, jar, request))]
pub async fn signin_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    axum::Form(request): axum::Form<SigninRequest>,
) -> Response {
    if let Some(webid) = request.webid.as_deref().filter(|w| !w.trim().is_empty()) {
        return start_federated_flow(&state, jar, webid, request.return_to_url).await;
    }

    let (Some(username), Some(password)) = (
        request.username.as_deref(),
        request.password.as_deref(),
    ) else {
        return auth_error_to_response(AuthError::Validation(
            "either webid, or username and password, are required".to_string(),
        ))
        .into_response();
    };

    let mut session = load_or_create_session(&state, &jar);

    match state
        .binder
        .signin_local(username, password, &mut session)
        .await
    {
        Ok(webid) => {
            if let Some(url) = request.return_to_url {
                session.return_to_url = Some(url);
            }
            let target = flow::resume_user_flow(&mut session);
            state.sessions.update(session.clone());
            let jar = jar.add(session_cookie(&session));
            info!(webid = %webid, "Local sign-in complete");

            match target {
                Some(url) => (jar, Redirect::to(&url)).into_response(),
                None => (jar, Json(SigninResponse { webid })).into_response(),
            }
        }
        Err(err) => {
            warn!(error = %err, "Local sign-in failed");
            auth_error_to_response(err).into_response()
        }
    }
}

/// POST /accounts/new
///
/// Create a local password account and sign the session in as it.
#[instrument(skip(state, jar, request), fields(webid = %request.webid))]
pub async fn new_account_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<NewAccountRequest>,
) -> Response {
    let new_account = NewAccount {
        password: request.password,
        email: request.email,
        name: request.name,
    };

    match state.accounts.create_account(&request.webid, new_account).await {
        Ok(account) => {
            let mut session = load_or_create_session(&state, &jar);
            session.user_id = Some(account.webid.clone());
            session.identified = true;
            session.issuer = Some(state.config.issuer().to_string());
            state.sessions.update(session.clone());
            let jar = jar.add(session_cookie(&session));

            (
                StatusCode::CREATED,
                jar,
                Json(NewAccountResponse {
                    webid: account.webid,
                    email: account.email,
                }),
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, "Account creation failed");
            auth_error_to_response(err).into_response()
        }
    }
}

/// POST /accounts/discover
///
/// Resolve the issuer behind an identity URL, ensure a client is
/// registered with it, and redirect the user to its authorization
/// endpoint.
#[instrument(skip(state, jar, request), fields(webid = %request.webid))]
pub async fn discover_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    axum::Form(request): axum::Form<DiscoverRequest>,
) -> Response {
    start_federated_flow(&state, jar, &request.webid, request.return_to_url).await
}

/// Shared federated entry point for `/signin` (webid form) and
/// `/accounts/discover`: discover, register, redirect to authorize.
async fn start_federated_flow(
    state: &AppState,
    jar: CookieJar,
    webid: &str,
    return_to_url: Option<String>,
) -> Response {
    if !state.config.federated_auth {
        return auth_error_to_response(AuthError::FederatedAuthDisabled).into_response();
    }

    let result = async {
        let issuer = state.discovery.discover_issuer(webid).await?;
        let record = state.registry.get(&issuer).await?;
        flow::build_authorization_url(&record, Workflow::AuthorizationCode)
    }
    .await;

    match result {
        Ok(auth_url) => {
            let mut session = load_or_create_session(state, &jar);
            session.return_to_url = return_to_url;
            state.sessions.update(session.clone());
            let jar = jar.add(session_cookie(&session));

            info!(webid = %webid, "Redirecting to authorization endpoint");
            (jar, Redirect::to(&auth_url)).into_response()
        }
        Err(err) => {
            warn!(webid = %webid, error = %err, "Issuer discovery failed");
            auth_error_to_response(err).into_response()
        }
    }
}

/// GET /rp/:issuer_id
///
/// Provider callback for the issuer percent-encoded in the path.
/// Validates the callback, exchanges the code, verifies the ID token,
/// and only then binds the identity onto the session.
#[instrument(skip(state, jar, params))]
pub async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Path(issuer_id): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    if !state.config.federated_auth {
        return auth_error_to_response(AuthError::FederatedAuthDisabled).into_response();
    }

    match state.flow.handle_callback(&issuer_id, &params).await {
        Ok(identity) => {
            let webid = identity.web_id.clone();
            let mut session = load_or_create_session(&state, &jar);
            state.binder.bind_federated(&mut session, identity);
            let target = flow::resume_user_flow(&mut session);
            state.sessions.update(session.clone());
            let jar = jar.add(session_cookie(&session));
            info!(webid = %webid, "Federated sign-in complete");

            match target {
                Some(url) => (jar, Redirect::to(&url)).into_response(),
                None => (jar, Json(SigninResponse { webid })).into_response(),
            }
        }
        Err(err) => {
            error!(error = %err, "Provider callback failed");
            auth_error_to_response(err).into_response()
        }
    }
}

/// GET /rp and /rp/ carry no issuer and can never be valid callbacks.
pub async fn callback_missing_issuer_handler() -> Response {
    auth_error_to_response(AuthError::InvalidCallback(
        "missing issuer identifier in callback path".to_string(),
    ))
    .into_response()
}

/// GET|POST /signout
///
/// Clear the session's identity and redirect to the goodbye page.
/// Upstream token revocation is attempted first, best effort.
#[instrument(skip(state, jar))]
pub async fn signout_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Some(mut session) = state.sessions.get(cookie.value()) {
            state.binder.signout(&mut session).await;
            state.sessions.update(session);
        }
    }
    Redirect::to("/goodbye").into_response()
}

pub async fn goodbye_handler() -> &'static str {
    "You have been signed out.\n"
}

/// GET /session
///
/// Current session info, 404 when the session is anonymous or absent.
pub async fn session_info_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Response {
    let session = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.get(cookie.value()));

    match session {
        Some(session) if session.identified => {
            let webid = session.user_id.clone().unwrap_or_default();
            (
                StatusCode::OK,
                Json(SessionInfoResponse {
                    session_id: session.id,
                    webid,
                    issuer: session.issuer,
                }),
            )
                .into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "session_not_found",
                "no identified session",
            )),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::{ClientRecord, ProviderMetadata};
    use crate::config::ServerConfig;
    use crate::db::{Database, MigrationRunner};
    use axum::body::Body;
    use axum::http::{header, Request};
    use base64::prelude::*;
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_state() -> Arc<AppState> {
        test_state_with(ServerConfig::test_config()).await
    }

    async fn test_state_with(config: ServerConfig) -> Arc<AppState> {
        let db = Database::in_memory("test-routes").await.unwrap();
        MigrationRunner::global().run(&db).await.unwrap();
        Arc::new(AppState::new(config, db).unwrap())
    }

    async fn create_account(state: &AppState, webid: &str, password: &str, email: Option<&str>) {
        state
            .accounts
            .create_account(
                webid,
                NewAccount {
                    password: password.to_string(),
                    email: email.map(str::to_string),
                    name: None,
                },
            )
            .await
            .unwrap();
    }

    fn form_request(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    /// An HS256 JWK plus a matching signed ID token, so tests can run
    /// the full JWKS validation path without RSA keys.
    fn hs256_jwks_and_token(issuer: &str, audience: &str, sub: &str) -> (Value, String) {
        let secret = b"0123456789abcdef0123456789abcdef";
        let jwks = serde_json::json!({
            "keys": [{
                "kty": "oct",
                "kid": "test-key",
                "alg": "HS256",
                "k": BASE64_URL_SAFE_NO_PAD.encode(secret),
            }]
        });

        let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
        header.kid = Some("test-key".to_string());
        let claims = serde_json::json!({
            "iss": issuer,
            "aud": audience,
            "sub": sub,
            "exp": chrono::Utc::now().timestamp() + 600,
        });
        let token = encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap();
        (jwks, token)
    }

    #[tokio::test]
    async fn test_signin_success_sets_cookie() {
        let state = test_state().await;
        create_account(
            &state,
            "https://alice.example/card#me",
            "hunter2",
            Some("alice@example.com"),
        )
        .await;
        let app = router(state);

        let response = app
            .oneshot(form_request(
                "/signin",
                "username=alice%40example.com&password=hunter2".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("perch_session="));

        let json = body_json(response).await;
        assert_eq!(json["webid"], "https://alice.example/card#me");
    }

    #[tokio::test]
    async fn test_signin_bad_password() {
        let state = test_state().await;
        create_account(&state, "https://alice.example/card#me", "hunter2", None).await;
        let app = router(state);

        let response = app
            .oneshot(form_request(
                "/signin",
                "username=https%3A%2F%2Falice.example%2Fcard%23me&password=wrong".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn test_signin_redirects_to_return_url() {
        let state = test_state().await;
        create_account(&state, "https://alice.example/card#me", "hunter2", None).await;
        let app = router(state);

        let response = app
            .oneshot(form_request(
                "/signin",
                "username=https%3A%2F%2Falice.example%2Fcard%23me&password=hunter2\
                 &returnToUrl=https%3A%2F%2Fapp.example%2Fafter"
                    .to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://app.example/after"
        );
    }

    #[tokio::test]
    async fn test_signin_webid_starts_federated_flow() {
        let server = MockServer::start().await;
        let issuer = server.uri();
        mount_identity_provider(&server).await;

        let app = router(test_state().await);
        let webid = format!("{}/profile/card", issuer);
        let response = app
            .oneshot(form_request(
                "/signin",
                format!("webid={}", utf8_percent_encode(&webid, NON_ALPHANUMERIC)),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with(&format!("{}/authorize?", issuer)));
        assert!(location.contains("response_type=code"));
    }

    #[tokio::test]
    async fn test_signin_missing_credentials() {
        let app = router(test_state().await);

        // Neither webid nor username+password.
        for body in ["", "username=alice%40example.com", "password=hunter2"] {
            let response = app
                .clone()
                .oneshot(form_request("/signin", body.to_string()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let json = body_json(response).await;
            assert_eq!(json["error"], "validation_error");
        }
    }

    #[tokio::test]
    async fn test_new_account_then_conflict() {
        let state = test_state().await;
        let app = router(state);

        let request_body = r#"{"webid": "https://bob.example/card", "password": "secret123"}"#;
        let make_request = || {
            Request::builder()
                .method("POST")
                .uri("/accounts/new")
                .header("Content-Type", "application/json")
                .body(Body::from(request_body))
                .unwrap()
        };

        let response = app.clone().oneshot(make_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        // The new account is signed in on the spot.
        assert!(response.headers().contains_key(header::SET_COOKIE));

        let response = app.oneshot(make_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"], "account_exists");
    }

    /// The identity URL and the issuer live on the same mock server.
    async fn mount_identity_provider(server: &MockServer) {
        let issuer = server.uri();
        Mock::given(method("OPTIONS"))
            .and(path("/profile/card"))
            .respond_with(ResponseTemplate::new(204).insert_header(
                "Link",
                format!("<{}>; rel=\"oidc.issuer\"", issuer).as_str(),
            ))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{}/authorize", issuer),
                "token_endpoint": format!("{}/token", issuer),
                "registration_endpoint": format!("{}/register", issuer),
                "jwks_uri": format!("{}/jwks", issuer),
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "registered-client",
                "client_secret": "registered-secret",
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_discover_redirects_to_authorization_endpoint() {
        let server = MockServer::start().await;
        let issuer = server.uri();
        mount_identity_provider(&server).await;

        let app = router(test_state().await);
        let webid = format!("{}/profile/card", issuer);
        let response = app
            .oneshot(form_request(
                "/accounts/discover",
                format!(
                    "webid={}",
                    utf8_percent_encode(&webid, NON_ALPHANUMERIC)
                ),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.starts_with(&format!("{}/authorize?", issuer)));
        assert!(location.contains("client_id=registered-client"));
        assert!(location.contains("response_type=code"));
    }

    #[tokio::test]
    async fn test_discover_rejected_when_federated_auth_disabled() {
        let mut config = ServerConfig::test_config();
        config.federated_auth = false;
        let app = router(test_state_with(config).await);

        let response = app
            .oneshot(form_request(
                "/accounts/discover",
                "webid=https%3A%2F%2Falice.example%2Fcard".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["error"], "federated_auth_disabled");
    }

    #[tokio::test]
    async fn test_callback_full_federated_flow() {
        let server = MockServer::start().await;
        let issuer = server.uri();
        let (jwks, id_token) =
            hs256_jwks_and_token(&issuer, "client-1", "https://alice.example/card#me");

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "issued-access-token",
                "token_type": "Bearer",
                "id_token": id_token,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
            .mount(&server)
            .await;

        let state = test_state().await;
        state
            .registry
            .put(ClientRecord {
                issuer: issuer.clone(),
                client_id: "client-1".to_string(),
                client_secret: Some("secret".to_string()),
                redirect_uri: format!("https://perch.example/rp/{}", issuer),
                provider: ProviderMetadata {
                    issuer: issuer.clone(),
                    authorization_endpoint: format!("{}/authorize", issuer),
                    token_endpoint: format!("{}/token", issuer),
                    registration_endpoint: None,
                    jwks_uri: Some(format!("{}/jwks", issuer)),
                    userinfo_endpoint: None,
                    revocation_endpoint: None,
                    end_session_endpoint: None,
                },
                registration: Value::Null,
                dynamically_registered: true,
                is_trusted: false,
            })
            .await
            .unwrap();
        let app = router(state);

        let encoded = utf8_percent_encode(&issuer, NON_ALPHANUMERIC).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/rp/{}?code=auth-code-1", encoded))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::SET_COOKIE));
        let json = body_json(response).await;
        assert_eq!(json["webid"], "https://alice.example/card#me");
    }

    #[tokio::test]
    async fn test_callback_without_issuer_segment() {
        let app = router(test_state().await);

        for uri in ["/rp", "/rp/"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("GET")
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_callback_provider_error() {
        let app = router(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/rp/https%3A%2F%2Fop.example?error=access_denied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"], "token_exchange_failed");
    }

    #[tokio::test]
    async fn test_signout_redirects_to_goodbye() {
        let state = test_state().await;
        create_account(&state, "https://alice.example/card#me", "hunter2", None).await;
        let app = router(state.clone());

        let signin = app
            .clone()
            .oneshot(form_request(
                "/signin",
                "username=https%3A%2F%2Falice.example%2Fcard%23me&password=hunter2".to_string(),
            ))
            .await
            .unwrap();
        let cookie = signin
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/signout")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/goodbye");

        // The session survives but is anonymous again.
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/session")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_info_after_signin() {
        let state = test_state().await;
        create_account(&state, "https://alice.example/card#me", "hunter2", None).await;
        let app = router(state);

        let signin = app
            .clone()
            .oneshot(form_request(
                "/signin",
                "username=https%3A%2F%2Falice.example%2Fcard%23me&password=hunter2".to_string(),
            ))
            .await
            .unwrap();
        let cookie = signin
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/session")
                    .header(header::COOKIE, cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["webid"], "https://alice.example/card#me");
        assert_eq!(json["issuer"], "https://perch.example");
    }

    #[tokio::test]
    async fn test_session_info_anonymous() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
