//! HTTP server assembly.
//!
//! Wires the auth components into an axum router, advertises the local
//! issuer on OPTIONS requests, and runs the listener with graceful
//! shutdown.

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::auth::discovery::OIDC_ISSUER_REL;
use crate::auth::provider::PresharedClient;
use crate::auth::{
    trusted_client_record, AuthFlowController, ClientRegistry, IssuerDiscovery,
    PasswordAccountStore, RegistrationProtocol, SessionBinder, SessionStore,
};
use crate::config::ServerConfig;
use crate::db::Database;

pub mod routes;

/// Shared application state behind every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub db: Database,
    pub accounts: Arc<PasswordAccountStore>,
    pub discovery: Arc<IssuerDiscovery>,
    pub registry: Arc<ClientRegistry>,
    pub sessions: Arc<SessionStore>,
    pub flow: AuthFlowController,
    pub binder: SessionBinder,
    /// Precomputed `Link` header advertising the local issuer.
    issuer_link: HeaderValue,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        let preshared = config.trusted_issuer.as_ref().map(|t| PresharedClient {
            issuer: t.issuer.clone(),
            client_id: t.client_id.clone(),
            client_secret: t.client_secret.clone(),
        });
        let protocol =
            RegistrationProtocol::new(http.clone(), &config.rp_redirect_base(), preshared);

        let accounts = Arc::new(PasswordAccountStore::new(db.clone()));
        let discovery = Arc::new(IssuerDiscovery::new(http.clone()));
        let registry = Arc::new(ClientRegistry::new(db.clone(), protocol));
        let sessions = Arc::new(SessionStore::new());
        let flow = AuthFlowController::new(http.clone(), registry.clone());
        let binder = SessionBinder::new(
            accounts.clone(),
            registry.clone(),
            http,
            config.issuer(),
        );

        let issuer_link = HeaderValue::from_str(&format!(
            "<{}>; rel=\"{}\"",
            config.issuer(),
            OIDC_ISSUER_REL
        ))?;

        Ok(Self {
            config,
            db,
            accounts,
            discovery,
            registry,
            sessions,
            flow,
            binder,
            issuer_link,
        })
    }

    /// Seed the trusted issuer's client record, if one is configured.
    /// Runs before the listener accepts requests, so the record is
    /// always present without a discovery round trip.
    pub async fn seed_trusted_issuer(&self) -> Result<()> {
        let Some(trusted) = &self.config.trusted_issuer else {
            return Ok(());
        };
        let record = trusted_client_record(
            &trusted.issuer,
            &trusted.client_id,
            trusted.client_secret.as_deref(),
            &self.config.rp_redirect_base(),
        )?;
        self.registry.put(record).await?;
        info!(issuer = %trusted.issuer, "Trusted issuer seeded");
        Ok(())
    }
}

/// Answer any OPTIONS request with the local issuer advertisement.
async fn advertise_issuer(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        let mut res = StatusCode::NO_CONTENT.into_response();
        res.headers_mut()
            .insert(header::LINK, state.issuer_link.clone());
        return res;
    }
    next.run(req).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        ),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable" })),
        ),
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::auth::router(state.clone()))
        .route("/health", get(health_handler).with_state(state.clone()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            advertise_issuer,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Bind the listener and serve until shutdown.
pub async fn start(config: ServerConfig, db: Database) -> Result<()> {
    let state = Arc::new(AppState::new(config, db)?);
    state.seed_trusted_issuer().await?;

    let addr = state.config.bind_addr;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MigrationRunner;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let db = Database::in_memory("test-server").await.unwrap();
        MigrationRunner::global().run(&db).await.unwrap();
        Arc::new(AppState::new(ServerConfig::test_config(), db).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_options_advertises_issuer() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/any/path/at/all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(header::LINK).unwrap(),
            "<https://perch.example>; rel=\"oidc.issuer\""
        );
    }

    #[tokio::test]
    async fn test_seed_trusted_issuer() {
        let db = Database::in_memory("test-server-seed").await.unwrap();
        MigrationRunner::global().run(&db).await.unwrap();

        let mut config = ServerConfig::test_config();
        config.trusted_issuer = Some(crate::config::TrustedIssuerConfig {
            issuer: "https://perch.example".to_string(),
            client_id: "local-client".to_string(),
            client_secret: Some("local-secret".to_string()),
        });

        let state = AppState::new(config, db).unwrap();
        state.seed_trusted_issuer().await.unwrap();

        let record = state.registry.get("https://perch.example").await.unwrap();
        assert_eq!(record.client_id, "local-client");
        assert!(record.is_trusted);
    }
}
