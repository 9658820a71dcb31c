//! Router assembly and HTTP serving.

pub mod handlers;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose;
use base64::Engine as _;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::AppState;

/// Builds the full application router.
///
/// Lease routes sit behind the optional basic-auth gate; the Kubernetes
/// probes and the metrics endpoint stay open so the platform can always
/// reach them. The catch-panic layer turns a programming defect into a 500
/// instead of retiring the process.
pub fn build_router(state: Arc<AppState>) -> Router {
    let lease_routes = Router::new()
        .route("/", get(handlers::provider_list))
        .route(
            "/:owner/:repo/:base_ref",
            get(handlers::provider_details).delete(handlers::provider_clear),
        )
        .route("/:owner/:repo/:base_ref/acquire", post(handlers::acquire))
        .route("/:owner/:repo/:base_ref/release", post(handlers::release))
        .route_layer(middleware::from_fn_with_state(state.clone(), basic_auth));

    Router::new()
        .route("/k8s/liveness", get(handlers::liveness))
        .route("/k8s/readiness", get(handlers::readiness))
        .route("/metrics", get(handlers::metrics))
        .merge(lease_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

/// Basic-auth gate for the lease routes. A no-op when no users are
/// configured.
async fn basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(users) = &state.basic_auth_users else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|credentials| {
            credentials
                .split_once(':')
                .map(|(user, password)| (user.to_string(), password.to_string()))
        })
        .map(|(user, password)| {
            users
                .get(&user)
                .is_some_and(|expected| *expected == password)
        })
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        warn!("rejected request with missing or invalid credentials");
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"mq-lease-server\"")],
        )
            .into_response()
    }
}

/// Binds the listener and serves until a termination signal arrives.
pub async fn serve(app: Router, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received termination signal, shutting down"),
    }
}
