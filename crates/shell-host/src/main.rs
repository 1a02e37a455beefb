//! Serves a browser terminal page and bridges each shell connection to a
//! remote-shell process spawned on a fresh pseudo-terminal.
//!
//! A client opens a WebSocket on `<base>/ssh/<host>[/<dir>]`; the route is
//! resolved to a target host and optional starting directory, an `ssh`
//! process is spawned on a PTY, and bytes are relayed both ways until either
//! side goes away.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{OriginalUri, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod protocol;
mod route;
mod session;

use config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webshell_host=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::parse();
    settings.validate().context("invalid configuration")?;

    let listener = tokio::net::TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    info!("listening on {}", listener.local_addr()?);

    let app = build_router(Arc::new(settings));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ── Router ──────────────────────────────────────────────────────────

fn build_router(settings: Arc<Settings>) -> Router {
    let app = Router::new()
        .route("/", get(root))
        .route("/ssh", get(terminal_page))
        .route("/ssh/*target", get(shell_endpoint))
        .route("/assets/shell.js", get(controller_js))
        .layer(TraceLayer::new_for_http())
        .with_state(settings.clone());

    if settings.base_uri.is_empty() {
        app
    } else {
        Router::new().nest(&settings.base_uri, app)
    }
}

async fn root(State(settings): State<Arc<Settings>>) -> Redirect {
    Redirect::to(&format!("{}/ssh", settings.base_uri))
}

async fn terminal_page(State(settings): State<Arc<Settings>>) -> Html<String> {
    Html(render_page(&settings))
}

fn render_page(settings: &Settings) -> String {
    include_str!("../assets/index.html").replace("{{base}}", &settings.base_uri)
}

async fn controller_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        include_str!("../assets/shell.js"),
    )
}

/// Terminal endpoint: a WebSocket upgrade starts a shell session; a plain
/// GET serves the terminal page for that target.
async fn shell_endpoint(
    ws: Option<WebSocketUpgrade>,
    OriginalUri(uri): OriginalUri,
    State(settings): State<Arc<Settings>>,
) -> Response {
    let Some(ws) = ws else {
        return Html(render_page(&settings)).into_response();
    };

    match route::resolve(uri.path(), &settings.base_uri, &settings.default_host) {
        Ok(route) => ws.on_upgrade(move |socket| session::run(socket, route, settings)),
        Err(err) => {
            // Refuse before any session resources are allocated.
            warn!(path = uri.path(), %err, "refusing shell upgrade");
            (StatusCode::NOT_FOUND, "unknown shell route").into_response()
        }
    }
}
