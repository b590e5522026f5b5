// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP front end for the snapshot-resolution cache server.
//!
//! This crate is a thin wrapper around [`rosdistro_engine::Engine`]: it
//! adds no cache semantics of its own, only routing, compression,
//! tracing, and response timeouts.

pub mod api;
pub mod middleware;

use axum::Router;
use rosdistro_engine::Engine;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Wall-clock budget for a single request, comfortably larger than any
/// expected cold-start repository materialization.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The orchestration engine this server fronts.
    pub engine: Engine,
}

/// Build the Axum router: routes, compression, tracing, and the
/// per-request response timeout.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", axum::routing::get(api::healthz))
        .route("/get/{dist}/{*reference}", axum::routing::get(api::get_snapshot))
        .with_state(state)
        .layer(TimeoutLayer::new(RESPONSE_TIMEOUT))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
}

/// Bind `addr` and serve `state` until the process is terminated. Kept
/// here rather than in the CLI crate so callers need not depend on
/// `axum` directly.
pub async fn serve(state: Arc<AppState>, addr: &str) -> std::io::Result<()> {
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rosdistro_config::{CacheConfig, DistroConfig, GeneralConfig, RosdistroConfig, StoreConfig};
    use rosdistro_store::Store;
    use tower::ServiceExt;

    fn test_config() -> RosdistroConfig {
        RosdistroConfig {
            distro: DistroConfig {
                repository: "https://example.invalid/rosdistro".to_string(),
                distributions: vec!["humble".to_string()],
                branches: vec!["master".to_string()],
                python_version: 3,
            },
            database: StoreConfig::default(),
            general: GeneralConfig { parallelism: 2 },
            cache: CacheConfig::default(),
        }
    }

    fn test_state(distro_repository: String) -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("distro.db")).unwrap();
        std::mem::forget(dir);
        let mut config = test_config();
        config.distro.repository = distro_repository;
        let engine = Engine::with_defaults(config, store);
        Arc::new(AppState { engine })
    }

    fn init_index_repo(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .status()
                .unwrap();
        };
        run(&["init", "-q"]);
        std::fs::write(dir.join("index.yaml"), "distributions: {}\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-qm", "initial"]);
        run(&["tag", "master"]);
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_app(test_state("unused".to_string()));
        let response = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_distro_is_not_found() {
        let checkout = tempfile::tempdir().unwrap();
        init_index_repo(checkout.path());
        let url = format!("file://{}", checkout.path().display());

        let app = build_app(test_state(url));
        let response = app
            .oneshot(Request::builder().uri("/get/nonexistent/master.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
