mod admission;
mod config;
mod handlers;
mod metrics;
mod middleware;
mod rate_limit;
mod state;
mod sweeper;
mod window;

use std::{
    collections::HashSet,
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use axum::{
    http::{HeaderValue, Method},
    middleware as axum_middleware,
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use state::AppState;
use sweeper::Sweeper;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!(
        limit = config.rate_limit,
        window_secs = config.rate_window.as_secs_f64(),
        idle_ttl_secs = config.idle_ttl.as_secs_f64(),
        sweep_interval_secs = config.sweep_interval.as_secs_f64(),
        trust_proxy = config.trust_proxy,
        "Rate limiter configured"
    );

    let state = AppState::new(config.clone());
    let sweeper = Sweeper::spawn(state.limiter(), config.sweep_interval);

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let served = if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            let grace = config.request_timeout;
            async move {
                shutdown_signal().await;
                handle.graceful_shutdown(Some(grace));
            }
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
    };

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    tracing::warn!("server shutdown");

    served
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(&state.config.allow_origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_handler))
        .fallback(handlers::not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::admission_control,
        ))
        .with_state(state.clone())
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn allowed_origins(origins: &[String]) -> AllowOrigin {
    if origins.is_empty() {
        return AllowOrigin::from(Any);
    }

    let values = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::error!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();

    AllowOrigin::list(values)
}

fn valid_tls_paths(config: &Config) -> Option<(&Path, &Path)> {
    match (config.tls_cert_path.as_deref(), config.tls_key_path.as_deref()) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = cert_path.exists();
            let key_exists = key_path.exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path.display(), "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path.display(), "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path.display(), "TLS certificate path set without a key path");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path.display(), "TLS key path set without a certificate path");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{
            header::{
                ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, RETRY_AFTER,
            },
            Request, StatusCode,
        },
    };
    use tower::ServiceExt;

    use super::*;
    use crate::admission::{RATELIMIT_LIMIT, RATELIMIT_REMAINING};

    fn router(limit: usize) -> Router {
        build_router(AppState::new(Config {
            rate_limit: limit,
            rate_window: Duration::from_secs(60),
            ..Config::default()
        }))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn every_route_is_evaluated() {
        let app = router(3);

        let health = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(health.headers()[&RATELIMIT_LIMIT], "3");
        assert_eq!(health.headers()[&RATELIMIT_REMAINING], "2");

        let missing = app.clone().oneshot(get("/nope")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.headers()[&RATELIMIT_REMAINING], "1");

        let metrics = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let body = to_bytes(metrics.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("admission_requests_total"));

        let throttled = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(throttled.headers()[RETRY_AFTER], "60");
    }

    #[tokio::test]
    async fn health_reports_tracked_clients() {
        let app = router(5);

        let response = app.oneshot(get("/health")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["rateLimit"]["limit"], 5);
        assert_eq!(body["rateLimit"]["trackedClients"], 1);
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/health")
            .header(ORIGIN, origin)
            .header(ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn listed_origins_are_echoed_and_others_refused() {
        let app = build_router(AppState::new(Config {
            rate_limit: 2,
            allow_origins: vec!["https://app.example".to_string(), "bad\norigin".to_string()],
            ..Config::default()
        }));

        let listed = app
            .clone()
            .oneshot(preflight("https://app.example"))
            .await
            .unwrap();
        assert_eq!(
            listed.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example"
        );

        let other = app
            .clone()
            .oneshot(preflight("https://other.example"))
            .await
            .unwrap();
        assert!(other.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());

        // Preflights are answered before admission and use no quota.
        let health = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(health.headers()[&RATELIMIT_REMAINING], "1");
    }

    #[tokio::test]
    async fn any_origin_is_allowed_when_none_are_listed() {
        let response = router(2)
            .oneshot(preflight("https://anywhere.example"))
            .await
            .unwrap();
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[test]
    fn tls_requires_both_paths_to_exist() {
        let existing = env::temp_dir();
        let missing = existing.join("admission-server-missing.pem");

        let plain = Config::default();
        assert!(valid_tls_paths(&plain).is_none());

        let half = Config {
            tls_cert_path: Some(existing.clone()),
            ..Config::default()
        };
        assert!(valid_tls_paths(&half).is_none());

        let absent = Config {
            tls_cert_path: Some(existing.clone()),
            tls_key_path: Some(missing),
            ..Config::default()
        };
        assert!(valid_tls_paths(&absent).is_none());

        let both = Config {
            tls_cert_path: Some(existing.clone()),
            tls_key_path: Some(existing.clone()),
            ..Config::default()
        };
        assert_eq!(
            valid_tls_paths(&both),
            Some((existing.as_path(), existing.as_path()))
        );
    }
}
