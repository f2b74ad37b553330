use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tokio::time::Instant;

use crate::{metrics, state::AppState};

pub async fn admission_control(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let socket_addr = request
        .extensions()
        .get::<SocketAddr>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|value| value.0)
        });
    let key = state.gate.client_key(request.headers(), socket_addr);

    let verdict = state
        .gate
        .evaluate(key, Instant::now().into_std(), Utc::now());
    metrics::record_verdict(verdict.allowed);

    if !verdict.allowed {
        tracing::warn!(
            client = %verdict.key,
            count = verdict.count,
            limit = verdict.limit,
            reset = %verdict.reset,
            retry_after_secs = verdict.retry_after_secs(),
            "rate limit exceeded"
        );
        return verdict.into_rejection();
    }

    let mut response = next.run(request).await;
    verdict.apply_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use axum::{
        body::to_bytes,
        http::{header::RETRY_AFTER, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        admission::{RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET},
        config::Config,
    };

    fn app(limit: usize, trust_proxy: bool) -> (Router, Arc<AtomicUsize>) {
        let state = AppState::new(Config {
            rate_limit: limit,
            rate_window: Duration::from_secs(60),
            trust_proxy,
            ..Config::default()
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let router = Router::new()
            .route(
                "/",
                get(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
            .layer(from_fn_with_state(state.clone(), admission_control))
            .with_state(state);

        (router, hits)
    }

    fn request_from(peer: &str) -> Request<Body> {
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        request
    }

    #[tokio::test]
    async fn allowed_requests_reach_downstream_with_headers() {
        let (router, hits) = app(2, false);

        let response = router
            .clone()
            .oneshot(request_from("192.0.2.1:4000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&RATELIMIT_LIMIT], "2");
        assert_eq!(response.headers()[&RATELIMIT_REMAINING], "1");
        assert!(response.headers().contains_key(&RATELIMIT_RESET));
        assert!(response.headers().get(RETRY_AFTER).is_none());

        let response = router
            .oneshot(request_from("192.0.2.1:4001"))
            .await
            .unwrap();
        assert_eq!(response.headers()[&RATELIMIT_REMAINING], "0");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn denied_requests_short_circuit() {
        let (router, hits) = app(1, false);

        router
            .clone()
            .oneshot(request_from("192.0.2.1:4000"))
            .await
            .unwrap();
        let response = router
            .clone()
            .oneshot(request_from("192.0.2.1:4000"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[&RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[RETRY_AFTER], "60");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Too many requests");
        assert_eq!(body["retry_after"], 60);

        // Another client is unaffected.
        let response = router
            .oneshot(request_from("192.0.2.2:4000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_limit_never_reaches_downstream() {
        let (router, hits) = app(0, false);

        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(request_from("192.0.2.1:4000"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forwarded_clients_are_limited_separately_behind_a_proxy() {
        let (router, _) = app(1, true);

        for client in ["203.0.113.1", "203.0.113.2"] {
            let mut request = request_from("10.0.0.1:80");
            request
                .headers_mut()
                .insert("x-forwarded-for", client.parse().unwrap());
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn concurrent_requests_admit_exactly_the_limit() {
        let (router, hits) = app(10, false);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move {
                    router
                        .oneshot(request_from("192.0.2.50:1234"))
                        .await
                        .unwrap()
                        .status()
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() == StatusCode::OK {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
