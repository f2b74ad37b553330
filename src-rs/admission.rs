use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;

use crate::rate_limit::LimiterStore;

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Derives the identity a request is throttled under.
pub trait KeyExtractor: Send + Sync {
    fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String;
}

/// Keys requests by the caller's network address.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceAddressKey {
    pub trust_proxy: bool,
}

impl KeyExtractor for SourceAddressKey {
    fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if self.trust_proxy {
            if let Some(value) = headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
            {
                if let Some(first) = value.split(',').next() {
                    let candidate = first.trim();
                    if !candidate.is_empty() {
                        return normalize_address(candidate);
                    }
                }
            }

            if let Some(value) = headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
            {
                let candidate = value.trim();
                if !candidate.is_empty() {
                    return normalize_address(candidate);
                }
            }
        }

        peer.map(|address| canonical_ip(address.ip()).to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn normalize_address(raw: &str) -> String {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return canonical_ip(ip).to_string();
    }
    if let Ok(socket) = raw.parse::<SocketAddr>() {
        return canonical_ip(socket.ip()).to_string();
    }
    raw.to_ascii_lowercase()
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub key: String,
    pub allowed: bool,
    pub limit: usize,
    pub count: usize,
    pub remaining: usize,
    pub reset: DateTime<Utc>,
    pub retry_after: Duration,
}

#[derive(Debug, Serialize)]
struct RejectionBody {
    error: &'static str,
    message: &'static str,
    retry_after: u64,
}

impl Verdict {
    /// `Retry-After` in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        if let Ok(reset) =
            HeaderValue::from_str(&self.reset.to_rfc3339_opts(SecondsFormat::Secs, true))
        {
            headers.insert(RATELIMIT_RESET, reset);
        }
    }

    pub fn into_rejection(self) -> Response {
        let retry_after = self.retry_after_secs();
        let body = RejectionBody {
            error: "Too many requests",
            message: "Rate limit exceeded. Please try again later.",
            retry_after,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        self.apply_headers(headers);
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}

#[derive(Clone)]
pub struct AdmissionGate {
    store: Arc<LimiterStore>,
    extractor: Arc<dyn KeyExtractor>,
}

impl AdmissionGate {
    pub fn new(store: Arc<LimiterStore>, extractor: Arc<dyn KeyExtractor>) -> Self {
        Self { store, extractor }
    }

    pub fn store(&self) -> &Arc<LimiterStore> {
        &self.store
    }

    pub fn client_key(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        self.extractor.client_key(headers, peer)
    }

    /// `now` drives the window; `wall_now` is the same moment on the UTC clock and
    /// only anchors the reset timestamp reported to the caller.
    pub fn evaluate(&self, key: String, now: Instant, wall_now: DateTime<Utc>) -> Verdict {
        let decision = self.store.record_and_check(&key, now);

        let until_reset = decision.reset_at.saturating_duration_since(now);
        let reset = chrono::Duration::from_std(until_reset)
            .ok()
            .and_then(|delta| wall_now.checked_add_signed(delta))
            .unwrap_or(wall_now);

        Verdict {
            key,
            allowed: decision.allowed,
            limit: decision.limit,
            count: decision.count,
            remaining: decision.remaining,
            reset,
            retry_after: decision.retry_after,
        }
    }
}
