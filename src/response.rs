use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::header::{CACHE_CONTROL, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::throttle::{QuotaStatus, ThrottleSettings};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body of `GET /api/rate-limit-status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub remaining: u32,
    pub limit: u32,
    /// Milliseconds since the Unix epoch.
    pub reset_time: u64,
}

impl StatusResponse {
    pub fn from_status(status: &QuotaStatus) -> Self {
        Self {
            remaining: status.remaining,
            limit: status.limit,
            reset_time: epoch_millis(reset_wall_time(status)),
        }
    }
}

impl IntoResponse for StatusResponse {
    fn into_response(self) -> Response {
        let mut resp = Json(self).into_response();
        resp.headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        resp
    }
}

#[derive(Debug, Serialize)]
pub struct ExplainResponse {
    pub explanation: String,
}

/// 429 body returned when a client is in cooldown.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDenial {
    pub error: String,
    pub message: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: u64,
    pub retry_after: String,
    #[serde(skip)]
    headers: HeaderMap,
}

impl RateLimitDenial {
    pub fn from_status(status: &QuotaStatus) -> Self {
        let wait = Duration::from_secs(ceil_secs(status.reset_in));
        let mut headers = rate_limit_headers(status);
        headers.insert(RETRY_AFTER, HeaderValue::from(wait.as_secs()));

        Self {
            error: "rate_limit_exceeded".to_string(),
            message: format!(
                "Rate limit exceeded. You can make {} requests before a cooldown. Try again in {}.",
                status.limit,
                wait_estimate(status.reset_in)
            ),
            limit: status.limit,
            remaining: 0,
            reset_time: epoch_millis(reset_wall_time(status)),
            retry_after: humantime::format_duration(wait).to_string(),
            headers,
        }
    }
}

impl IntoResponse for RateLimitDenial {
    fn into_response(self) -> Response {
        let headers = self.headers.clone();
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response();
        resp.headers_mut().extend(headers);
        resp
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub tracked_clients: usize,
    #[serde(flatten)]
    pub throttle: ThrottleSettings,
}

impl HealthResponse {
    pub fn healthy(uptime: Duration, tracked_clients: usize, throttle: ThrottleSettings) -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
            tracked_clients,
            throttle,
        }
    }
}

/// `X-RateLimit-*` headers describing `status`.
pub fn rate_limit_headers(status: &QuotaStatus) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));

    let reset = humantime::format_rfc3339_millis(reset_wall_time(status)).to_string();
    if let Ok(value) = HeaderValue::from_str(&reset) {
        headers.insert(X_RATELIMIT_RESET, value);
    }

    headers
}

/// Map the monotonic reset instant onto the wall clock.
pub fn reset_wall_time(status: &QuotaStatus) -> SystemTime {
    SystemTime::now() + status.reset_in
}

pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Human-readable wait, rounded up to whole minutes.
pub fn wait_estimate(wait: Duration) -> String {
    let minutes = ceil_secs(wait).div_ceil(60).max(1);
    if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{} minutes", minutes)
    }
}

fn ceil_secs(wait: Duration) -> u64 {
    if wait.subsec_nanos() > 0 {
        wait.as_secs() + 1
    } else {
        wait.as_secs()
    }
}
