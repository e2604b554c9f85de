use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::client_id::ClientId;
use crate::error::{GatewayError, Result};
use crate::response::{rate_limit_headers, ExplainResponse, HealthResponse, StatusResponse};
use crate::throttle::Throttle;
use crate::upstream::{explain_prompt, Generator};

/// Header a caller can use to supply their own upstream credential.
pub const USER_API_KEY_HEADER: &str = "x-api-key";

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub throttle: Arc<Throttle>,
    pub generator: Arc<dyn Generator>,
    /// Shared credential protected by the throttle.
    pub default_api_key: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        throttle: Arc<Throttle>,
        generator: Arc<dyn Generator>,
        default_api_key: Option<String>,
    ) -> Self {
        Self {
            throttle,
            generator,
            default_api_key: default_api_key.filter(|key| !key.trim().is_empty()),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainRequest {
    #[serde(default)]
    pub topic: Option<String>,
    /// Accepted as either a JSON string or number.
    #[serde(default)]
    pub age: Option<Value>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ExplainRequest {
    fn topic_and_age(&self) -> Result<(String, String)> {
        let topic = self
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|topic| !topic.is_empty());

        let age = match &self.age {
            Some(Value::String(age)) => Some(age.trim().to_string()).filter(|age| !age.is_empty()),
            Some(Value::Number(age)) => Some(age.to_string()),
            _ => None,
        };

        match (topic, age) {
            (Some(topic), Some(age)) => Ok((topic.to_string(), age)),
            _ => Err(GatewayError::InvalidRequest(
                "Topic and age are required".to_string(),
            )),
        }
    }

    fn user_api_key<'a>(&'a self, headers: &'a HeaderMap) -> Option<&'a str> {
        let non_blank = |key: &'a str| Some(key.trim()).filter(|key| !key.is_empty());

        self.api_key.as_deref().and_then(non_blank).or_else(|| {
            headers
                .get(USER_API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(non_blank)
        })
    }
}

/// Generate an explanation, charging the shared credential's quota unless the
/// caller brings their own key.
pub async fn explain(
    State(state): State<AppState>,
    client: ClientId,
    headers: HeaderMap,
    Json(payload): Json<ExplainRequest>,
) -> Result<Response> {
    let (topic, age) = payload.topic_and_age()?;
    let prompt = explain_prompt(&topic, &age);

    if let Some(user_key) = payload.user_api_key(&headers) {
        debug!(client_id = %client, "Caller supplied credential, throttle bypassed");
        let explanation = state.generator.generate(user_key, &prompt).await?;
        return Ok(Json(ExplainResponse { explanation }).into_response());
    }

    let api_key = state.default_api_key.as_deref().ok_or_else(|| {
        GatewayError::Unavailable(
            "No shared API key is configured; supply your own key".to_string(),
        )
    })?;

    let status = state.throttle.query(client.as_str());
    if status.remaining == 0 {
        return Err(GatewayError::RateLimited(status));
    }

    let admission = state.throttle.record(client.as_str());
    if !admission.allowed {
        return Err(GatewayError::RateLimited(admission.status));
    }

    info!(
        client_id = %client,
        remaining = admission.status.remaining,
        "Forwarding explanation request on shared credential"
    );

    let explanation = state.generator.generate(api_key, &prompt).await?;

    let mut resp = Json(ExplainResponse { explanation }).into_response();
    resp.headers_mut()
        .extend(rate_limit_headers(&admission.status));
    Ok(resp)
}

/// Report the caller's quota without consuming it
pub async fn rate_limit_status(State(state): State<AppState>, client: ClientId) -> StatusResponse {
    StatusResponse::from_status(&state.throttle.query(client.as_str()))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse::healthy(
        state.started_at.elapsed(),
        state.throttle.tracked_clients(),
        state.throttle.settings().clone(),
    ))
}
