//! Client identifier resolution for throttling.

use std::convert::Infallible;
use std::fmt;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

/// Key shared by every client whose address cannot be resolved.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Opaque throttle key for the caller, derived from proxy headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(resolve_client_id(&parts.headers))
    }
}

/// First `x-forwarded-for` entry, then `x-real-ip`, then [`UNKNOWN_CLIENT`].
pub fn resolve_client_id(headers: &HeaderMap) -> ClientId {
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    let resolved = forwarded
        .or_else(|| header_str(headers, "x-real-ip").map(str::trim).filter(|ip| !ip.is_empty()))
        .unwrap_or(UNKNOWN_CLIENT);

    ClientId(resolved.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
