//! `/v1` request handlers, one module per resource.

pub mod activity;
pub mod control;
pub mod events;
pub mod health;
pub mod jobs;
pub mod leases;
pub mod locks;
pub mod query;
pub mod rules;
pub mod runs;
pub mod schedules;
pub mod triggers;

use axum::http::HeaderMap;
use serde::de::DeserializeOwned;

use crate::errors::AppError;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const FORCE_APPLY_HEADER: &str = "x-force-apply";

/// Trimmed, non-empty header value.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name).is_some_and(|raw| {
        matches!(
            raw.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// JSON body that may be omitted entirely.
pub(crate) fn optional_body<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))
}
