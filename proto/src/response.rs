use serde::{Deserialize, Serialize};

use crate::{
    bindings::BindingSet,
    id::{Sid, SpuId},
};

/// Stable error kind strings crossing the gateway boundary.
pub mod kind {
    pub const PRE_UPDATE_PROCESSING_FAILED: &str = "pre_update_processing_failed";
    pub const TIMEOUT: &str = "timeout";
    pub const AUTH_ERROR: &str = "auth_error";
    pub const ENDPOINT_ERROR: &str = "endpoint_error";
    pub const SID_NOT_FOUND: &str = "sid_not_found";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const CANCELLED: &str = "cancelled";
}

/// The endpoint's answer to an applied update, relayed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub status: u16,
    pub body: String,
}

impl UpdateResponse {
    pub fn ok() -> Self { Self { status: 200, body: String::new() } }

    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub sid: Sid,
    pub spuid: SpuId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// The predicate's current result set, also delivered as the subscriber's
    /// `InitialSnapshot` notification.
    pub initial: BindingSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub sid: Sid,
}

/// Error surface of every gateway-facing operation. `kind` values are the
/// constants in [`kind`] and are stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: u16, kind: &str, body: Option<String>) -> Self { Self { code, kind: kind.to_string(), body } }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.kind)?;
        if let Some(body) = &self.body {
            write!(f, ": {body}")?;
        }
        Ok(())
    }
}
