//! Public error types for the broker core.
//!
//! Each gateway-facing operation returns its own enum; the `From`
//! conversions at the bottom produce the wire-stable `ErrorResponse`
//! carried back through the gateway.

use sepa_proto::{kind, ErrorResponse, Sid};
use thiserror::Error;

/// Which barrier a timeout occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    Pre,
    Post,
}

impl std::fmt::Display for BarrierPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => write!(f, "pre_update_processing"),
            Self::Post => write!(f, "post_update_processing"),
        }
    }
}

/// Failures reported by the backing RDF endpoint.
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    /// The endpoint rejected the principal's credentials
    #[error("authorization rejected")]
    Auth,

    /// The endpoint could not be reached
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The endpoint answered with a store-level failure
    #[error("endpoint failed: {0}")]
    Store(String),
}

/// The stateless rewrite ahead of the endpoint rejected an update.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PrepareError(pub String);

/// Error type for update admission.
///
/// Returned from: `SpuManager::update`
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("pre-update processing failed: {0}")]
    PreProcessing(#[from] PrepareError),

    /// A barrier wait expired before the pool drained
    #[error("{phase} barrier timed out")]
    Timeout { phase: BarrierPhase },

    /// Explicit cancellation. Distinct from deadline expiry; no public
    /// operation currently produces it.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Error type for subscription establishment.
///
/// Returned from: `SpuManager::subscribe`
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("invalid subscribe request: {0}")]
    BadRequest(String),

    /// The initial evaluation of the predicate failed; the processing unit
    /// is destroyed before registration.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Error type for unsubscription.
///
/// Returned from: `SpuManager::unsubscribe`
#[derive(Debug, Error)]
pub enum UnsubscribeError {
    #[error("unknown subscriber: {0}")]
    NotFound(Sid),
}

/// Error type for one-shot query forwarding.
///
/// Returned from: `SpuManager::query`
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Registry-internal consistency failures; recoverable by the caller.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a processing unit already exists for this fingerprint")]
    AlreadyExists,

    #[error("unknown subscriber: {0}")]
    NotFound(Sid),
}

fn endpoint_response(err: &EndpointError) -> ErrorResponse {
    match err {
        EndpointError::Auth => ErrorResponse::new(401, kind::AUTH_ERROR, None),
        other => ErrorResponse::new(500, kind::ENDPOINT_ERROR, Some(other.to_string())),
    }
}

impl From<&UpdateError> for ErrorResponse {
    fn from(err: &UpdateError) -> Self {
        match err {
            UpdateError::PreProcessing(e) => ErrorResponse::new(500, kind::PRE_UPDATE_PROCESSING_FAILED, Some(e.to_string())),
            UpdateError::Timeout { phase } => ErrorResponse::new(500, kind::TIMEOUT, Some(phase.to_string())),
            UpdateError::Cancelled => ErrorResponse::new(500, kind::CANCELLED, None),
            UpdateError::Endpoint(e) => endpoint_response(e),
        }
    }
}

impl From<&SubscribeError> for ErrorResponse {
    fn from(err: &SubscribeError) -> Self {
        match err {
            SubscribeError::BadRequest(e) => ErrorResponse::new(400, kind::BAD_REQUEST, Some(e.clone())),
            SubscribeError::Endpoint(e) => endpoint_response(e),
        }
    }
}

impl From<&UnsubscribeError> for ErrorResponse {
    fn from(err: &UnsubscribeError) -> Self {
        match err {
            // reported as a 500 for wire compatibility even though the fault
            // is on the caller's side
            UnsubscribeError::NotFound(sid) => ErrorResponse::new(500, kind::SID_NOT_FOUND, Some(sid.to_string())),
        }
    }
}

impl From<&QueryError> for ErrorResponse {
    fn from(err: &QueryError) -> Self {
        match err {
            QueryError::BadRequest(e) => ErrorResponse::new(400, kind::BAD_REQUEST, Some(e.clone())),
            QueryError::Endpoint(e) => endpoint_response(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_response_names_the_phase() {
        let response: ErrorResponse = (&UpdateError::Timeout { phase: BarrierPhase::Pre }).into();
        assert_eq!(response.code, 500);
        assert_eq!(response.kind, kind::TIMEOUT);
        assert_eq!(response.body.as_deref(), Some("pre_update_processing"));
    }

    #[test]
    fn auth_maps_to_401_everywhere() {
        let from_update: ErrorResponse = (&UpdateError::Endpoint(EndpointError::Auth)).into();
        let from_subscribe: ErrorResponse = (&SubscribeError::Endpoint(EndpointError::Auth)).into();
        assert_eq!(from_update.code, 401);
        assert_eq!(from_subscribe.kind, kind::AUTH_ERROR);
    }

    #[test]
    fn sid_not_found_preserved_as_500() {
        let sid = Sid::test(7);
        let response: ErrorResponse = (&UnsubscribeError::NotFound(sid)).into();
        assert_eq!((response.code, response.kind.as_str()), (500, kind::SID_NOT_FOUND));
    }
}
