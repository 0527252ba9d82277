use thiserror::Error;

/// Failures decoding identifiers received from the wire.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized id scheme")]
    InvalidScheme,
    #[error("invalid ULID")]
    InvalidUlid,
}
