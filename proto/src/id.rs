use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::DecodeError;

/// Identifier of a Subscription Processing Unit. One SPU exists per distinct
/// subscription fingerprint; every notification carries the id of the SPU
/// that emitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpuId(Ulid);

impl SpuId {
    pub fn new() -> Self { Self(Ulid::new()) }

    /// To be used only for testing
    pub fn test(id: u64) -> Self { Self(Ulid::from_parts(id, 0)) }
}

impl Default for SpuId {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Display for SpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "sepa://spuid/{}", self.0) }
}

impl std::str::FromStr for SpuId {
    type Err = DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let suffix = s.strip_prefix("sepa://spuid/").ok_or(DecodeError::InvalidScheme)?;
        Ok(Self(suffix.parse().map_err(|_| DecodeError::InvalidUlid)?))
    }
}

/// Identifier of a single subscriber attached to an SPU. Unique across the
/// process; minted by the registry on subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sid(Ulid);

impl Sid {
    pub fn new() -> Self { Self(Ulid::new()) }

    /// To be used only for testing
    pub fn test(id: u64) -> Self { Self(Ulid::from_parts(id, 0)) }
}

impl Default for Sid {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "sepa://subscription/{}", self.0) }
}

impl std::str::FromStr for Sid {
    type Err = DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let suffix = s.strip_prefix("sepa://subscription/").ok_or(DecodeError::InvalidScheme)?;
        Ok(Self(suffix.parse().map_err(|_| DecodeError::InvalidUlid)?))
    }
}

/// Gateway-scoped connection identifier. The gateway mints one per wire
/// connection and uses it for connection-scoped mass unsubscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid(String);

impl Gid {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

impl From<&str> for Gid {
    fn from(id: &str) -> Self { Self(id.to_string()) }
}

impl From<String> for Gid {
    fn from(id: String) -> Self { Self(id) }
}
