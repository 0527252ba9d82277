use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::Gid;

/// A long-lived subscription predicate as received from the gateway.
///
/// Two requests with equal [`fingerprint`](Self::fingerprint)s resolve to the
/// same processing unit; alias, connection id and principal are presentation
/// and authorization concerns and do not participate in that identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub sparql: String,
    pub default_graphs: Vec<String>,
    pub named_graphs: Vec<String>,
    pub alias: Option<String>,
    pub gid: Gid,
    pub principal: Option<String>,
}

impl SubscribeRequest {
    pub fn new(sparql: impl Into<String>, gid: impl Into<Gid>) -> Self {
        Self { sparql: sparql.into(), default_graphs: Vec::new(), named_graphs: Vec::new(), alias: None, gid: gid.into(), principal: None }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_default_graph(mut self, uri: impl Into<String>) -> Self {
        self.default_graphs.push(uri.into());
        self
    }

    pub fn with_named_graph(mut self, uri: impl Into<String>) -> Self {
        self.named_graphs.push(uri.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn fingerprint(&self) -> Fingerprint { Fingerprint::of(&self.sparql, &self.default_graphs, &self.named_graphs) }
}

/// Canonical identity of a subscribe request: a digest over the query text
/// and the two graph URI sets. Graph lists compare as sets; the query text
/// compares verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(sparql: &str, default_graphs: &[String], named_graphs: &[String]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(sparql.as_bytes());
        for uri in default_graphs.iter().collect::<BTreeSet<_>>() {
            hasher.update([0u8]);
            hasher.update(uri.as_bytes());
        }
        for uri in named_graphs.iter().collect::<BTreeSet<_>>() {
            hasher.update([1u8]);
            hasher.update(uri.as_bytes());
        }
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // first 8 bytes are plenty for log correlation
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A SPARQL 1.1 update as received from the gateway. Opaque to the broker
/// beyond the attributes carried here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub sparql: String,
    pub using_graphs: Vec<String>,
    pub using_named_graphs: Vec<String>,
    pub principal: Option<String>,
}

impl UpdateRequest {
    pub fn new(sparql: impl Into<String>) -> Self {
        Self { sparql: sparql.into(), using_graphs: Vec::new(), using_named_graphs: Vec::new(), principal: None }
    }

    pub fn with_using_graph(mut self, uri: impl Into<String>) -> Self {
        self.using_graphs.push(uri.into());
        self
    }

    pub fn with_using_named_graph(mut self, uri: impl Into<String>) -> Self {
        self.using_named_graphs.push(uri.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

/// A one-shot SPARQL query forwarded to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sparql: String,
    pub default_graphs: Vec<String>,
    pub named_graphs: Vec<String>,
    pub principal: Option<String>,
}

impl QueryRequest {
    pub fn new(sparql: impl Into<String>) -> Self {
        Self { sparql: sparql.into(), default_graphs: Vec::new(), named_graphs: Vec::new(), principal: None }
    }
}

impl From<&SubscribeRequest> for QueryRequest {
    fn from(req: &SubscribeRequest) -> Self {
        Self {
            sparql: req.sparql.clone(),
            default_graphs: req.default_graphs.clone(),
            named_graphs: req.named_graphs.clone(),
            principal: req.principal.clone(),
        }
    }
}
