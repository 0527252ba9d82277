use async_trait::async_trait;
use sepa_proto::{BindingSet, QueryRequest, UpdateRequest, UpdateResponse};

use crate::error::{EndpointError, PrepareError};

/// Interface to the backing RDF store.
///
/// The broker issues at most one mutating request at a time (updates are
/// admitted serially); queries may be issued concurrently by SPU workers
/// during post-update processing. Implementations over the SPARQL 1.1
/// protocol live outside this crate; tests provide an in-memory store.
#[async_trait]
pub trait SparqlEndpoint: Send + Sync + 'static {
    async fn query(&self, request: &QueryRequest) -> Result<BindingSet, EndpointError>;

    async fn update(&self, update: &PreparedUpdate) -> Result<UpdateResponse, EndpointError>;
}

/// An update after the stateless pre-processing rewrite: trimmed text plus
/// the graph sets carried as SPARQL protocol parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpdate {
    pub sparql: String,
    pub using_graphs: Vec<String>,
    pub using_named_graphs: Vec<String>,
    pub principal: Option<String>,
}

/// Stateless rewrite of an incoming update into its endpoint-facing form.
/// Rejects requests the endpoint could never accept so they fail before any
/// barrier is armed.
pub fn prepare_update(request: &UpdateRequest) -> Result<PreparedUpdate, PrepareError> {
    let sparql = request.sparql.trim();
    if sparql.is_empty() {
        return Err(PrepareError("empty update".to_string()));
    }
    Ok(PreparedUpdate {
        sparql: sparql.to_string(),
        using_graphs: request.using_graphs.clone(),
        using_named_graphs: request.using_named_graphs.clone(),
        principal: request.principal.clone(),
    })
}
