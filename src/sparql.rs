//! SPARQL endpoint client.

use crate::error::{Result, ServiceError};
use serde::Deserialize;
use std::collections::HashMap;

/// One bound term of a result row. Only the lexical value matters here;
/// datatype and language tags are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct SparqlTerm {
    pub value: String,
}

pub type SparqlRow = HashMap<String, SparqlTerm>;

#[derive(Clone)]
pub struct SparqlClient {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Deserialize)]
struct SparqlResults {
    bindings: Vec<SparqlRow>,
}

impl SparqlClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        SparqlClient {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub async fn query(&self, query: &str) -> Result<Vec<SparqlRow>> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("query", query), ("format", "json")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Upstream(format!(
                "SPARQL endpoint returned HTTP {status}"
            )));
        }
        let decoded: SparqlResponse = response.json().await?;
        Ok(decoded.results.bindings)
    }
}

/// `$name` substitution for the configured query templates.
pub fn substitute(template: &str, variables: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("${name}"), value);
    }
    out
}
