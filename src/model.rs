//! Request and response types of the public API.
//!
//! Shapes follow the OpenRefine reconciliation-service protocol: scored
//! candidates, the data-extension rows/meta envelope and the suggest
//! result lists.

use crate::value::Cell;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;

/// One reconciliation query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconQuery {
    #[serde(default)]
    pub query: Option<String>,
    /// A single type id or a list of them.
    #[serde(default, rename = "type")]
    pub entity_type: Option<OneOrMany>,
    #[serde(default)]
    pub type_strict: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyConstraint>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        }
    }
}

/// A property constraint of a query. The value may be a string, a number
/// or an object carrying an `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyConstraint {
    pub pid: String,
    #[serde(default)]
    pub v: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypeRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Feature {
    pub id: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: Vec<TypeRef>,
    pub score: f64,
    pub features: Vec<Feature>,
    #[serde(rename = "match")]
    pub match_flag: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub result: Vec<ScoredCandidate>,
}

/// Payload of the data-extension API.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtendPayload {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub properties: Vec<ExtendProperty>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendProperty {
    pub id: String,
    /// Raw settings, echoed back in `meta`; the engine reads
    /// `limit`/`rank`/`references`/`count` out of it.
    #[serde(default)]
    pub settings: Option<Json>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtendResponse {
    pub rows: HashMap<String, HashMap<String, Vec<Cell>>>,
    pub meta: Vec<ExtendMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtendMeta {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Json>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub expected_type: Option<TypeRef>,
}

/// One suggest hit (types, properties and entities share the shape).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Suggestion {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestResponse {
    pub result: Vec<Suggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlyoutResponse {
    pub id: String,
    pub html: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalResponse {
    #[serde(rename = "type")]
    pub base_type: String,
    pub properties: Vec<Suggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringResponse {
    pub stats: Vec<crate::monitoring::BucketRates>,
}
