//! MediaWiki API client.
//!
//! Thin reqwest wrapper over the handful of `action=` calls the service
//! needs. One [`reqwest::Client`] is shared process-wide (connection pool,
//! per-host cap, user agent); this type only adds the endpoint and the
//! JSON decoding.

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::time::Duration;

/// Upstream constraint: `wbgetentities` accepts at most 50 ids per call.
pub const MAX_ENTITIES_PER_FETCH: usize = 50;

#[derive(Clone)]
pub struct MediawikiClient {
    http: reqwest::Client,
    endpoint: String,
}

/// One hit of `wbsearchentities`.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub label: Option<String>,
    pub description: Option<String>,
}

/// Builds the shared HTTP client used for all upstream calls.
pub fn build_http_client(config: &ServiceConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .pool_max_idle_per_host(config.max_connections_per_host)
        .build()
        .map_err(|err| ServiceError::Upstream(format!("failed to build HTTP client: {err}")))
}

impl MediawikiClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        MediawikiClient {
            http,
            endpoint: endpoint.into(),
        }
    }

    async fn get_json(&self, url: &str, params: &[(&str, &str)]) -> Result<Json> {
        let response = self
            .http
            .get(url)
            .query(params)
            .query(&[("format", "json")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Upstream(format!(
                "{url} returned HTTP {status}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn api(&self, params: &[(&str, &str)]) -> Result<Json> {
        self.get_json(&self.endpoint, params).await
    }

    /// `wbgetentities` for up to [`MAX_ENTITIES_PER_FETCH`] ids. Returns the
    /// raw entity payloads keyed by id; ids the instance does not know are
    /// absent from the map.
    pub async fn get_entities(&self, ids: &[String]) -> Result<HashMap<String, Json>> {
        debug_assert!(ids.len() <= MAX_ENTITIES_PER_FETCH);
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = ids.join("|");
        let response = self
            .api(&[
                ("action", "wbgetentities"),
                ("props", "aliases|labels|descriptions|claims|sitelinks"),
                ("ids", &joined),
            ])
            .await?;
        Ok(decode_entities(response))
    }

    /// `wbgetentities` keyed by sitelink titles instead of ids.
    pub async fn get_entities_by_titles(
        &self,
        site: &str,
        titles: &[String],
    ) -> Result<HashMap<String, Json>> {
        if titles.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = titles.join("|");
        let response = self
            .api(&[
                ("action", "wbgetentities"),
                ("props", "sitelinks"),
                ("sites", site),
                ("titles", &joined),
            ])
            .await?;
        Ok(decode_entities(response))
    }

    /// Full-text search (`list=search`) in the given namespace; returns page
    /// titles in rank order.
    pub async fn search_titles(
        &self,
        query: &str,
        limit: usize,
        namespace: u32,
    ) -> Result<Vec<String>> {
        let limit = limit.to_string();
        let namespace = namespace.to_string();
        let response = self
            .api(&[
                ("action", "query"),
                ("list", "search"),
                ("srnamespace", &namespace),
                ("srlimit", &limit),
                ("srsearch", query),
                ("srwhat", "text"),
            ])
            .await?;
        let titles = response["query"]["search"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| hit["title"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(titles)
    }

    /// Label/alias autocomplete (`wbsearchentities`).
    pub async fn search_entities(
        &self,
        search: &str,
        entity_type: &str,
        limit: usize,
        language: &str,
    ) -> Result<Vec<SearchHit>> {
        let limit = limit.to_string();
        let response = self
            .api(&[
                ("action", "wbsearchentities"),
                ("type", entity_type),
                ("search", search),
                ("limit", &limit),
                ("language", language),
                ("uselang", language),
            ])
            .await?;
        let hits = response["search"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        let id = hit["id"].as_str()?.to_string();
                        Some(SearchHit {
                            id,
                            label: hit["label"].as_str().map(str::to_string),
                            description: hit["description"].as_str().map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }

    /// Resolves redirects on an arbitrary wiki (not necessarily the Wikibase
    /// instance itself). Returns the redirect map `from → to`.
    pub async fn resolve_redirects(
        &self,
        api_url: &str,
        titles: &[String],
    ) -> Result<HashMap<String, String>> {
        if titles.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = titles.join("|");
        let response = self
            .get_json(
                api_url,
                &[("action", "query"), ("redirects", "1"), ("titles", &joined)],
            )
            .await?;
        let mut map = HashMap::new();
        if let Some(redirects) = response["query"]["redirects"].as_array() {
            for redirect in redirects {
                if let (Some(from), Some(to)) = (redirect["from"].as_str(), redirect["to"].as_str())
                {
                    map.insert(from.to_string(), to.to_string());
                }
            }
        }
        Ok(map)
    }
}

fn decode_entities(response: Json) -> HashMap<String, Json> {
    match response.get("entities") {
        Some(Json::Object(entities)) => entities
            .iter()
            .filter(|(_, body)| body.get("missing").is_none())
            .map(|(id, body)| (id.clone(), body.clone()))
            .collect(),
        _ => HashMap::new(),
    }
}
