//! Application state: one cache, one HTTP client, the engines.

use crate::cache::Cache;
use crate::config::ServiceConfig;
use crate::engine::ReconcileEngine;
use crate::error::Result;
use crate::itemstore::ItemStore;
use crate::mediawiki::{MediawikiClient, build_http_client};
use crate::monitoring::Monitoring;
use crate::path::PathFactory;
use crate::sparql::SparqlClient;
use crate::suggest::SuggestEngine;
use crate::typematcher::TypeMatcher;
use std::sync::Arc;

pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub engine: ReconcileEngine,
    pub suggest: SuggestEngine,
    pub monitoring: Monitoring,
}

impl AppState {
    /// Opens the cache backend named by the configuration and wires up the
    /// engines. The reqwest client (pool, per-host cap, user agent) is
    /// shared by every upstream caller.
    pub async fn new(config: Arc<ServiceConfig>) -> Result<Self> {
        let cache = Cache::open(&config.cache_uri, &config.cache_key_prefix).await?;
        Self::with_cache(config, cache)
    }

    pub fn with_cache(config: Arc<ServiceConfig>, cache: Cache) -> Result<Self> {
        let http = build_http_client(&config)?;
        let client = MediawikiClient::new(http.clone(), config.mediawiki_api_endpoint.clone());
        let sparql = SparqlClient::new(http.clone(), config.sparql_endpoint.clone());

        let engine = ReconcileEngine::new(
            ItemStore::new(cache.clone(), client.clone(), config.clone()),
            TypeMatcher::new(cache.clone(), sparql.clone(), config.clone()),
            PathFactory::new(cache.clone(), sparql.clone(), config.clone()),
            client.clone(),
            config.clone(),
        )?;
        let suggest = SuggestEngine::new(
            ItemStore::new(cache.clone(), client.clone(), config.clone()),
            PathFactory::new(cache.clone(), sparql.clone(), config.clone()),
            client,
            sparql,
            http,
            config.clone(),
        )?;
        let monitoring = Monitoring::new(cache);

        Ok(AppState {
            config,
            engine,
            suggest,
            monitoring,
        })
    }
}
