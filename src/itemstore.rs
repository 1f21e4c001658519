//! The entity store: minified entities with read-through caching.
//!
//! Entities are fetched from the MediaWiki API in batches of at most 50,
//! stripped down to what the engine consumes ([`minify`]), cached in the
//! shared fabric for an hour, and handed out as immutable `Arc`s.
//!
//! Callers work through a [`StoreSession`], a per-request view that
//! additionally memoizes lookups so one request never fetches the same id
//! twice. Sessions are cheap; the memo dies with the request.

use crate::cache::Cache;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::language::language_fallback;
use crate::mediawiki::{MAX_ENTITIES_PER_FETCH, MediawikiClient};
use crate::sitelink::SitelinkResolver;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ENTITY_TTL: Duration = Duration::from_secs(60 * 60);

/// Claim rank; variant order gives precedence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Deprecated,
    #[default]
    Normal,
    Preferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnakType {
    #[default]
    Value,
    SomeValue,
    NoValue,
}

/// A minified snak. Somevalue/novalue keep their snaktype but carry no
/// datavalue; the value model folds both into empty payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snak {
    #[serde(default)]
    pub snaktype: SnakType,
    #[serde(default)]
    pub datatype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datavalue: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(default)]
    pub rank: Rank,
    pub mainsnak: Snak,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub qualifiers: HashMap<String, Vec<Snak>>,
    /// Only the number of reference bundles survives minification.
    #[serde(default)]
    pub reference_count: u32,
}

/// A minified entity. The claim lists are sorted by rank descending, an
/// invariant the `best` rank policy relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub descriptions: HashMap<String, String>,
    /// All aliases across languages, deduplicated.
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub full_aliases: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub sitelinks: HashMap<String, String>,
    /// Present on property entities only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(default)]
    pub claims: HashMap<String, Vec<Claim>>,
}

impl Entity {
    pub fn claims_for(&self, pid: &str) -> &[Claim] {
        self.claims.get(pid).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn label(&self, lang: &str) -> Option<&str> {
        language_fallback(&self.labels, lang)
    }
}

/// Strips an entity payload down to what the engine uses. Accepts both the
/// wire shape (`labels.en.value`, `claims.P31[].references[]`) and an
/// already-minified payload, for which this is a shape fixed point.
pub fn minify(raw: &Json) -> Entity {
    let id = raw["id"].as_str().unwrap_or_default().to_string();

    let labels = minify_term_map(&raw["labels"]);
    let descriptions = minify_term_map(&raw["descriptions"]);

    let (aliases, full_aliases) = match &raw["aliases"] {
        // already minified: flat list plus the per-language map
        Json::Array(list) => {
            let aliases = list
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_string)
                .collect();
            let full_aliases = raw["full_aliases"]
                .as_object()
                .map(|map| {
                    map.iter()
                        .map(|(lang, list)| {
                            let values = list
                                .as_array()
                                .map(|l| {
                                    l.iter().filter_map(Json::as_str).map(str::to_string).collect()
                                })
                                .unwrap_or_default();
                            (lang.clone(), values)
                        })
                        .collect()
                })
                .unwrap_or_default();
            (aliases, full_aliases)
        }
        Json::Object(map) => {
            let mut all = BTreeSet::new();
            let mut full = HashMap::new();
            for (lang, list) in map {
                let mut per_lang = Vec::new();
                if let Some(list) = list.as_array() {
                    for alias in list {
                        if let Some(text) = alias["value"].as_str() {
                            all.insert(text.to_string());
                            per_lang.push(text.to_string());
                        }
                    }
                }
                full.insert(lang.clone(), per_lang);
            }
            (all.into_iter().collect(), full)
        }
        _ => (Vec::new(), HashMap::new()),
    };

    let sitelinks = raw["sitelinks"]
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(wiki, body)| {
                    let title = match body {
                        Json::String(title) => Some(title.clone()),
                        other => other["title"].as_str().map(str::to_string),
                    };
                    title.map(|t| (wiki.clone(), t))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut claims: HashMap<String, Vec<Claim>> = HashMap::new();
    if let Some(map) = raw["claims"].as_object() {
        for (pid, list) in map {
            let Some(list) = list.as_array() else { continue };
            let mut minified: Vec<Claim> = list.iter().filter_map(minify_claim).collect();
            // preferred first; downstream rank filtering depends on it
            minified.sort_by(|a, b| b.rank.cmp(&a.rank));
            claims.insert(pid.clone(), minified);
        }
    }

    Entity {
        id,
        labels,
        descriptions,
        aliases,
        full_aliases,
        sitelinks,
        datatype: raw["datatype"].as_str().map(str::to_string),
        claims,
    }
}

fn minify_term_map(raw: &Json) -> HashMap<String, String> {
    raw.as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(lang, body)| {
                    let text = match body {
                        Json::String(text) => Some(text.clone()),
                        other => other["value"].as_str().map(str::to_string),
                    };
                    text.map(|t| (lang.clone(), t))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn minify_claim(raw: &Json) -> Option<Claim> {
    let mainsnak: Snak = serde_json::from_value(raw.get("mainsnak")?.clone()).ok()?;
    let rank: Rank = raw
        .get("rank")
        .and_then(|r| serde_json::from_value(r.clone()).ok())
        .unwrap_or_default();
    let qualifiers = raw["qualifiers"]
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(pid, snaks)| {
                    let snaks: Vec<Snak> = serde_json::from_value(snaks.clone()).ok()?;
                    Some((pid.clone(), snaks))
                })
                .collect()
        })
        .unwrap_or_default();
    let reference_count = match raw.get("references") {
        Some(Json::Array(refs)) => refs.len() as u32,
        _ => raw["reference_count"].as_u64().unwrap_or(0) as u32,
    };
    Some(Claim {
        rank,
        mainsnak,
        qualifiers,
        reference_count,
    })
}

pub struct ItemStore {
    cache: Cache,
    client: MediawikiClient,
    config: Arc<ServiceConfig>,
    sitelinks: SitelinkResolver,
    entity_ttl: Duration,
}

impl ItemStore {
    pub fn new(cache: Cache, client: MediawikiClient, config: Arc<ServiceConfig>) -> Self {
        let sitelinks = SitelinkResolver::new(cache.clone(), client.clone(), config.clone());
        ItemStore {
            cache,
            client,
            config,
            sitelinks,
            entity_ttl: ENTITY_TTL,
        }
    }

    /// Interactive callers (suggest) tolerate staler entities.
    pub fn with_entity_ttl(mut self, ttl: Duration) -> Self {
        self.entity_ttl = ttl;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn sitelinks(&self) -> &SitelinkResolver {
        &self.sitelinks
    }

    /// Opens a per-request session. The session memoizes every lookup it
    /// performs, including misses, and is dropped with the request.
    pub fn session(&self) -> StoreSession<'_> {
        StoreSession {
            store: self,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn entity_key(&self, id: &str) -> String {
        self.cache.key(&["items", id])
    }

    /// Cache read-through: returns what the cache knows and the ids that
    /// still need an upstream fetch.
    async fn read_cached(
        &self,
        ids: &[String],
    ) -> (HashMap<String, Arc<Entity>>, Vec<String>) {
        let keys: Vec<String> = ids.iter().map(|id| self.entity_key(id)).collect();
        let cached = self.cache.mget(&keys).await;
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for (id, value) in ids.iter().zip(cached) {
            match value.as_deref().map(serde_json::from_str::<Entity>) {
                Some(Ok(entity)) => {
                    found.insert(id.clone(), Arc::new(entity));
                }
                Some(Err(err)) => {
                    warn!(id = %id, %err, "discarding unreadable cached entity");
                    missing.push(id.clone());
                }
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    /// Fetches and minifies entities upstream, in parallel batches of at
    /// most [`MAX_ENTITIES_PER_FETCH`]. All batches must succeed before
    /// anything is written back, so an upstream failure never leaves a
    /// partial cache state behind.
    async fn fetch_upstream(&self, ids: &[String]) -> Result<HashMap<String, Arc<Entity>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let batches = try_join_all(
            ids.chunks(MAX_ENTITIES_PER_FETCH)
                .map(|chunk| self.client.get_entities(chunk)),
        )
        .await?;

        let mut fetched = HashMap::new();
        let mut writes = Vec::new();
        for batch in batches {
            for (id, raw) in batch {
                let entity = minify(&raw);
                if let Ok(serialized) = serde_json::to_string(&entity) {
                    writes.push((self.entity_key(&id), serialized));
                }
                fetched.insert(id, Arc::new(entity));
            }
        }
        self.cache.mset_with_ttl(&writes, self.entity_ttl).await?;
        debug!(fetched = fetched.len(), requested = ids.len(), "entity batch fetch");
        Ok(fetched)
    }
}

/// Per-request view of the store. See [`ItemStore::session`].
pub struct StoreSession<'a> {
    store: &'a ItemStore,
    /// `None` records a confirmed not-found, so repeated scoring passes do
    /// not re-ask upstream for an id the instance does not know.
    memo: Mutex<HashMap<String, Option<Arc<Entity>>>>,
}

impl<'a> StoreSession<'a> {
    pub fn config(&self) -> &ServiceConfig {
        self.store.config()
    }

    /// Fetches minified entities. Ids the instance does not know are absent
    /// from the returned map. With `force`, cache and memo are bypassed.
    pub async fn get_items(
        &self,
        ids: &[String],
        force: bool,
    ) -> Result<HashMap<String, Arc<Entity>>> {
        let mut unique: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            if !id.is_empty() && seen.insert(id.clone()) {
                unique.push(id.clone());
            }
        }
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let mut result = HashMap::new();
        let mut remaining = Vec::new();
        if force {
            remaining = unique;
        } else {
            {
                let memo = self.memo.lock();
                for id in &unique {
                    match memo.get(id) {
                        Some(Some(entity)) => {
                            result.insert(id.clone(), entity.clone());
                        }
                        Some(None) => {}
                        None => remaining.push(id.clone()),
                    }
                }
            }
            if remaining.is_empty() {
                return Ok(result);
            }
            let (cached, missing) = self.store.read_cached(&remaining).await;
            result.extend(cached);
            remaining = missing;
        }

        let fetched = self.store.fetch_upstream(&remaining).await?;
        {
            let mut memo = self.memo.lock();
            for id in &remaining {
                memo.insert(id.clone(), fetched.get(id).cloned());
            }
            for (id, entity) in &result {
                memo.entry(id.clone()).or_insert_with(|| Some(entity.clone()));
            }
        }
        result.extend(fetched);
        Ok(result)
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<Arc<Entity>>> {
        let ids = [id.to_string()];
        let items = self.get_items(&ids, false).await?;
        Ok(items.get(id).cloned())
    }

    /// Best label with fallback chain requested language → `en` → any;
    /// the id itself when the entity has no labels or does not exist.
    pub async fn get_label(&self, id: &str, lang: &str) -> Result<String> {
        let label = self
            .get_item(id)
            .await?
            .and_then(|item| item.label(lang).map(str::to_string));
        Ok(label.unwrap_or_else(|| id.to_string()))
    }

    /// Resolves one normalized sitelink through the shared resolver.
    pub async fn resolve_sitelink(&self, normalized: &str) -> Result<Option<String>> {
        let resolved = self
            .store
            .sitelinks
            .sitelinks_to_qids(&[normalized.to_string()])
            .await?;
        Ok(resolved.get(normalized).cloned())
    }

    pub async fn sitelinks_to_qids(
        &self,
        links: &[String],
    ) -> Result<HashMap<String, String>> {
        self.store.sitelinks.sitelinks_to_qids(links).await
    }
}
