//! The reconciliation engine.
//!
//! `process_queries` is the backbone: prepare the property constraints,
//! resolve unique identifiers and sitelinks in two batched fan-ins, gather
//! candidates per query (identifier matches beat everything, then
//! query-as-id, then query-as-sitelink, then text search), prefetch every
//! candidate entity, then score, rank and decide the auto-match flag.
//!
//! The same type also hosts the data-extension operations, which share the
//! path evaluator and the store session plumbing.

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::itemstore::{ItemStore, StoreSession};
use crate::mediawiki::MediawikiClient;
use crate::model::{
    ExtendMeta, ExtendPayload, ExtendResponse, Feature, PropertyConstraint, QueryResult,
    ReconQuery, ScoredCandidate, TypeRef,
};
use crate::path::{PathFactory, PropertyPath, RankPolicy, ReferencePolicy};
use crate::sitelink;
use crate::typematcher::{TypeMatcher, TypeMatcherSession};
use crate::value::{Cell, Value};
use serde_json::Value as Json;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

const PROPERTY_WEIGHT: f64 = 0.4;
const THRESHOLD_DISCOUNT_PER_PROPERTY: f64 = 5.0;
const MATCH_SCORE_GAP: f64 = 10.0;
const LABEL_CONSTRAINT_ID: &str = "all_labels";

pub struct ReconcileEngine {
    store: ItemStore,
    types: TypeMatcher,
    paths: PathFactory,
    client: MediawikiClient,
    config: Arc<ServiceConfig>,
    type_path: PropertyPath,
}

/// A query's property constraint, parsed and classified.
#[derive(Debug, Clone)]
struct PreparedProperty {
    id: String,
    path: PropertyPath,
    value: String,
    unique_id: bool,
}

impl ReconcileEngine {
    pub fn new(
        store: ItemStore,
        types: TypeMatcher,
        paths: PathFactory,
        client: MediawikiClient,
        config: Arc<ServiceConfig>,
    ) -> Result<Self> {
        let type_path = paths.parse(&config.type_property_path)?;
        Ok(ReconcileEngine {
            store,
            types,
            paths,
            client,
            config,
            type_path,
        })
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    pub fn paths(&self) -> &PathFactory {
        &self.paths
    }

    /// Stringifies a constraint value: objects contribute their `id`,
    /// everything else its trimmed string form.
    fn constraint_value(v: &Json) -> String {
        match v {
            Json::Object(map) => map
                .get("id")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
            Json::String(s) => s.trim().to_string(),
            Json::Null => String::new(),
            other => other.to_string(),
        }
    }

    async fn prepare_property(
        &self,
        constraint: &PropertyConstraint,
        detect_unique_id: bool,
    ) -> Result<PreparedProperty> {
        let path = self.paths.parse(&constraint.pid)?;
        let unique_id = if detect_unique_id {
            self.paths.is_unique_identifier(&path).await?
        } else {
            false
        };
        Ok(PreparedProperty {
            id: constraint.pid.clone(),
            path,
            value: Self::constraint_value(&constraint.v),
            unique_id,
        })
    }

    /// Text search: namespace search and label autocomplete fired in
    /// parallel, concatenated in that order.
    async fn wikibase_string_search(
        &self,
        query_string: &str,
        num_results: usize,
        default_language: &str,
    ) -> Result<Vec<String>> {
        if query_string.trim().is_empty() {
            return Ok(Vec::new());
        }
        let (titles, autocomplete) = tokio::join!(
            self.client.search_titles(
                query_string,
                num_results,
                self.config.wikibase_namespace_id
            ),
            self.client
                .search_entities(query_string, "item", num_results, default_language),
        );
        let prefix = &self.config.wikibase_namespace_prefix;
        let mut ids: Vec<String> = titles?
            .into_iter()
            .filter_map(|title| {
                let title = title.strip_prefix(prefix.as_str()).unwrap_or(&title);
                self.config.item_id(title)
            })
            .collect();
        ids.extend(autocomplete?.into_iter().map(|hit| hit.id));
        Ok(ids)
    }

    /// Candidate discovery for one query, in priority order.
    async fn fetch_candidate_ids(
        &self,
        query: &ReconQuery,
        properties: &[PreparedProperty],
        unique_id_to_qid: &HashMap<PropertyPath, HashMap<String, Vec<(String, String)>>>,
        sitelinks_to_qids: &HashMap<String, String>,
        default_language: &str,
    ) -> Result<Vec<String>> {
        let mut primary: Vec<String> = Vec::new();
        for prop in properties.iter().filter(|p| p.unique_id) {
            if let Some(matches) = unique_id_to_qid
                .get(&prop.path)
                .and_then(|by_value| by_value.get(&prop.value))
            {
                primary.extend(matches.iter().map(|(id, _)| id.clone()));
            }
        }
        if !primary.is_empty() {
            return Ok(primary);
        }

        let Some(query_string) = query.query.as_deref() else {
            return Err(ServiceError::bad_argument("no 'query' provided"));
        };
        let num_results = requested_limit(query, &self.config);
        let num_before_filter = (2 * num_results).min(self.config.api_max_search_results);

        if let Some(id) = self.config.item_id(query_string) {
            return Ok(vec![id]);
        }
        if let Some(id) = sitelink::normalize(query_string)
            .and_then(|link| sitelinks_to_qids.get(&link).cloned())
        {
            return Ok(vec![id]);
        }
        self.wikibase_string_search(query_string, num_before_filter, default_language)
            .await
    }

    pub async fn process_single_query(
        &self,
        query: ReconQuery,
        default_language: &str,
    ) -> Result<QueryResult> {
        let mut queries = HashMap::new();
        queries.insert("q".to_string(), query);
        let mut results = self.process_queries(queries, default_language).await?;
        Ok(results.remove("q").expect("single query result"))
    }

    pub async fn process_queries(
        &self,
        queries: HashMap<String, ReconQuery>,
        default_language: &str,
    ) -> Result<HashMap<String, QueryResult>> {
        let session = self.store.session();
        let type_session = self.types.session();

        // prepare all property constraints
        let mut prepared: HashMap<String, Vec<PreparedProperty>> = HashMap::new();
        for (query_id, query) in &queries {
            let mut properties = Vec::with_capacity(query.properties.len());
            for constraint in &query.properties {
                properties.push(self.prepare_property(constraint, true).await?);
            }
            prepared.insert(query_id.clone(), properties);
        }

        // gather the unique-identifier values per path, across all queries
        let mut unique_id_values: HashMap<PropertyPath, HashSet<String>> = HashMap::new();
        for properties in prepared.values() {
            for prop in properties.iter().filter(|p| p.unique_id && !p.value.is_empty()) {
                unique_id_values
                    .entry(prop.path.clone())
                    .or_default()
                    .insert(prop.value.clone());
            }
        }

        // candidate sitelinks: every query string and every property value
        let mut possible_sitelinks: Vec<String> = Vec::new();
        for query in queries.values() {
            possible_sitelinks.extend(query.query.clone());
            for constraint in &query.properties {
                possible_sitelinks.push(Self::constraint_value(&constraint.v));
            }
        }

        // identifier fan-in and sitelink fan-in run concurrently, one
        // reverse lookup per distinct path
        let identifier_lookup = async {
            let lookups = unique_id_values.iter().map(|(path, values)| async move {
                let values: Vec<String> = values.iter().cloned().collect();
                let matches = self
                    .paths
                    .fetch_qids_by_values(path, &values, default_language)
                    .await?;
                Ok::<_, ServiceError>((path.clone(), matches))
            });
            let resolved = futures::future::try_join_all(lookups).await?;
            Ok::<_, ServiceError>(resolved.into_iter().collect::<HashMap<_, _>>())
        };
        let sitelink_lookup = session.sitelinks_to_qids(&possible_sitelinks);
        let (unique_id_to_qid, sitelinks_to_qids) =
            tokio::join!(identifier_lookup, sitelink_lookup);
        let unique_id_to_qid = unique_id_to_qid?;
        let sitelinks_to_qids = sitelinks_to_qids?;

        // candidate discovery for every query, then one batched prefetch
        let mut candidates: HashMap<String, Vec<String>> = HashMap::new();
        let mut to_prefetch: Vec<String> = Vec::new();
        for (query_id, query) in &queries {
            let ids = self
                .fetch_candidate_ids(
                    query,
                    &prepared[query_id],
                    &unique_id_to_qid,
                    &sitelinks_to_qids,
                    default_language,
                )
                .await?;
            to_prefetch.extend(ids.iter().cloned());
            candidates.insert(query_id.clone(), ids);
        }
        session.get_items(&to_prefetch, false).await?;

        let mut results = HashMap::new();
        for (query_id, query) in &queries {
            let ranked = self
                .rank_candidates(
                    query,
                    &prepared[query_id],
                    &candidates[query_id],
                    &session,
                    &type_session,
                    default_language,
                )
                .await?;
            results.insert(query_id.clone(), QueryResult { result: ranked });
        }
        Ok(results)
    }

    async fn rank_candidates(
        &self,
        query: &ReconQuery,
        properties: &[PreparedProperty],
        candidate_ids: &[String],
        session: &StoreSession<'_>,
        type_session: &TypeMatcherSession<'_>,
        default_language: &str,
    ) -> Result<Vec<ScoredCandidate>> {
        if let Some(strictness) = query.type_strict.as_deref() {
            if !matches!(strictness, "any" | "all" | "should") {
                return Err(ServiceError::bad_argument(format!(
                    "invalid type_strict '{strictness}'"
                )));
            }
        }
        let mut target_types: Vec<String> = query
            .entity_type
            .clone()
            .map(|types| types.into_vec())
            .unwrap_or_default();
        if let Some(default_type) = &self.config.default_type_entity {
            target_types.retain(|t| t != default_type);
        }

        let search_string = query.query.clone().unwrap_or_default();
        let discounted_threshold = self.config.validation_threshold
            - THRESHOLD_DISCOUNT_PER_PROPERTY * properties.len() as f64;

        // the query text scores as one more constraint, over labels and
        // aliases via the identity path, always appended last
        let mut constraints: Vec<PreparedProperty> = properties.to_vec();
        constraints.push(PreparedProperty {
            id: LABEL_CONSTRAINT_ID.to_string(),
            path: PropertyPath::Empty,
            value: search_string,
            unique_id: false,
        });

        let items = session.get_items(candidate_ids, false).await?;
        let mut seen = HashSet::new();
        let mut scored_items: Vec<ScoredCandidate> = Vec::new();
        let mut no_type_items: Vec<ScoredCandidate> = Vec::new();

        for id in candidate_ids {
            if !items.contains_key(id) || !seen.insert(id.clone()) {
                continue;
            }
            let outcome = self
                .score_candidate(
                    id,
                    &constraints,
                    &target_types,
                    session,
                    type_session,
                    default_language,
                )
                .await;
            match outcome {
                Ok(Some(Scored::Typed(candidate))) => scored_items.push(candidate),
                Ok(Some(Scored::NoType(candidate))) => no_type_items.push(candidate),
                Ok(None) => {}
                Err(err) => {
                    // one broken candidate must not poison the batch
                    warn!(id = %id, %err, "candidate scoring failed");
                    scored_items.push(ScoredCandidate {
                        id: id.clone(),
                        name: id.clone(),
                        entity_type: Vec::new(),
                        score: 0.0,
                        features: Vec::new(),
                        match_flag: false,
                    });
                }
            }
        }

        // items of the wrong type were dropped; items with no type at all
        // only serve as a fallback, with their scores already halved so no
        // auto-match can fire
        let mut ranked = if scored_items.is_empty() {
            no_type_items
        } else {
            scored_items
        };
        ranked.sort_by(candidate_order);

        if let Some(top) = ranked.first() {
            let next_score = ranked.get(1).map(|c| c.score).unwrap_or(0.0);
            let matched = top.score > discounted_threshold
                && top.score > next_score + MATCH_SCORE_GAP;
            ranked[0].match_flag = matched;
        }

        ranked.truncate(requested_limit(query, &self.config));
        Ok(ranked)
    }

    async fn score_candidate(
        &self,
        id: &str,
        constraints: &[PreparedProperty],
        target_types: &[String],
        session: &StoreSession<'_>,
        type_session: &TypeMatcherSession<'_>,
        default_language: &str,
    ) -> Result<Option<Scored>> {
        let item_value = Value::Item {
            id: Some(id.to_string()),
        };

        let current_types: Vec<String> = self
            .type_path
            .step(&item_value, session, ReferencePolicy::Any, RankPolicy::Any)
            .await?
            .into_iter()
            .filter_map(|v| match v {
                Value::Item { id: Some(id) } => Some(id),
                _ => None,
            })
            .collect();
        let type_found = !current_types.is_empty();

        let good_type = if !target_types.is_empty() {
            let mut found = false;
            'outer: for target in target_types {
                for current in &current_types {
                    if type_session.is_subclass(current, target).await? {
                        found = true;
                        break 'outer;
                    }
                }
            }
            found
        } else if let Some(avoid) = &self.config.avoid_class {
            let mut all_avoided = true;
            for current in &current_types {
                if !type_session.is_subclass(current, avoid).await? {
                    all_avoided = false;
                    break;
                }
            }
            !all_avoided
        } else {
            true
        };

        // wrong type: drop. No type at all: keep, the score is halved below.
        if type_found && !good_type {
            return Ok(None);
        }

        let mut features = Vec::with_capacity(constraints.len());
        let mut sum_scores = 0.0;
        let mut unique_id_found = false;
        for constraint in constraints {
            let values = constraint
                .path
                .step(&item_value, session, ReferencePolicy::Any, RankPolicy::Any)
                .await?;
            let mut best = 0.0f64;
            for value in &values {
                best = best.max(value.match_with_str(&constraint.value, session).await?);
            }
            if constraint.unique_id && best == 100.0 {
                unique_id_found = true;
            }
            let weight = if constraint.id == LABEL_CONSTRAINT_ID {
                1.0
            } else {
                PROPERTY_WEIGHT
            };
            sum_scores += weight * best;
            features.push(Feature {
                id: constraint.id.clone(),
                value: best,
            });
        }

        let non_unique_properties = constraints
            .iter()
            .filter(|c| c.id != LABEL_CONSTRAINT_ID && !c.unique_id)
            .count();
        let total_weight = PROPERTY_WEIGHT * non_unique_properties as f64 + 1.0;
        let score = if unique_id_found {
            100.0
        } else if sum_scores > 0.0 {
            sum_scores / total_weight
        } else {
            0.0
        };

        let mut entity_type = Vec::with_capacity(current_types.len());
        for type_id in &current_types {
            entity_type.push(TypeRef {
                id: type_id.clone(),
                name: session.get_label(type_id, default_language).await?,
            });
        }
        let candidate = ScoredCandidate {
            id: id.to_string(),
            name: session.get_label(id, default_language).await?,
            entity_type,
            score,
            features,
            match_flag: false,
        };

        if !type_found && !target_types.is_empty() && !unique_id_found {
            let mut candidate = candidate;
            candidate.score /= 2.0;
            Ok(Some(Scored::NoType(candidate)))
        } else {
            Ok(Some(Scored::Typed(candidate)))
        }
    }

    // ------------------------------------------------------------------
    // Data extension
    // ------------------------------------------------------------------

    /// Values of one path on one item; with `flat`, just the first value.
    pub async fn fetch_values(&self, args: &HashMap<String, String>) -> Result<Json> {
        let item = args.get("item").cloned().unwrap_or_default();
        let mut batch_args = args.clone();
        batch_args.insert("ids".to_string(), item.clone());
        let response = self.fetch_property_by_batch(&batch_args).await?;
        let values = response["values"][0].clone();
        if args.get("flat").map(String::as_str) == Some("true") {
            Ok(values
                .as_array()
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_else(|| Json::String(String::new())))
        } else {
            Ok(serde_json::json!({
                "item": item,
                "prop": response["prop"],
                "values": values,
            }))
        }
    }

    /// One path evaluated over a `|`-separated list of item ids.
    pub async fn fetch_property_by_batch(
        &self,
        args: &HashMap<String, String>,
    ) -> Result<Json> {
        let lang = args
            .get("lang")
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ServiceError::bad_argument("no 'lang' provided"))?;
        let prop = args
            .get("prop")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ServiceError::bad_argument("no 'prop' provided"))?;
        let path = self.paths.parse(prop)?;
        let fetch_labels = args.get("label").map(String::as_str).unwrap_or("true") == "true";

        let ids: Vec<String> = args
            .get("ids")
            .map(String::as_str)
            .unwrap_or_default()
            .split('|')
            .map(|id| {
                self.config
                    .item_id(id)
                    .ok_or_else(|| ServiceError::bad_argument(format!("invalid item id '{id}'")))
            })
            .collect::<Result<_>>()?;

        let session = self.store.session();
        session.get_items(&ids, false).await?;
        let mut values = Vec::with_capacity(ids.len());
        for id in &ids {
            let item = Value::Item { id: Some(id.clone()) };
            values.push(
                path.evaluate(&item, Some(lang), fetch_labels, &session)
                    .await?,
            );
        }
        Ok(serde_json::json!({ "prop": prop, "values": values }))
    }

    /// The data-extension operation: multiple paths over multiple items,
    /// with per-column settings.
    pub async fn fetch_properties_by_batch(
        &self,
        lang: &str,
        payload: &ExtendPayload,
    ) -> Result<ExtendResponse> {
        if lang.is_empty() {
            return Err(ServiceError::bad_argument("no 'lang' provided"));
        }
        if payload.properties.is_empty() {
            return Err(ServiceError::bad_argument(
                "at least one property has to be provided",
            ));
        }
        let ids: Vec<String> = payload
            .ids
            .iter()
            .map(|id| {
                self.config
                    .item_id(id)
                    .ok_or_else(|| ServiceError::bad_argument(format!("invalid item id '{id}'")))
            })
            .collect::<Result<_>>()?;

        struct Column {
            id: String,
            path: PropertyPath,
            settings: Option<Json>,
            references: ReferencePolicy,
            rank: RankPolicy,
            limit: usize,
            count: bool,
        }
        let mut columns = Vec::with_capacity(payload.properties.len());
        for property in &payload.properties {
            let path = self.paths.parse(&property.id)?;
            let settings = property.settings.clone();
            columns.push(Column {
                id: property.id.clone(),
                path,
                references: setting_policy(&settings, "references")?,
                rank: setting_policy(&settings, "rank")?,
                limit: setting_limit(&settings),
                count: setting_flag(&settings, "count"),
                settings,
            });
        }

        let session = self.store.session();
        session.get_items(&ids, false).await?;

        let mut rows: HashMap<String, HashMap<String, Vec<Cell>>> = HashMap::new();
        for id in &ids {
            let item = Value::Item { id: Some(id.clone()) };
            let mut row = HashMap::new();
            for column in &columns {
                let values = column
                    .path
                    .step(&item, &session, column.references, column.rank)
                    .await?;
                let mut cells = Vec::with_capacity(values.len());
                for value in &values {
                    cells.push(value.as_cell(lang, &session).await?);
                }
                if column.limit > 0 {
                    cells.truncate(column.limit);
                }
                if column.count {
                    cells = vec![Cell::Float {
                        float: cells.len() as f64,
                    }];
                }
                row.insert(column.id.clone(), cells);
            }
            rows.insert(id.clone(), row);
        }

        // prefetch the property entities so meta labels come from the memo
        let property_ids: Vec<String> = columns
            .iter()
            .filter_map(|c| self.config.property_id(&c.id))
            .collect();
        session.get_items(&property_ids, false).await?;

        let mut meta = Vec::with_capacity(columns.len());
        for column in &columns {
            let expected_type = if column.count {
                None
            } else {
                match column.path.expected_types().first() {
                    Some(type_id) => Some(TypeRef {
                        id: type_id.clone(),
                        name: session.get_label(type_id, lang).await?,
                    }),
                    None => None,
                }
            };
            meta.push(ExtendMeta {
                id: column.id.clone(),
                name: column.path.readable_name(lang, &session).await?,
                settings: column.settings.clone(),
                expected_type,
            });
        }

        Ok(ExtendResponse { rows, meta })
    }
}

enum Scored {
    Typed(ScoredCandidate),
    NoType(ScoredCandidate),
}

/// A `limit` of zero means "unset", like an absent one.
fn requested_limit(query: &ReconQuery, config: &ServiceConfig) -> usize {
    query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(config.default_num_results)
}

/// Score descending, then numeric id ascending. Smaller ids skew towards
/// better-known entities; a real popularity signal could replace this
/// comparator wholesale.
fn candidate_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| numeric_id(&a.id).cmp(&numeric_id(&b.id)))
}

fn numeric_id(id: &str) -> u64 {
    id.trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(u64::MAX)
}

fn setting_limit(settings: &Option<Json>) -> usize {
    let Some(limit) = settings.as_ref().and_then(|s| s.get("limit")) else {
        return 0;
    };
    match limit {
        Json::Number(n) => n.as_u64().unwrap_or(0) as usize,
        Json::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn setting_flag(settings: &Option<Json>, name: &str) -> bool {
    match settings.as_ref().and_then(|s| s.get(name)) {
        Some(Json::String(s)) => s == "on" || s == "true",
        Some(Json::Bool(b)) => *b,
        _ => false,
    }
}

fn setting_policy<P: Default + serde::de::DeserializeOwned>(
    settings: &Option<Json>,
    name: &str,
) -> Result<P> {
    match settings.as_ref().and_then(|s| s.get(name)) {
        None | Some(Json::Null) => Ok(P::default()),
        Some(Json::String(s)) if s.is_empty() => Ok(P::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|_| ServiceError::bad_argument(format!("invalid '{name}' setting"))),
    }
}
