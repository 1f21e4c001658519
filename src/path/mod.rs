//! Property paths: the query algebra over entity claims.
//!
//! A path describes a traversal from an item to a set of values:
//! `P17/P297` walks country-of then its ISO code, `P625@lat` extracts a
//! latitude, `(P214|P227)` tries two identifier properties. Paths are plain
//! values; evaluation borrows a [`StoreSession`] and the structural
//! predicates consult the [`PathFactory`]'s cached identifier-property set.

mod parse;

use crate::cache::Cache;
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::itemstore::{Claim, Entity, Rank, StoreSession};
use crate::sparql::SparqlClient;
use crate::subfields;
use crate::value::Value;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const UNIQUE_IDS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermKind {
    Label,
    Description,
    Alias,
}

impl TermKind {
    fn letter(self) -> char {
        match self {
            TermKind::Label => 'L',
            TermKind::Description => 'D',
            TermKind::Alias => 'A',
        }
    }
}

/// A parsed property path. Equality and hashing are structural; the parser
/// only produces right-nested chains, so two paths are equal exactly when
/// their canonical renderings are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyPath {
    /// `.` — the identity path.
    Empty,
    /// `P31` — the mainsnak values of a property.
    Leaf { pid: String },
    /// `P31_P642` — the values of a qualifier on a property's claims.
    Qualifier { pid: String, qualifier: String },
    /// `qid` — the id of the current item, as an identifier value.
    Qid,
    /// `Len` / `Dfr` / `Aes` — label, description or aliases for a language.
    Term { kind: TermKind, lang: String },
    /// `Senwiki` — the sitelink title for a wiki.
    Sitelink { site: String },
    /// `a/b`
    Concat(Box<PropertyPath>, Box<PropertyPath>),
    /// `(a|b)` — both sides, duplicates preserved.
    Disjunct(Box<PropertyPath>, Box<PropertyPath>),
    /// `a@name`
    Subfield { path: Box<PropertyPath>, name: String },
}

/// Which claim ranks an evaluation considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankPolicy {
    Any,
    #[default]
    Best,
    NoDeprecated,
}

/// Which claims an evaluation considers, by their references.
///
/// Minification only keeps reference counts, so `no_wiki` degrades to
/// `referenced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    #[default]
    Any,
    Referenced,
    NoWiki,
}

impl PropertyPath {
    /// Renders without the SPARQL property prefix; this is the canonical
    /// form parse/render round-trips on.
    fn render(&self, prefix: &str, out: &mut String) {
        match self {
            PropertyPath::Empty => out.push('.'),
            PropertyPath::Leaf { pid } => {
                out.push_str(prefix);
                out.push_str(pid);
            }
            PropertyPath::Qualifier { pid, qualifier } => {
                out.push_str(prefix);
                out.push_str(pid);
                out.push('_');
                out.push_str(qualifier);
            }
            PropertyPath::Qid => out.push_str("qid"),
            PropertyPath::Term { kind, lang } => {
                out.push(kind.letter());
                out.push_str(lang);
            }
            PropertyPath::Sitelink { site } => {
                out.push('S');
                out.push_str(site);
            }
            PropertyPath::Concat(a, b) => {
                a.render(prefix, out);
                out.push('/');
                b.render(prefix, out);
            }
            PropertyPath::Disjunct(a, b) => {
                // flatten right-nested chains into one pair of parentheses
                out.push('(');
                a.render(prefix, out);
                let mut rest = b;
                while let PropertyPath::Disjunct(left, right) = rest.as_ref() {
                    out.push('|');
                    left.render(prefix, out);
                    rest = right;
                }
                out.push('|');
                rest.render(prefix, out);
                out.push(')');
            }
            PropertyPath::Subfield { path, name } => {
                path.render(prefix, out);
                out.push('@');
                out.push_str(name);
            }
        }
    }

    /// Rendering with the configured property prefix, suitable for use as a
    /// SPARQL property path.
    pub fn to_sparql(&self, prefix: &str) -> String {
        let mut out = String::new();
        self.render(prefix, &mut out);
        out
    }

    /// All plain leaf properties of the path (qualifier and term nodes are
    /// not leaves).
    fn leaf_pids<'p>(&'p self, out: &mut Vec<&'p str>) {
        match self {
            PropertyPath::Leaf { pid } => out.push(pid),
            PropertyPath::Concat(a, b) | PropertyPath::Disjunct(a, b) => {
                a.leaf_pids(out);
                b.leaf_pids(out);
            }
            PropertyPath::Subfield { path, .. } => path.leaf_pids(out),
            _ => {}
        }
    }

    /// The uniform depth of the path when it exists: the number of steps
    /// from the item to the target, identical in every disjunction branch,
    /// with every leaf an identifier property. `None` otherwise.
    fn uniform_depth(&self, is_identifier: &dyn Fn(&str) -> bool) -> Option<u32> {
        match self {
            PropertyPath::Empty => Some(0),
            PropertyPath::Leaf { pid } => is_identifier(pid).then_some(1),
            PropertyPath::Qid => Some(1),
            PropertyPath::Concat(a, b) => {
                Some(a.uniform_depth(is_identifier)? + b.uniform_depth(is_identifier)?)
            }
            PropertyPath::Disjunct(a, b) => {
                let depth_a = a.uniform_depth(is_identifier)?;
                let depth_b = b.uniform_depth(is_identifier)?;
                (depth_a == depth_b).then_some(depth_a)
            }
            // term, sitelink, qualifier and subfield nodes never form a
            // unique identifier
            _ => None,
        }
    }

    /// Whether the values this path ends on are unique identifiers.
    fn ends_with(&self, is_identifier: &dyn Fn(&str) -> bool) -> bool {
        match self {
            PropertyPath::Leaf { pid } => is_identifier(pid),
            PropertyPath::Qualifier { qualifier, .. } => is_identifier(qualifier),
            PropertyPath::Qid => true,
            PropertyPath::Concat(_, b) => b.ends_with(is_identifier),
            PropertyPath::Disjunct(a, b) => a.ends_with(is_identifier) && b.ends_with(is_identifier),
            PropertyPath::Subfield { .. }
            | PropertyPath::Empty
            | PropertyPath::Term { .. }
            | PropertyPath::Sitelink { .. } => false,
        }
    }

    /// Classes the values of this path are expected to belong to.
    pub fn expected_types(&self) -> Vec<String> {
        match self {
            PropertyPath::Concat(_, b) => b.expected_types(),
            PropertyPath::Disjunct(a, b) => {
                let mut types = a.expected_types();
                types.extend(b.expected_types());
                types
            }
            _ => Vec::new(),
        }
    }

    /// Human-readable name: property labels where the path is simple,
    /// the canonical rendering otherwise.
    pub async fn readable_name(&self, lang: &str, session: &StoreSession<'_>) -> Result<String> {
        match self {
            PropertyPath::Leaf { pid } => session.get_label(pid, lang).await,
            PropertyPath::Qualifier { pid, qualifier } => {
                let property = session.get_label(pid, lang).await?;
                let qualifier = session.get_label(qualifier, lang).await?;
                Ok(format!("{property}, {qualifier}"))
            }
            PropertyPath::Qid => Ok("Qid".to_string()),
            PropertyPath::Sitelink { site } => Ok(format!("Sitelink {site}")),
            _ => Ok(self.to_string()),
        }
    }

    /// Evaluates one step of the path on a value, returning the reachable
    /// values. Non-item inputs only survive the identity path.
    pub fn step<'a>(
        &'a self,
        value: &'a Value,
        session: &'a StoreSession<'a>,
        references: ReferencePolicy,
        rank: RankPolicy,
    ) -> BoxFuture<'a, Result<Vec<Value>>> {
        Box::pin(async move {
            match self {
                PropertyPath::Empty => Ok(vec![value.clone()]),
                PropertyPath::Leaf { pid } => {
                    let Some(item) = item_of(value, session).await? else {
                        return Ok(Vec::new());
                    };
                    Ok(filter_claims(item.claims_for(pid), rank, references)
                        .map(|claim| Value::from_snak(&claim.mainsnak))
                        .collect())
                }
                PropertyPath::Qualifier { pid, qualifier } => {
                    let Some(item) = item_of(value, session).await? else {
                        return Ok(Vec::new());
                    };
                    let mut values = Vec::new();
                    for claim in filter_claims(item.claims_for(pid), rank, references) {
                        for snak in claim.qualifiers.get(qualifier).into_iter().flatten() {
                            values.push(Value::from_snak(snak));
                        }
                    }
                    Ok(values)
                }
                PropertyPath::Qid => match value {
                    Value::Item { id: Some(id) } => Ok(vec![Value::Identifier {
                        value: Some(id.clone()),
                    }]),
                    _ => Ok(Vec::new()),
                },
                PropertyPath::Term { kind, lang } => {
                    let Some(item) = item_of(value, session).await? else {
                        return Ok(Vec::new());
                    };
                    Ok(term_values(&item, *kind, lang))
                }
                PropertyPath::Sitelink { site } => {
                    let Some(item) = item_of(value, session).await? else {
                        return Ok(Vec::new());
                    };
                    Ok(item
                        .sitelinks
                        .get(site)
                        .map(|title| Value::Identifier {
                            value: Some(title.clone()),
                        })
                        .into_iter()
                        .collect())
                }
                PropertyPath::Concat(a, b) => {
                    let mut values = Vec::new();
                    for intermediate in a.step(value, session, references, rank).await? {
                        values.extend(b.step(&intermediate, session, references, rank).await?);
                    }
                    Ok(values)
                }
                PropertyPath::Disjunct(a, b) => {
                    let mut values = a.step(value, session, references, rank).await?;
                    values.extend(b.step(value, session, references, rank).await?);
                    Ok(values)
                }
                PropertyPath::Subfield { path, name } => {
                    let values = path.step(value, session, references, rank).await?;
                    Ok(values
                        .iter()
                        .map(|v| subfields::apply(name, v))
                        .filter(|v| *v != Value::Undefined)
                        .collect())
                }
            }
        })
    }

    /// Evaluates the path on an item and renders the results as strings:
    /// entity values become labels (or all labels and aliases when no
    /// language is given), everything else its string form.
    pub async fn evaluate(
        &self,
        item: &Value,
        lang: Option<&str>,
        fetch_labels: bool,
        session: &StoreSession<'_>,
    ) -> Result<Vec<String>> {
        let values = self
            .step(item, session, ReferencePolicy::Any, RankPolicy::Any)
            .await?;
        let mut rendered = Vec::new();
        for value in values {
            match (&value, fetch_labels) {
                (Value::Item { id: Some(id) }, true) => match lang {
                    Some(lang) => rendered.push(session.get_label(id, lang).await?),
                    None => {
                        if let Some(entity) = session.get_item(id).await? {
                            rendered.extend(entity.labels.values().cloned());
                            rendered.extend(entity.aliases.iter().cloned());
                        }
                    }
                },
                (Value::Item { id: Some(id) }, false) => rendered.push(id.clone()),
                (Value::Item { id: None }, _) => {}
                _ => rendered.push(value.as_string()),
            }
        }
        Ok(rendered)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render("", &mut out);
        f.write_str(&out)
    }
}

async fn item_of(
    value: &Value,
    session: &StoreSession<'_>,
) -> Result<Option<Arc<Entity>>> {
    match value {
        Value::Item { id: Some(id) } => session.get_item(id).await,
        _ => Ok(None),
    }
}

fn term_values(entity: &Entity, kind: TermKind, lang: &str) -> Vec<Value> {
    // exact language, no fallback chain
    match kind {
        TermKind::Label => entity
            .labels
            .get(lang)
            .map(|text| Value::Identifier {
                value: Some(text.clone()),
            })
            .into_iter()
            .collect(),
        TermKind::Description => entity
            .descriptions
            .get(lang)
            .map(|text| Value::Identifier {
                value: Some(text.clone()),
            })
            .into_iter()
            .collect(),
        TermKind::Alias => entity
            .full_aliases
            .get(lang)
            .into_iter()
            .flatten()
            .map(|alias| Value::Identifier {
                value: Some(alias.clone()),
            })
            .collect(),
    }
}

fn filter_claims<'e>(
    claims: &'e [Claim],
    rank: RankPolicy,
    references: ReferencePolicy,
) -> impl Iterator<Item = &'e Claim> {
    let min_rank = match rank {
        RankPolicy::Any => None,
        RankPolicy::NoDeprecated => Some(Rank::Normal),
        RankPolicy::Best => claims.iter().map(|claim| claim.rank).max(),
    };
    claims
        .iter()
        .filter(move |claim| min_rank.is_none_or(|min| claim.rank >= min))
        .filter(move |claim| match references {
            ReferencePolicy::Any => true,
            ReferencePolicy::Referenced | ReferencePolicy::NoWiki => claim.reference_count > 0,
        })
}

/// Builds paths and answers identifier-property questions against the
/// cached set of unique-identifier properties.
pub struct PathFactory {
    cache: Cache,
    sparql: SparqlClient,
    config: Arc<ServiceConfig>,
}

impl PathFactory {
    pub fn new(cache: Cache, sparql: SparqlClient, config: Arc<ServiceConfig>) -> Self {
        PathFactory {
            cache,
            sparql,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Parses a path string. Failures carry the `bad-path` error kind.
    pub fn parse(&self, input: &str) -> Result<PropertyPath> {
        parse::parse_path(input).map_err(|reason| ServiceError::BadPath {
            path: input.to_string(),
            reason,
        })
    }

    fn unique_ids_key(&self) -> String {
        self.cache.key(&["unique_ids"])
    }

    /// Does this property hold unique identifiers?
    pub async fn is_identifier_pid(&self, pid: &str) -> Result<bool> {
        self.prefetch_unique_ids().await?;
        Ok(self.cache.sismember(&self.unique_ids_key(), pid).await)
    }

    /// Fetches the identifier-property set once and caches it for a day.
    async fn prefetch_unique_ids(&self) -> Result<()> {
        let key = self.unique_ids_key();
        if self.cache.exists(&key).await {
            return Ok(());
        }
        let rows = self.sparql.query(&self.config.unique_ids_query).await?;
        let pids: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("pid"))
            .filter_map(|term| self.config.property_id(&term.value))
            .collect();
        self.cache.sadd_with_ttl(&key, &pids, UNIQUE_IDS_TTL).await
    }

    async fn identifier_leaves(&self, path: &PropertyPath) -> Result<HashSet<String>> {
        let mut pids = Vec::new();
        path.leaf_pids(&mut pids);
        let mut identifiers = HashSet::new();
        for pid in pids {
            if self.is_identifier_pid(pid).await? {
                identifiers.insert(pid.to_string());
            }
        }
        Ok(identifiers)
    }

    /// Whether values along this path uniquely determine the item: the path
    /// must have uniform depth one and every leaf must be an identifier
    /// property. Term, sitelink, qualifier and subfield nodes make a path
    /// non-unique rather than erroring.
    pub async fn is_unique_identifier(&self, path: &PropertyPath) -> Result<bool> {
        let identifiers = self.identifier_leaves(path).await?;
        Ok(path.uniform_depth(&|pid| identifiers.contains(pid)) == Some(1))
    }

    /// Whether the terminal steps of the path produce unique identifiers.
    pub async fn ends_with_identifier(&self, path: &PropertyPath) -> Result<bool> {
        let identifiers = self.identifier_leaves(path).await?;
        Ok(path.ends_with(&|pid| identifiers.contains(pid)))
    }

    /// Reverse lookup: all items bearing any of the given values along this
    /// path, with a label in the requested language. Capped at four times
    /// the number of values, on the assumption that the path is (close to)
    /// a unique identifier.
    pub async fn fetch_qids_by_values(
        &self,
        path: &PropertyPath,
        values: &[String],
        lang: &str,
    ) -> Result<HashMap<String, Vec<(String, String)>>> {
        if values.is_empty() {
            return Ok(HashMap::new());
        }
        let quoted: Vec<String> = values
            .iter()
            .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        let query = format!(
            r#"
        SELECT ?qid ?value
        (SAMPLE(COALESCE(?best_label, ?fallback_label)) as ?label)
        WHERE {{
            ?qid {path} ?value.
            VALUES ?value {{ {values} }}
            OPTIONAL {{
                ?qid rdfs:label ?best_label .
                FILTER(LANG(?best_label) = "{lang}")
            }}
            OPTIONAL {{ ?qid rdfs:label ?fallback_label }}
        }}
        GROUP BY ?qid ?value
        LIMIT {limit}
        "#,
            path = path.to_sparql(&self.config.property_prefix),
            values = quoted.join(" "),
            lang = lang,
            limit = 4 * values.len()
        );

        let rows = self.sparql.query(&query).await?;
        let mut by_value: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for row in rows {
            let Some(qid) = row.get("qid").and_then(|t| self.config.item_id(&t.value)) else {
                continue;
            };
            let Some(value) = row.get("value").map(|t| t.value.clone()) else {
                continue;
            };
            let label = row
                .get("label")
                .map(|t| t.value.clone())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| qid.clone());
            by_value.entry(value).or_default().push((qid, label));
        }
        Ok(by_value)
    }
}

pub use parse::parse_path;
