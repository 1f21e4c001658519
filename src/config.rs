//! Service configuration.
//!
//! A single immutable [`ServiceConfig`] is built at startup from an optional
//! TOML file merged with CLI flags, and threaded to every component in an
//! `Arc`. Defaults target the canonical Wikidata instance; pointing the
//! service at another Wikibase only requires overriding the endpoints and id
//! patterns in the file.

use anyhow::{Context, Result};
use clap::Parser;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Debug, Parser)]
#[command(name = "wikibase-reconcile", version, about)]
pub struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(long, env = "RECONCILE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP server to
    #[arg(long, env = "RECONCILE_BIND")]
    pub bind: Option<SocketAddr>,

    /// Cache URI (`redis://...` or `memory://` for a process-local cache)
    #[arg(long, env = "RECONCILE_CACHE_URI")]
    pub cache_uri: Option<String>,
}

/// Immutable service configuration, shared via `Arc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// MediaWiki API endpoint of the Wikibase instance.
    pub mediawiki_api_endpoint: String,
    /// SPARQL endpoint of the Wikibase instance.
    pub sparql_endpoint: String,
    /// Human-readable name of the instance, used in the manifest.
    pub service_name: String,
    /// Public URL of this service (no trailing slash), used in the manifest.
    pub this_host: String,
    /// Namespace id used for full-text item search (0 on Wikidata, usually
    /// 120 for `Item:` on stock Wikibase).
    pub wikibase_namespace_id: u32,
    /// Namespace prefix in front of item titles, including the colon.
    pub wikibase_namespace_prefix: String,
    pub user_agent: String,

    /// Regex extracting an item id from a bare id or an entity IRI, with the
    /// capture group holding the id.
    pub item_id_pattern: String,
    pub item_id_group: usize,
    pub property_id_pattern: String,
    pub property_id_group: usize,

    /// IRI spaces exposed in the manifest; must match the instance's RDF
    /// serialization exactly (http vs https matters for comparisons).
    pub identifier_space: String,
    pub schema_space: String,
    /// Prefix put in front of property ids when rendering SPARQL paths.
    pub property_prefix: String,
    /// View URL pattern, `{{id}}` replaced by the entity id.
    pub entity_url_pattern: String,

    /// Items that are (transitively) instances of this class are filtered
    /// out of untyped reconciliation queries. `None` disables the filter.
    pub avoid_class: Option<String>,
    /// The root type, removed from requested target types before gating.
    pub default_type_entity: Option<String>,
    /// Property path used to derive the types of an item.
    pub type_property_path: String,
    /// Property linking a class to the properties its instances carry.
    pub property_for_this_type: Option<String>,

    pub default_num_results: usize,
    /// Hard cap of the upstream search API (more requires a bot account).
    pub api_max_search_results: usize,
    /// Score above which the top candidate may be auto-matched.
    pub validation_threshold: f64,

    /// Properties tried in order to find a preview image.
    pub image_properties: Vec<String>,
    pub thumbnail_width: u32,
    pub fallback_image_url: String,
    pub fallback_image_alt: String,
    pub preview_width: u32,
    pub preview_height: u32,
    /// Autodescription service for items without a usable description.
    /// `None` disables the call.
    pub autodescribe_endpoint: Option<String>,

    pub cache_uri: String,
    /// Namespace put in front of every cache key.
    pub cache_key_prefix: String,

    /// SPARQL query fetching the subclass closure of `$qid`.
    pub subclasses_query: String,
    /// SPARQL query listing all unique-identifier properties.
    pub unique_ids_query: String,
    /// SPARQL query proposing properties for a class (BFS over subclasses).
    pub propose_properties_query: String,

    /// URL pattern of a sister wiki's own API, with `{lang}` and `{wiki}`
    /// placeholders. Overridable so tests can target a mock server.
    pub wiki_api_url_pattern: String,

    pub bind_address: SocketAddr,
    pub http_timeout_secs: u64,
    pub max_connections_per_host: usize,

    #[serde(skip)]
    id_rules: OnceCell<IdRules>,
}

#[derive(Debug, Clone)]
struct IdRules {
    item: Regex,
    item_group: usize,
    property: Regex,
    property_group: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            mediawiki_api_endpoint: "https://www.wikidata.org/w/api.php".into(),
            sparql_endpoint: "https://query.wikidata.org/sparql".into(),
            service_name: "Wikidata".into(),
            this_host: "http://localhost:8000".into(),
            wikibase_namespace_id: 0,
            wikibase_namespace_prefix: String::new(),
            user_agent: "wikibase-reconcile (Wikibase reconciliation service)".into(),
            item_id_pattern: r"(<?https?://www.wikidata.org/(entity|wiki)/)?(Q[0-9]+)>?".into(),
            item_id_group: 3,
            property_id_pattern:
                r"(<?https?://www.wikidata.org/(entity/|wiki/Property:))?(P[0-9]+)>?".into(),
            property_id_group: 3,
            identifier_space: "http://www.wikidata.org/entity/".into(),
            schema_space: "http://www.wikidata.org/prop/direct/".into(),
            property_prefix: "wdt:".into(),
            entity_url_pattern: "https://www.wikidata.org/wiki/{{id}}".into(),
            avoid_class: Some("Q17442446".into()),
            default_type_entity: Some("Q35120".into()),
            type_property_path: "P31".into(),
            property_for_this_type: Some("P1963".into()),
            default_num_results: 25,
            api_max_search_results: 50,
            validation_threshold: 95.0,
            image_properties: [
                "P18", "P14", "P15", "P158", "P181", "P242", "P1766", "P1801", "P1846", "P2713",
                "P2716", "P2910", "P3311", "P3383", "P3451", "P1621", "P154",
            ]
            .iter()
            .map(|p| (*p).to_string())
            .collect(),
            thumbnail_width: 130,
            fallback_image_url: "https://upload.wikimedia.org/wikipedia/commons/6/66/Wikidata-logo-en.svg".into(),
            fallback_image_alt: "Wikidata".into(),
            preview_width: 400,
            preview_height: 100,
            autodescribe_endpoint: Some("https://tools.wmflabs.org/autodesc/".into()),
            cache_uri: "redis://localhost:6379/0".into(),
            cache_key_prefix: "wikibase_reconcile".into(),
            subclasses_query: "SELECT ?child WHERE { ?child wdt:P279* wd:$qid }".into(),
            unique_ids_query: "SELECT ?pid WHERE { ?pid wdt:P31/wdt:P279* wd:Q19847637 }".into(),
            propose_properties_query: PROPOSE_PROPERTIES_QUERY.into(),
            wiki_api_url_pattern: "https://{lang}.{wiki}.org/w/api.php".into(),
            bind_address: DEFAULT_BIND.parse().expect("default bind address"),
            http_timeout_secs: 30,
            max_connections_per_host: 10,
            id_rules: OnceCell::new(),
        }
    }
}

/// Property proposal over the subclass graph, most specific classes first.
/// Uses the Blazegraph GAS BFS service so results come back in depth order.
const PROPOSE_PROPERTIES_QUERY: &str = r#"
PREFIX wd: <$identifier_space>
PREFIX wdt: <$schema_space>
PREFIX gas: <http://www.bigdata.com/rdf/gas#>
SELECT ?prop ?propLabel ?depth WHERE {
SERVICE gas:service {
    gas:program gas:gasClass "com.bigdata.rdf.graph.analytics.BFS" .
    gas:program gas:in wd:$base_type .
    gas:program gas:out ?out .
    gas:program gas:out1 ?depth .
    gas:program gas:maxIterations 10 .
    gas:program gas:maxVisited 100 .
    gas:program gas:linkType wdt:P279 .
}
SERVICE wikibase:label { bd:serviceParam wikibase:language "$lang" }
?out wdt:$property_for_this_type ?prop .
}
ORDER BY ?depth
LIMIT $limit
"#;

impl ServiceConfig {
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let mut config = match args.config.as_deref() {
            Some(path) => Self::load_file(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(bind) = args.bind {
            config.bind_address = bind;
        }
        if let Some(uri) = args.cache_uri {
            config.cache_uri = uri;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ServiceConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.mediawiki_api_endpoint.is_empty(),
            "mediawiki_api_endpoint must be set"
        );
        anyhow::ensure!(!self.sparql_endpoint.is_empty(), "sparql_endpoint must be set");
        anyhow::ensure!(
            !self.cache_key_prefix.contains(':'),
            "cache_key_prefix must not contain ':' (it is joined with ':')"
        );
        self.rules()
            .map_err(|e| anyhow::anyhow!("invalid id pattern: {e}"))?;
        Ok(())
    }

    fn rules(&self) -> std::result::Result<&IdRules, regex::Error> {
        self.id_rules.get_or_try_init(|| {
            Ok(IdRules {
                item: Regex::new(&self.item_id_pattern)?,
                item_group: self.item_id_group,
                property: Regex::new(&self.property_id_pattern)?,
                property_group: self.property_id_group,
            })
        })
    }

    /// Normalizes an item identifier: accepts a bare id or an entity IRI and
    /// returns the plain id, or `None` when the input is neither.
    pub fn item_id(&self, input: &str) -> Option<String> {
        let rules = self.rules().ok()?;
        let trimmed = input.trim();
        let caps = rules.item.captures(trimmed)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 || whole.end() != trimmed.len() {
            return None;
        }
        caps.get(rules.item_group).map(|m| m.as_str().to_string())
    }

    /// Same as [`Self::item_id`] for property identifiers.
    pub fn property_id(&self, input: &str) -> Option<String> {
        let rules = self.rules().ok()?;
        let trimmed = input.trim();
        let caps = rules.property.captures(trimmed)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 || whole.end() != trimmed.len() {
            return None;
        }
        caps.get(rules.property_group).map(|m| m.as_str().to_string())
    }

    /// View URL for an entity id.
    pub fn entity_url(&self, id: &str) -> String {
        self.entity_url_pattern.replace("{{id}}", id)
    }

    /// API endpoint of a sister wiki (`en` + `wikipedia` → enwiki's API).
    pub fn wiki_api_url(&self, lang: &str, wiki: &str) -> String {
        self.wiki_api_url_pattern
            .replace("{lang}", lang)
            .replace("{wiki}", wiki)
    }
}
