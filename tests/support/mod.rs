//! Shared test harness: a mock Wikibase (MediaWiki API + SPARQL endpoint)
//! served by wiremock, plus wire-format entity fixtures shaped like the
//! live Wikidata answers.

use serde_json::{Value as Json, json};
use std::collections::HashMap;
use std::sync::Arc;
use wikibase_reconcile::cache::Cache;
use wikibase_reconcile::config::ServiceConfig;
use wikibase_reconcile::state::AppState;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate, matchers};

pub fn test_config(server_uri: &str) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.mediawiki_api_endpoint = format!("{server_uri}/w/api.php");
    config.sparql_endpoint = format!("{server_uri}/sparql");
    config.wiki_api_url_pattern = format!("{server_uri}/sister/{{lang}}/{{wiki}}/api.php");
    config.cache_uri = "memory://".to_string();
    config.autodescribe_endpoint = None;
    config
}

pub async fn test_state(server: &MockServer, fixtures: Fixtures) -> Arc<AppState> {
    mount(server, fixtures).await;
    let config = Arc::new(test_config(&server.uri()));
    Arc::new(AppState::with_cache(config, Cache::in_memory()).expect("state"))
}

/// Everything the mock upstream knows.
#[derive(Default, Clone)]
pub struct Fixtures {
    /// Wire-format entity payloads, keyed by id.
    pub entities: HashMap<String, Json>,
    /// Full-text search: query string → entity page titles.
    pub search: HashMap<String, Vec<String>>,
    /// Autocomplete: (entity type, search string) → hits.
    pub autocomplete: HashMap<(String, String), Vec<Json>>,
    /// Subclass closures: class → descendant ids (reflexive).
    pub children: HashMap<String, Vec<String>>,
    /// The unique-identifier property set.
    pub unique_id_properties: Vec<String>,
    /// Reverse identifier lookup: SPARQL path fragment → value → (id, label).
    pub values_lookup: HashMap<String, HashMap<String, Vec<(String, String)>>>,
    /// Property proposal results (gas BFS query): (pid, label) pairs.
    pub proposals: Vec<(String, String)>,
}

impl Fixtures {
    pub fn with_entity(mut self, entity: Json) -> Self {
        let id = entity["id"].as_str().expect("entity id").to_string();
        self.entities.insert(id, entity);
        self
    }

    pub fn with_search(mut self, query: &str, titles: &[&str]) -> Self {
        self.search
            .insert(query.to_string(), titles.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_autocomplete(mut self, entity_type: &str, query: &str, ids: &[&str]) -> Self {
        let hits = ids.iter().map(|id| json!({ "id": id, "label": id })).collect();
        self.autocomplete
            .insert((entity_type.to_string(), query.to_string()), hits);
        self
    }

    pub fn with_children(mut self, class: &str, children: &[&str]) -> Self {
        self.children.insert(
            class.to_string(),
            children.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn with_unique_properties(mut self, pids: &[&str]) -> Self {
        self.unique_id_properties = pids.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_value_lookup(
        mut self,
        path_fragment: &str,
        value: &str,
        matches: &[(&str, &str)],
    ) -> Self {
        self.values_lookup
            .entry(path_fragment.to_string())
            .or_default()
            .insert(
                value.to_string(),
                matches
                    .iter()
                    .map(|(id, label)| (id.to_string(), label.to_string()))
                    .collect(),
            );
        self
    }
}

pub async fn mount(server: &MockServer, fixtures: Fixtures) {
    Mock::given(matchers::any())
        .respond_with(Upstream { fixtures })
        .mount(server)
        .await;
}

struct Upstream {
    fixtures: Fixtures,
}

impl Respond for Upstream {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let params: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let path = request.url.path();
        if path == "/sparql" {
            return self.sparql(params.get("query").map(String::as_str).unwrap_or_default());
        }
        match params.get("action").map(String::as_str) {
            Some("wbgetentities") => self.get_entities(&params),
            Some("wbsearchentities") => self.search_entities(&params),
            Some("query") if params.get("list").map(String::as_str) == Some("search") => {
                self.full_text_search(&params)
            }
            Some("query") if params.contains_key("redirects") => {
                ResponseTemplate::new(200).set_body_json(json!({ "query": { "redirects": [] } }))
            }
            _ => ResponseTemplate::new(404),
        }
    }
}

impl Upstream {
    fn get_entities(&self, params: &HashMap<String, String>) -> ResponseTemplate {
        let mut entities = serde_json::Map::new();
        if let Some(ids) = params.get("ids") {
            for id in ids.split('|') {
                let body = self
                    .fixtures
                    .entities
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| json!({ "id": id, "missing": "" }));
                entities.insert(id.to_string(), body);
            }
        } else if let (Some(site), Some(titles)) = (params.get("sites"), params.get("titles")) {
            for title in titles.split('|') {
                for (id, body) in &self.fixtures.entities {
                    if body["sitelinks"][site]["title"].as_str() == Some(title) {
                        entities.insert(id.clone(), body.clone());
                    }
                }
            }
        }
        ResponseTemplate::new(200).set_body_json(json!({ "entities": entities }))
    }

    fn search_entities(&self, params: &HashMap<String, String>) -> ResponseTemplate {
        let entity_type = params
            .get("type")
            .cloned()
            .unwrap_or_else(|| "item".to_string());
        let search = params.get("search").cloned().unwrap_or_default();
        let hits = self
            .fixtures
            .autocomplete
            .get(&(entity_type, search))
            .cloned()
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({ "search": hits }))
    }

    fn full_text_search(&self, params: &HashMap<String, String>) -> ResponseTemplate {
        let query = params.get("srsearch").cloned().unwrap_or_default();
        let titles: Vec<Json> = self
            .fixtures
            .search
            .get(&query)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|title| json!({ "title": title }))
            .collect();
        ResponseTemplate::new(200)
            .set_body_json(json!({ "query": { "search": titles } }))
    }

    fn sparql(&self, query: &str) -> ResponseTemplate {
        let bindings = if query.contains("Q19847637") {
            self.fixtures
                .unique_id_properties
                .iter()
                .map(|pid| {
                    json!({ "pid": { "value": format!("http://www.wikidata.org/entity/{pid}") } })
                })
                .collect::<Vec<Json>>()
        } else if query.contains("P279*") {
            let class = self
                .fixtures
                .children
                .keys()
                .find(|class| query.contains(&format!("wd:{class}")));
            match class {
                Some(class) => self.fixtures.children[class]
                    .iter()
                    .map(|child| {
                        json!({ "child": { "value": format!("http://www.wikidata.org/entity/{child}") } })
                    })
                    .collect(),
                None => Vec::new(),
            }
        } else if query.contains("VALUES ?value") {
            let mut bindings = Vec::new();
            for (fragment, by_value) in &self.fixtures.values_lookup {
                if !query.contains(fragment) {
                    continue;
                }
                for (value, matches) in by_value {
                    if !query.contains(&format!("\"{value}\"")) {
                        continue;
                    }
                    for (id, label) in matches {
                        bindings.push(json!({
                            "qid": { "value": format!("http://www.wikidata.org/entity/{id}") },
                            "value": { "value": value },
                            "label": { "value": label },
                        }));
                    }
                }
            }
            bindings
        } else if query.contains("gas:service") {
            self.fixtures
                .proposals
                .iter()
                .map(|(pid, label)| {
                    json!({
                        "prop": { "value": format!("http://www.wikidata.org/entity/{pid}") },
                        "propLabel": { "value": label },
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
        ResponseTemplate::new(200)
            .set_body_json(json!({ "results": { "bindings": bindings } }))
    }
}

// ---------------------------------------------------------------------
// wire-format entity builders
// ---------------------------------------------------------------------

pub fn entity(id: &str, label_en: &str) -> EntityBuilder {
    EntityBuilder {
        id: id.to_string(),
        labels: vec![("en".to_string(), label_en.to_string())],
        descriptions: Vec::new(),
        aliases: Vec::new(),
        sitelinks: Vec::new(),
        claims: Vec::new(),
    }
}

pub struct EntityBuilder {
    id: String,
    labels: Vec<(String, String)>,
    descriptions: Vec<(String, String)>,
    aliases: Vec<(String, String)>,
    sitelinks: Vec<(String, String)>,
    claims: Vec<(String, Json)>,
}

impl EntityBuilder {
    pub fn label(mut self, lang: &str, text: &str) -> Self {
        self.labels.push((lang.to_string(), text.to_string()));
        self
    }

    pub fn description(mut self, lang: &str, text: &str) -> Self {
        self.descriptions.push((lang.to_string(), text.to_string()));
        self
    }

    pub fn alias(mut self, lang: &str, text: &str) -> Self {
        self.aliases.push((lang.to_string(), text.to_string()));
        self
    }

    pub fn sitelink(mut self, site: &str, title: &str) -> Self {
        self.sitelinks.push((site.to_string(), title.to_string()));
        self
    }

    pub fn claim(mut self, pid: &str, datatype: &str, datavalue: Json) -> Self {
        self.claims.push((
            pid.to_string(),
            json!({
                "mainsnak": {
                    "snaktype": "value",
                    "property": pid,
                    "datatype": datatype,
                    "datavalue": datavalue,
                },
                "rank": "normal",
            }),
        ));
        self
    }

    pub fn item_claim(self, pid: &str, target: &str) -> Self {
        self.claim(
            pid,
            "wikibase-item",
            json!({ "value": { "entity-type": "item", "id": target }, "type": "wikibase-entityid" }),
        )
    }

    pub fn string_claim(self, pid: &str, datatype: &str, value: &str) -> Self {
        self.claim(pid, datatype, json!({ "value": value, "type": "string" }))
    }

    pub fn time_claim(self, pid: &str, time: &str, precision: u8) -> Self {
        self.claim(
            pid,
            "time",
            json!({
                "value": {
                    "time": time,
                    "precision": precision,
                    "calendarmodel": "http://www.wikidata.org/entity/Q1985727",
                },
                "type": "time",
            }),
        )
    }

    pub fn coords_claim(self, pid: &str, latitude: f64, longitude: f64) -> Self {
        self.claim(
            pid,
            "globe-coordinate",
            json!({
                "value": {
                    "latitude": latitude,
                    "longitude": longitude,
                    "globe": "http://www.wikidata.org/entity/Q2",
                },
                "type": "globecoordinate",
            }),
        )
    }

    pub fn build(self) -> Json {
        let labels: serde_json::Map<String, Json> = self
            .labels
            .into_iter()
            .map(|(lang, text)| (lang.clone(), json!({ "language": lang, "value": text })))
            .collect();
        let descriptions: serde_json::Map<String, Json> = self
            .descriptions
            .into_iter()
            .map(|(lang, text)| (lang.clone(), json!({ "language": lang, "value": text })))
            .collect();
        let mut aliases: serde_json::Map<String, Json> = serde_json::Map::new();
        for (lang, text) in self.aliases {
            let list = aliases.entry(lang.clone()).or_insert_with(|| json!([]));
            list.as_array_mut()
                .unwrap()
                .push(json!({ "language": lang, "value": text }));
        }
        let sitelinks: serde_json::Map<String, Json> = self
            .sitelinks
            .into_iter()
            .map(|(site, title)| (site.clone(), json!({ "site": site, "title": title })))
            .collect();
        let mut claims: serde_json::Map<String, Json> = serde_json::Map::new();
        for (pid, claim) in self.claims {
            let list = claims.entry(pid).or_insert_with(|| json!([]));
            list.as_array_mut().unwrap().push(claim);
        }
        json!({
            "id": self.id,
            "type": "item",
            "labels": labels,
            "descriptions": descriptions,
            "aliases": aliases,
            "sitelinks": sitelinks,
            "claims": claims,
        })
    }
}
