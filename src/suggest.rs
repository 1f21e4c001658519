//! Autocomplete, flyouts and previews for interactive use.
//!
//! Suggestions come from the upstream autocomplete API. `find_property`
//! additionally recognizes property-path syntax and offers the path itself
//! as a synthetic first suggestion. Previews assemble a small HTML card
//! with an image (first hit over the configured image properties, served
//! from the Commons thumbnail bucket scheme) and a description, optionally
//! autogenerated by the autodescribe service with a hard 2 s deadline.

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::itemstore::{Entity, ItemStore, StoreSession};
use crate::mediawiki::MediawikiClient;
use crate::model::{FlyoutResponse, ProposalResponse, SuggestResponse, Suggestion};
use crate::path::{PathFactory, PropertyPath, RankPolicy, ReferencePolicy};
use crate::sparql::{SparqlClient, substitute};
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const AUTODESCRIBE_TIMEOUT: Duration = Duration::from_secs(2);
const SUGGEST_ENTITY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_PROPOSAL_LIMIT: usize = 20;
const MAX_PROPOSAL_LIMIT: usize = 50;

static PREVIEW_TEMPLATE: &str = include_str!("../templates/preview.html");

/// Matches inputs that look like the start of a property path, with an
/// optional pasted-back `SPARQL:` prefix.
static PROPERTY_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(SPARQL ?:? ?)?(\(*(P\d+|[LAD][a-z\-]+)[/\|@].*)$").expect("path prefix regex")
});

pub struct SuggestEngine {
    store: ItemStore,
    paths: PathFactory,
    client: MediawikiClient,
    sparql: SparqlClient,
    http: reqwest::Client,
    config: Arc<ServiceConfig>,
    image_path: Option<PropertyPath>,
}

impl SuggestEngine {
    pub fn new(
        store: ItemStore,
        paths: PathFactory,
        client: MediawikiClient,
        sparql: SparqlClient,
        http: reqwest::Client,
        config: Arc<ServiceConfig>,
    ) -> Result<Self> {
        let store = store.with_entity_ttl(SUGGEST_ENTITY_TTL);
        let image_path = match config.image_properties.len() {
            0 => None,
            1 => Some(paths.parse(&config.image_properties[0])?),
            _ => Some(paths.parse(&format!("({})", config.image_properties.join("|")))?),
        };
        Ok(SuggestEngine {
            store,
            paths,
            client,
            sparql,
            http,
            config,
            image_path,
        })
    }

    async fn find_something(
        &self,
        prefix: &str,
        entity_type: &str,
        lang: &str,
    ) -> Result<SuggestResponse> {
        let hits = self
            .client
            .search_entities(prefix, entity_type, DEFAULT_PROPOSAL_LIMIT, lang)
            .await?;
        let result = hits
            .into_iter()
            .map(|hit| Suggestion {
                name: hit.label.unwrap_or_else(|| hit.id.clone()),
                id: hit.id,
                description: hit.description,
            })
            .collect();
        Ok(SuggestResponse { result })
    }

    pub async fn find_type(&self, prefix: &str, lang: &str) -> Result<SuggestResponse> {
        self.find_something(prefix, "item", lang).await
    }

    pub async fn find_entity(&self, prefix: &str, lang: &str) -> Result<SuggestResponse> {
        self.find_something(prefix, "item", lang).await
    }

    /// Property autocomplete. When the prefix reads as a property path
    /// (and is more than a bare `Pddd`), the path itself is offered first.
    pub async fn find_property(&self, prefix: &str, lang: &str) -> Result<SuggestResponse> {
        let trimmed = prefix.trim();
        let mut result = Vec::new();
        let source = PROPERTY_PATH_RE
            .captures(trimmed)
            .and_then(|caps| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or(trimmed);
        if self.paths.parse(source).is_ok() && self.config.property_id(source).is_none() {
            result.push(Suggestion {
                id: source.to_string(),
                name: format!("SPARQL: {source}"),
                description: Some("property path".to_string()),
            });
        }
        result.extend(self.find_something(prefix, "property", lang).await?.result);
        Ok(SuggestResponse { result })
    }

    pub async fn flyout(&self, id: &str, lang: &str) -> Result<FlyoutResponse> {
        if id.is_empty() {
            return Ok(FlyoutResponse {
                id: id.to_string(),
                html: None,
            });
        }
        let session = self.store.session();
        let description = match session.get_item(id).await? {
            Some(item) => self.get_description(&item, lang).await,
            None => String::new(),
        };
        Ok(FlyoutResponse {
            id: id.to_string(),
            html: Some(format!(
                "<p style=\"font-size: 0.8em; color: black;\">{description}</p>"
            )),
        })
    }

    /// The HTML hover card for an entity.
    pub async fn preview(&self, id: &str, lang: &str) -> Result<String> {
        let id = self
            .config
            .item_id(id)
            .ok_or_else(|| ServiceError::bad_argument(format!("invalid entity id '{id}'")))?;
        let session = self.store.session();
        let item = session.get_item(&id).await?;

        let (label, description, image) = match &item {
            Some(item) => {
                let label = item.label(lang).unwrap_or(&id).to_string();
                let description = self.get_description(item, lang).await;
                let image = self.image_for_item(&id, item, lang, &session).await?;
                (label, description, image)
            }
            None => (
                id.clone(),
                String::new(),
                (
                    self.config.fallback_image_url.clone(),
                    self.config.fallback_image_alt.clone(),
                ),
            ),
        };

        let mut context = tera::Context::new();
        context.insert("id", &id);
        context.insert("label", &html_escape::encode_text(&label).into_owned());
        context.insert("description", &description);
        context.insert("image_url", &image.0);
        context.insert("image_alt", &html_escape::encode_quoted_attribute(&image.1).into_owned());
        context.insert("url", &self.config.entity_url(&id));
        context.insert("width", &self.config.preview_width);
        context.insert("height", &self.config.preview_height);
        context.insert("thumbnail_width", &self.config.thumbnail_width);
        tera::Tera::one_off(PREVIEW_TEMPLATE, &context, false)
            .map_err(|err| ServiceError::bad_argument(format!("preview rendering failed: {err}")))
    }

    /// First image statement of the item, as a Commons thumbnail URL with
    /// the item label as alt text; the configured fallback otherwise.
    async fn image_for_item(
        &self,
        id: &str,
        item: &Entity,
        lang: &str,
        session: &StoreSession<'_>,
    ) -> Result<(String, String)> {
        if let Some(image_path) = &self.image_path {
            let item_value = Value::Item {
                id: Some(id.to_string()),
            };
            let images = image_path
                .step(&item_value, session, ReferencePolicy::Any, RankPolicy::Any)
                .await?;
            if let Some(filename) = images
                .iter()
                .filter(|v| !v.is_novalue())
                .map(Value::as_string)
                .find(|name| !name.is_empty())
            {
                let alt = item.label(lang).unwrap_or(id).to_string();
                return Ok((
                    commons_image_url(&filename, self.config.thumbnail_width),
                    alt,
                ));
            }
        }
        Ok((
            self.config.fallback_image_url.clone(),
            self.config.fallback_image_alt.clone(),
        ))
    }

    /// A stored description when it reads like a sentence, otherwise a
    /// best-effort autodescription. Failures degrade to the empty string.
    async fn get_description(&self, item: &Entity, lang: &str) -> String {
        if let Some(description) = item.descriptions.get(lang) {
            if description.contains(' ') {
                return html_escape::encode_text(description).into_owned();
            }
        }
        self.autodescribe(&item.id, lang).await
    }

    async fn autodescribe(&self, id: &str, lang: &str) -> String {
        let Some(endpoint) = &self.config.autodescribe_endpoint else {
            return String::new();
        };
        let request = self
            .http
            .get(endpoint)
            .query(&[
                ("q", id),
                ("format", "json"),
                ("mode", "short"),
                ("links", "wikidata"),
                ("get_infobox", "yes"),
                ("lang", lang),
            ])
            .timeout(AUTODESCRIBE_TIMEOUT)
            .send();
        let description = async {
            let response = request.await.ok()?;
            let body: serde_json::Value = response.json().await.ok()?;
            body["result"].as_str().map(str::to_string)
        }
        .await;
        match description {
            Some(text) => text.replace("<a href", "<a target=\"_blank\" href"),
            None => {
                debug!(id, "autodescribe unavailable, using empty description");
                String::new()
            }
        }
    }

    /// Proposes properties for a reconciled type by walking the subclass
    /// graph breadth-first; nearest classes contribute first.
    pub async fn propose_properties(
        &self,
        base_type: Option<&str>,
        limit: Option<usize>,
        lang: &str,
    ) -> Result<ProposalResponse> {
        let base_type = base_type
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.default_type_entity.clone())
            .ok_or_else(|| ServiceError::bad_argument("no 'type' provided"))?;
        let Some(property_for_this_type) = &self.config.property_for_this_type else {
            return Ok(ProposalResponse {
                base_type,
                properties: vec![qid_fallback()],
            });
        };
        let limit = limit
            .unwrap_or(DEFAULT_PROPOSAL_LIMIT)
            .min(MAX_PROPOSAL_LIMIT);

        let query = substitute(
            &self.config.propose_properties_query,
            &[
                ("identifier_space", self.config.identifier_space.as_str()),
                ("schema_space", self.config.schema_space.as_str()),
                ("property_for_this_type", property_for_this_type.as_str()),
                ("base_type", base_type.as_str()),
                ("lang", lang),
                ("limit", &limit.to_string()),
            ],
        );
        let rows = self.sparql.query(&query).await?;

        let mut properties = Vec::new();
        for row in &rows {
            let Some(pid) = row.get("prop").and_then(|t| self.config.property_id(&t.value))
            else {
                continue;
            };
            let name = row
                .get("propLabel")
                .map(|t| t.value.clone())
                .filter(|label| !label.is_empty())
                .unwrap_or_else(|| pid.clone());
            properties.push(Suggestion {
                id: pid,
                name,
                description: None,
            });
        }
        if properties.is_empty() {
            properties.push(qid_fallback());
        }
        Ok(ProposalResponse {
            base_type,
            properties,
        })
    }
}

fn qid_fallback() -> Suggestion {
    Suggestion {
        id: "qid".to_string(),
        name: "Qid".to_string(),
        description: None,
    }
}

/// Commons hosts thumbnails under an md5-bucketed directory layout; SVGs
/// are rendered to PNG.
fn commons_image_url(filename: &str, width: u32) -> String {
    let filename = filename.replace(' ', "_");
    let digest = format!("{:x}", md5::compute(filename.as_bytes()));
    let mut url = format!(
        "https://upload.wikimedia.org/wikipedia/commons/thumb/{}/{}/{}/{}px-{}",
        &digest[0..1],
        &digest[0..2],
        filename,
        width,
        filename
    );
    if filename.to_lowercase().ends_with(".svg") {
        url.push_str(".png");
    }
    url
}
