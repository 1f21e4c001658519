//! Sitelink resolution: wiki URLs to entity ids.
//!
//! A sitelink like `http://en.wikipedia.org/wiki/cluny` is parsed,
//! normalized (`https://en.wikipedia.org/wiki/Cluny`), its title chased
//! through redirects on the source wiki, and finally resolved to an entity
//! id through the Wikibase API. Successful resolutions are cached; misses
//! are not, so a page linked after we first saw it resolves on the next try.

use crate::cache::Cache;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::mediawiki::MediawikiClient;
use once_cell::sync::Lazy;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SITELINK_TTL: Duration = Duration::from_secs(60 * 60);

const WIKIMEDIA_SITES: &[&str] = &[
    "wikipedia",
    "wikisource",
    "wikivoyage",
    "wikiquote",
    "wikinews",
    "wikiversity",
    "wiktionary",
    "wikibooks",
];

/// Wikis whose titles are not capitalized (wiktionary entries are
/// case-sensitive on the first letter).
const SITES_WITHOUT_CAPITALIZATION: &[&str] = &["wiktionary"];

static SITELINK_RE: Lazy<Regex> = Lazy::new(|| {
    // Title characters per MediaWiki's $wgLegalTitleChars.
    let title_chars = r#" %!"$&'()*,\-./0-9:;=?@A-Z\\^_`a-z~\x80-\xFF+"#;
    Regex::new(&format!(
        r"^https?://([a-z]*)\.({})\.org/wiki/([{}]+)$",
        WIKIMEDIA_SITES.join("|"),
        title_chars
    ))
    .expect("sitelink regex")
});

/// Characters percent-encoded inside normalized titles (the quote-plus set).
const TITLE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'&')
    .add(b'+')
    .add(b'\'');

/// A parsed sitelink: language code, wiki family and decoded title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSitelink {
    pub lang: String,
    pub wiki: String,
    pub title: String,
}

/// Parses a candidate sitelink into its components, decoding the title and
/// applying first-letter capitalization where the wiki does.
pub fn parse(sitelink: &str) -> Option<ParsedSitelink> {
    let trimmed = sitelink.trim();
    let caps = SITELINK_RE.captures(trimmed)?;
    let lang = caps.get(1)?.as_str().to_string();
    let wiki = caps.get(2)?.as_str().to_string();

    let raw_title = caps.get(3)?.as_str().replace("%20", " ").replace('_', " ");
    let decoded = percent_decode_str(&raw_title.replace('+', " "))
        .decode_utf8()
        .ok()?
        .into_owned();
    let title = if SITES_WITHOUT_CAPITALIZATION.contains(&wiki.as_str()) {
        decoded
    } else {
        capitalize_first(&decoded)
    };
    if title.is_empty() {
        return None;
    }
    Some(ParsedSitelink { lang, wiki, title })
}

/// Normalizes a candidate sitelink to its canonical `https://` form, or
/// `None` when the input is not a sitelink. Idempotent.
pub fn normalize(sitelink: &str) -> Option<String> {
    let parsed = parse(sitelink)?;
    let title_underscored = parsed.title.replace(' ', "_");
    let encoded = utf8_percent_encode(&title_underscored, TITLE_ENCODE_SET);
    Some(format!(
        "https://{}.{}.org/wiki/{}",
        parsed.lang, parsed.wiki, encoded
    ))
}

/// The site id the entity API uses: `enwiki`, `dewikibooks`, ...
pub fn wiki_id(lang: &str, wiki: &str) -> String {
    let suffix = if wiki == "wikipedia" { "wiki" } else { wiki };
    format!("{lang}{suffix}")
}

fn capitalize_first(title: &str) -> String {
    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

pub struct SitelinkResolver {
    cache: Cache,
    client: MediawikiClient,
    config: Arc<ServiceConfig>,
}

impl SitelinkResolver {
    pub fn new(cache: Cache, client: MediawikiClient, config: Arc<ServiceConfig>) -> Self {
        SitelinkResolver {
            cache,
            client,
            config,
        }
    }

    fn key(&self, normalized: &str) -> String {
        self.cache.key(&["sitelinks", normalized])
    }

    /// Resolves a batch of candidate sitelinks to entity ids. Inputs that
    /// are not sitelinks are ignored; the result maps *normalized* links to
    /// ids, so callers must normalize their lookup keys the same way.
    pub async fn sitelinks_to_qids(&self, links: &[String]) -> Result<HashMap<String, String>> {
        let normalized: Vec<String> = links.iter().filter_map(|l| normalize(l)).collect();
        if normalized.is_empty() {
            return Ok(HashMap::new());
        }

        let mut result = HashMap::new();
        let mut to_fetch: Vec<String> = Vec::new();
        let keys: Vec<String> = normalized.iter().map(|l| self.key(l)).collect();
        for (link, cached) in normalized.iter().zip(self.cache.mget(&keys).await) {
            match cached {
                Some(id) => {
                    result.insert(link.clone(), id);
                }
                None => {
                    if !to_fetch.contains(link) {
                        to_fetch.push(link.clone());
                    }
                }
            }
        }
        if to_fetch.is_empty() {
            return Ok(result);
        }

        let fetched = self.resolve_upstream(&to_fetch).await?;
        let writes: Vec<(String, String)> = fetched
            .iter()
            .map(|(link, id)| (self.key(link), id.clone()))
            .collect();
        self.cache.mset_with_ttl(&writes, SITELINK_TTL).await?;
        result.extend(fetched);
        Ok(result)
    }

    /// Groups links by (lang, wiki), resolves redirects on each wiki in one
    /// batch, then asks the entity API for the ids by final title.
    async fn resolve_upstream(&self, normalized: &[String]) -> Result<HashMap<String, String>> {
        let mut by_wiki: HashMap<(String, String), Vec<(String, String)>> = HashMap::new();
        for link in normalized {
            if let Some(parsed) = parse(link) {
                by_wiki
                    .entry((parsed.lang.clone(), parsed.wiki.clone()))
                    .or_default()
                    .push((link.clone(), parsed.title));
            }
        }

        let mut result = HashMap::new();
        for ((lang, wiki), links) in by_wiki {
            let titles: Vec<String> = links.iter().map(|(_, title)| title.clone()).collect();
            let api_url = self.config.wiki_api_url(&lang, &wiki);
            let redirects = self.client.resolve_redirects(&api_url, &titles).await?;

            // follow redirect chains to their final target
            let final_titles: Vec<String> = titles
                .iter()
                .map(|title| {
                    let mut current = title.clone();
                    let mut hops = 0;
                    while let Some(next) = redirects.get(&current) {
                        current = next.clone();
                        hops += 1;
                        if hops > 16 {
                            break;
                        }
                    }
                    current
                })
                .collect();

            let site = wiki_id(&lang, &wiki);
            let entities = self
                .client
                .get_entities_by_titles(&site, &final_titles)
                .await?;

            // map each entity back to the link whose final title it carries
            let mut title_to_id: HashMap<String, String> = HashMap::new();
            for (id, body) in &entities {
                if let Some(own_title) = body["sitelinks"][&site]["title"].as_str() {
                    title_to_id.insert(own_title.to_string(), id.clone());
                }
            }
            for ((link, _), final_title) in links.iter().zip(final_titles) {
                if let Some(id) = title_to_id.get(&final_title) {
                    result.insert(link.clone(), id.clone());
                }
            }
        }
        Ok(result)
    }
}
