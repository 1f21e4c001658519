//! Transitive subclass matching.
//!
//! `is_subclass(a, b)` means "a is-a b" through the subclass-of relation,
//! reflexively and transitively. The descendant set of `b` is materialized
//! once with a SPARQL query and cached as a set for a day; after that a
//! membership test is a single cache probe. Instance-of is never followed.

use crate::cache::Cache;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::sparql::{SparqlClient, substitute};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CHILDREN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct TypeMatcher {
    cache: Cache,
    sparql: SparqlClient,
    config: Arc<ServiceConfig>,
}

impl TypeMatcher {
    pub fn new(cache: Cache, sparql: SparqlClient, config: Arc<ServiceConfig>) -> Self {
        TypeMatcher {
            cache,
            sparql,
            config,
        }
    }

    /// Opens a per-request session memoizing the pairs it has already
    /// answered, so scoring many candidates against the same target class
    /// costs one probe per distinct pair.
    pub fn session(&self) -> TypeMatcherSession<'_> {
        TypeMatcherSession {
            matcher: self,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn children_key(&self, class: &str) -> String {
        self.cache.key(&["children", class])
    }

    async fn is_subclass_uncached(&self, class: &str, ancestor: &str) -> Result<bool> {
        self.prefetch_children(ancestor).await?;
        Ok(self
            .cache
            .sismember(&self.children_key(ancestor), class)
            .await)
    }

    /// Materializes the (reflexive) descendant set of a class. No partial
    /// sets: nothing is written when the query fails.
    async fn prefetch_children(&self, class: &str) -> Result<()> {
        let key = self.children_key(class);
        if self.cache.exists(&key).await {
            return Ok(());
        }
        let query = substitute(&self.config.subclasses_query, &[("qid", class)]);
        let rows = self.sparql.query(&query).await?;
        let mut children: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("child"))
            .filter_map(|term| self.config.item_id(&term.value))
            .collect();
        // the closure is reflexive even when the endpoint omits the root
        if !children.iter().any(|c| c == class) {
            children.push(class.to_string());
        }
        debug!(class, count = children.len(), "materialized subclass closure");
        self.cache.sadd_with_ttl(&key, &children, CHILDREN_TTL).await
    }
}

pub struct TypeMatcherSession<'a> {
    matcher: &'a TypeMatcher,
    memo: Mutex<HashMap<(String, String), bool>>,
}

impl<'a> TypeMatcherSession<'a> {
    pub async fn is_subclass(&self, class: &str, ancestor: &str) -> Result<bool> {
        let pair = (class.to_string(), ancestor.to_string());
        if let Some(answer) = self.memo.lock().get(&pair) {
            return Ok(*answer);
        }
        let answer = self.matcher.is_subclass_uncached(class, ancestor).await?;
        self.memo.lock().insert(pair, answer);
        Ok(answer)
    }
}
