//! HTTP adapter: routes, argument merging, JSONP and the error shape.
//!
//! Every endpoint exists twice, with and without a leading `/{lang}`
//! segment that overrides the language. Arguments come from the query
//! string and (for form posts) the body, merged with the form winning.
//! A `callback` argument wraps any JSON body in a JSONP call. Errors are
//! reported as HTTP 403 with `{status, message, details, arguments}`.

use crate::error::{Result, ServiceError};
use crate::model::{ExtendPayload, MonitoringResponse, ReconQuery};
use crate::state::AppState;
use axum::Router;
use axum::body::Body;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use axum::routing::get;
use serde_json::{Value as Json, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const BODY_LIMIT: usize = 1024 * 1024;

/// Merged query-string and form arguments of a request.
pub struct ApiArgs(pub HashMap<String, String>);

impl ApiArgs {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn lang<'a>(&'a self, path_lang: Option<&'a str>) -> &'a str {
        path_lang.or_else(|| self.get("lang")).unwrap_or("en")
    }
}

impl<S: Send + Sync> FromRequest<S> for ApiArgs {
    type Rejection = StatusCode;

    async fn from_request(req: Request, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let mut args: HashMap<String, String> = url::form_urlencoded::parse(
            req.uri().query().unwrap_or_default().as_bytes(),
        )
        .into_owned()
        .collect();

        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            let bytes = axum::body::to_bytes(req.into_body(), BODY_LIMIT)
                .await
                .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;
            args.extend(url::form_urlencoded::parse(&bytes).into_owned());
        }
        Ok(ApiArgs(args))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api", get(api_default).post(api_default))
        .route("/{lang}/api", get(api_lang).post(api_lang))
        .route("/suggest/{kind}", get(suggest_default).post(suggest_default))
        .route("/{lang}/suggest/{kind}", get(suggest_lang).post(suggest_lang))
        .route("/flyout/{kind}", get(flyout_default).post(flyout_default))
        .route("/{lang}/flyout/{kind}", get(flyout_lang).post(flyout_lang))
        .route("/preview", get(preview_default).post(preview_default))
        .route("/{lang}/preview", get(preview_lang).post(preview_lang))
        .route("/fetch_values", get(fetch_values_default).post(fetch_values_default))
        .route("/{lang}/fetch_values", get(fetch_values_lang).post(fetch_values_lang))
        .route(
            "/fetch_property_by_batch",
            get(fetch_property_default).post(fetch_property_default),
        )
        .route(
            "/{lang}/fetch_property_by_batch",
            get(fetch_property_lang).post(fetch_property_lang),
        )
        .route(
            "/fetch_properties_by_batch",
            get(fetch_properties_default).post(fetch_properties_default),
        )
        .route(
            "/{lang}/fetch_properties_by_batch",
            get(fetch_properties_lang).post(fetch_properties_lang),
        )
        .route(
            "/propose_properties",
            get(propose_default).post(propose_default),
        )
        .route(
            "/{lang}/propose_properties",
            get(propose_lang).post(propose_lang),
        )
        .route("/monitoring", get(monitoring_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------

fn error_message(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::BadArgument(_) | ServiceError::BadPath { .. } => "invalid query",
        ServiceError::Upstream(_) => "upstream error",
        ServiceError::Cache(_) => "cache error",
    }
}

fn envelope(args: &ApiArgs, outcome: Result<Json>) -> Response {
    let (status, body) = match outcome {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => (
            StatusCode::FORBIDDEN,
            json!({
                "status": "error",
                "message": error_message(&err),
                "details": err.to_string(),
                "arguments": &args.0,
            }),
        ),
    };
    match args.get("callback") {
        Some(callback) => {
            let wrapped = format!("{callback}({body});");
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/javascript")
                .body(Body::from(wrapped))
                .expect("jsonp response")
        }
        None => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("json response"),
    }
}

fn html_or_error(args: &ApiArgs, outcome: Result<String>) -> Response {
    match outcome {
        Ok(html) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(html))
            .expect("html response"),
        Err(err) => envelope(args, Err(err)),
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Json> {
    serde_json::to_value(value)
        .map_err(|err| ServiceError::bad_argument(format!("unserializable response: {err}")))
}

// ---------------------------------------------------------------------
// /api
// ---------------------------------------------------------------------

async fn api_default(State(state): State<Arc<AppState>>, args: ApiArgs) -> Response {
    let outcome = api_impl(&state, None, &args).await;
    envelope(&args, outcome)
}

async fn api_lang(
    State(state): State<Arc<AppState>>,
    Path(lang): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = api_impl(&state, Some(&lang), &args).await;
    envelope(&args, outcome)
}

async fn api_impl(state: &AppState, path_lang: Option<&str>, args: &ApiArgs) -> Result<Json> {
    let lang = args.lang(path_lang);
    let started = Instant::now();

    if let Some(raw_query) = args.get("query") {
        // a bare string is accepted as shorthand for {"query": ...}
        let query: ReconQuery = match serde_json::from_str(raw_query) {
            Ok(query) => query,
            Err(_) => ReconQuery {
                query: Some(raw_query.to_string()),
                ..ReconQuery::default()
            },
        };
        let result = state.engine.process_single_query(query, lang).await?;
        state
            .monitoring
            .log_request(1, started.elapsed().as_secs_f64())
            .await?;
        return to_json(result);
    }

    if let Some(raw_queries) = args.get("queries") {
        let queries: HashMap<String, ReconQuery> = serde_json::from_str(raw_queries)
            .map_err(|err| ServiceError::bad_argument(format!("invalid 'queries': {err}")))?;
        let count = queries.len() as u64;
        let results = state.engine.process_queries(queries, lang).await?;
        state
            .monitoring
            .log_request(count, started.elapsed().as_secs_f64())
            .await?;
        return to_json(results);
    }

    if let Some(raw_extend) = args.get("extend") {
        let payload: ExtendPayload = serde_json::from_str(raw_extend)
            .map_err(|err| ServiceError::bad_argument(format!("invalid 'extend': {err}")))?;
        let response = state.engine.fetch_properties_by_batch(lang, &payload).await?;
        return to_json(response);
    }

    manifest(state, lang).await
}

/// The service manifest, mirroring the reconciliation-API shape.
async fn manifest(state: &AppState, lang: &str) -> Result<Json> {
    let config = &state.config;
    let host = &config.this_host;

    let default_types = match &config.default_type_entity {
        Some(id) => {
            let session = state.engine.store().session();
            let name = session.get_label(id, lang).await.unwrap_or_else(|_| id.clone());
            json!([{ "id": id, "name": name }])
        }
        None => json!([]),
    };

    Ok(json!({
        "name": format!("{} ({})", config.service_name, lang),
        "identifierSpace": config.identifier_space,
        "schemaSpace": config.schema_space,
        "view": { "url": config.entity_url_pattern },
        "suggest": {
            "type": {
                "service_url": host,
                "service_path": format!("/{lang}/suggest/type"),
                "flyout_service_path": format!("/{lang}/flyout/type?id=${{id}}"),
            },
            "property": {
                "service_url": host,
                "service_path": format!("/{lang}/suggest/property"),
                "flyout_service_path": format!("/{lang}/flyout/property?id=${{id}}"),
            },
            "entity": {
                "service_url": host,
                "service_path": format!("/{lang}/suggest/entity"),
                "flyout_service_path": format!("/{lang}/flyout/entity?id=${{id}}"),
            },
        },
        "preview": {
            "url": format!("{host}/{lang}/preview?id={{{{id}}}}"),
            "width": config.preview_width,
            "height": config.preview_height,
        },
        "defaultTypes": default_types,
        "extend": {
            "propose_properties": {
                "service_url": host,
                "service_path": format!("/{lang}/propose_properties"),
            },
            "property_settings": [
                {
                    "name": "limit",
                    "label": "Limit",
                    "help_text": "Maximum number of values to return per row (0 for no limit)",
                    "type": "number",
                    "default": 0,
                },
                {
                    "name": "rank",
                    "label": "Ranks",
                    "help_text": "Filter statements by rank",
                    "type": "select",
                    "default": "best",
                    "choices": [
                        { "value": "any", "name": "Any rank" },
                        { "value": "best", "name": "Only the best rank" },
                        { "value": "no_deprecated", "name": "Preferred and normal ranks" },
                    ],
                },
                {
                    "name": "references",
                    "label": "References",
                    "help_text": "Filter statements by their references",
                    "type": "select",
                    "default": "any",
                    "choices": [
                        { "value": "any", "name": "Any statement" },
                        { "value": "referenced", "name": "At least one reference" },
                        { "value": "no_wiki", "name": "At least one non-wiki reference" },
                    ],
                },
                {
                    "name": "count",
                    "label": "Return counts instead of values",
                    "help_text": "The number of values will be returned.",
                    "type": "checkbox",
                    "default": false,
                },
            ],
        },
    }))
}

// ---------------------------------------------------------------------
// suggest / flyout / preview
// ---------------------------------------------------------------------

async fn suggest_default(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = suggest_impl(&state, &kind, None, &args).await;
    envelope(&args, outcome)
}

async fn suggest_lang(
    State(state): State<Arc<AppState>>,
    Path((lang, kind)): Path<(String, String)>,
    args: ApiArgs,
) -> Response {
    let outcome = suggest_impl(&state, &kind, Some(&lang), &args).await;
    envelope(&args, outcome)
}

async fn suggest_impl(
    state: &AppState,
    kind: &str,
    path_lang: Option<&str>,
    args: &ApiArgs,
) -> Result<Json> {
    let lang = args.lang(path_lang);
    let prefix = args.get("prefix").unwrap_or_default();
    let response = match kind {
        "type" => state.suggest.find_type(prefix, lang).await?,
        "property" => state.suggest.find_property(prefix, lang).await?,
        "entity" => state.suggest.find_entity(prefix, lang).await?,
        other => {
            return Err(ServiceError::bad_argument(format!(
                "unknown suggest kind '{other}'"
            )));
        }
    };
    to_json(response)
}

async fn flyout_default(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = flyout_impl(&state, &kind, None, &args).await;
    envelope(&args, outcome)
}

async fn flyout_lang(
    State(state): State<Arc<AppState>>,
    Path((lang, kind)): Path<(String, String)>,
    args: ApiArgs,
) -> Response {
    let outcome = flyout_impl(&state, &kind, Some(&lang), &args).await;
    envelope(&args, outcome)
}

async fn flyout_impl(
    state: &AppState,
    kind: &str,
    path_lang: Option<&str>,
    args: &ApiArgs,
) -> Result<Json> {
    if !matches!(kind, "type" | "property" | "entity") {
        return Err(ServiceError::bad_argument(format!(
            "unknown flyout kind '{kind}'"
        )));
    }
    let lang = args.lang(path_lang);
    let id = args.get("id").unwrap_or_default();
    to_json(state.suggest.flyout(id, lang).await?)
}

async fn preview_default(State(state): State<Arc<AppState>>, args: ApiArgs) -> Response {
    let outcome = preview_impl(&state, None, &args).await;
    html_or_error(&args, outcome)
}

async fn preview_lang(
    State(state): State<Arc<AppState>>,
    Path(lang): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = preview_impl(&state, Some(&lang), &args).await;
    html_or_error(&args, outcome)
}

async fn preview_impl(
    state: &AppState,
    path_lang: Option<&str>,
    args: &ApiArgs,
) -> Result<String> {
    let lang = args.lang(path_lang);
    let id = args
        .get("id")
        .ok_or_else(|| ServiceError::bad_argument("no 'id' provided"))?;
    state.suggest.preview(id, lang).await
}

// ---------------------------------------------------------------------
// data extension
// ---------------------------------------------------------------------

async fn fetch_values_default(State(state): State<Arc<AppState>>, args: ApiArgs) -> Response {
    let outcome = fetch_values_impl(&state, None, &args).await;
    envelope(&args, outcome)
}

async fn fetch_values_lang(
    State(state): State<Arc<AppState>>,
    Path(lang): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = fetch_values_impl(&state, Some(&lang), &args).await;
    envelope(&args, outcome)
}

async fn fetch_values_impl(
    state: &AppState,
    path_lang: Option<&str>,
    args: &ApiArgs,
) -> Result<Json> {
    let mut merged = args.0.clone();
    merged.insert("lang".to_string(), args.lang(path_lang).to_string());
    state.engine.fetch_values(&merged).await
}

async fn fetch_property_default(State(state): State<Arc<AppState>>, args: ApiArgs) -> Response {
    let outcome = fetch_property_impl(&state, None, &args).await;
    envelope(&args, outcome)
}

async fn fetch_property_lang(
    State(state): State<Arc<AppState>>,
    Path(lang): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = fetch_property_impl(&state, Some(&lang), &args).await;
    envelope(&args, outcome)
}

async fn fetch_property_impl(
    state: &AppState,
    path_lang: Option<&str>,
    args: &ApiArgs,
) -> Result<Json> {
    let mut merged = args.0.clone();
    merged.insert("lang".to_string(), args.lang(path_lang).to_string());
    state.engine.fetch_property_by_batch(&merged).await
}

async fn fetch_properties_default(State(state): State<Arc<AppState>>, args: ApiArgs) -> Response {
    let outcome = fetch_properties_impl(&state, None, &args).await;
    envelope(&args, outcome)
}

async fn fetch_properties_lang(
    State(state): State<Arc<AppState>>,
    Path(lang): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = fetch_properties_impl(&state, Some(&lang), &args).await;
    envelope(&args, outcome)
}

async fn fetch_properties_impl(
    state: &AppState,
    path_lang: Option<&str>,
    args: &ApiArgs,
) -> Result<Json> {
    let lang = args.lang(path_lang);
    let raw = args.get("extend").unwrap_or("{}");
    let payload: ExtendPayload = serde_json::from_str(raw)
        .map_err(|err| ServiceError::bad_argument(format!("invalid 'extend': {err}")))?;
    to_json(state.engine.fetch_properties_by_batch(lang, &payload).await?)
}

// ---------------------------------------------------------------------
// propose_properties / monitoring
// ---------------------------------------------------------------------

async fn propose_default(State(state): State<Arc<AppState>>, args: ApiArgs) -> Response {
    let outcome = propose_impl(&state, None, &args).await;
    envelope(&args, outcome)
}

async fn propose_lang(
    State(state): State<Arc<AppState>>,
    Path(lang): Path<String>,
    args: ApiArgs,
) -> Response {
    let outcome = propose_impl(&state, Some(&lang), &args).await;
    envelope(&args, outcome)
}

async fn propose_impl(
    state: &AppState,
    path_lang: Option<&str>,
    args: &ApiArgs,
) -> Result<Json> {
    let lang = args.lang(path_lang);
    let limit = args.get("limit").and_then(|l| l.parse().ok());
    let response = state
        .suggest
        .propose_properties(args.get("type"), limit, lang)
        .await?;
    to_json(response)
}

async fn monitoring_handler(State(state): State<Arc<AppState>>) -> Response {
    let args = ApiArgs(HashMap::new());
    let outcome = match state.monitoring.get_rates().await {
        Ok(stats) => to_json(MonitoringResponse { stats }),
        Err(err) => Err(err),
    };
    envelope(&args, outcome)
}
