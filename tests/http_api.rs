//! Router-level tests: manifest, JSONP envelope, error shape, suggest,
//! preview and monitoring, driven through tower's oneshot.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value as Json, json};
use support::{Fixtures, entity, test_state};
use tower::ServiceExt;
use wikibase_reconcile::server::router;
use wiremock::MockServer;

async fn call(app: axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec(), content_type)
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Json) {
    let (status, body, content_type) =
        call(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert!(
        content_type.starts_with("application/json"),
        "unexpected content type {content_type}"
    );
    (status, serde_json::from_slice(&body).unwrap())
}

fn fixtures() -> Fixtures {
    Fixtures::default()
        .with_children("Q17442446", &["Q17442446"])
        .with_unique_properties(&["P214"])
        .with_entity(
            entity("Q35120", "entity")
                .description("en", "anything that can be considered")
                .build(),
        )
        .with_entity(
            entity("Q34433", "University of Oxford")
                .description("en", "university in Oxford, England")
                .alias("en", "Oxford")
                .build(),
        )
        .with_search("Oxford", &["Q34433"])
        .with_autocomplete("item", "Oxford", &["Q34433"])
}

#[tokio::test]
async fn manifest_mirrors_the_service_shape() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, manifest) = get_json(router(state), "/api").await;
    assert_eq!(status, StatusCode::OK);
    assert!(manifest["name"].as_str().unwrap().contains("(en)"));
    assert_eq!(
        manifest["identifierSpace"],
        json!("http://www.wikidata.org/entity/")
    );
    assert_eq!(
        manifest["view"]["url"],
        json!("https://www.wikidata.org/wiki/{{id}}")
    );
    assert_eq!(
        manifest["defaultTypes"],
        json!([{ "id": "Q35120", "name": "entity" }])
    );
    assert_eq!(
        manifest["suggest"]["property"]["service_path"],
        json!("/en/suggest/property")
    );
    let settings = manifest["extend"]["property_settings"].as_array().unwrap();
    let names: Vec<&str> = settings
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["limit", "rank", "references", "count"]);
    assert_eq!(settings[1]["default"], json!("best"));
    assert_eq!(settings[2]["default"], json!("any"));
}

#[tokio::test]
async fn language_prefix_overrides_the_default() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (_, manifest) = get_json(router(state), "/fr/api").await;
    assert!(manifest["name"].as_str().unwrap().contains("(fr)"));
    assert_eq!(
        manifest["preview"]["url"],
        json!("http://localhost:8000/fr/preview?id={{id}}")
    );
}

#[tokio::test]
async fn single_query_reconciliation_over_http() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body) = get_json(
        router(state),
        "/api?query=%7B%22query%22%3A%20%22Oxford%22%7D",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["result"].as_array().unwrap();
    assert_eq!(results[0]["id"], json!("Q34433"));
    assert!(results[0]["score"].as_f64().unwrap() > 90.0);
}

#[tokio::test]
async fn queries_accept_form_posts() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let form = "queries=%7B%22q0%22%3A%20%7B%22query%22%3A%20%22Oxford%22%7D%7D";
    let request = Request::post("/api")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form))
        .unwrap();
    let (status, body, _) = call(router(state), request).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: Json = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["q0"]["result"][0]["id"], json!("Q34433"));
}

#[tokio::test]
async fn callback_wraps_the_body_in_jsonp() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body, content_type) = call(
        router(state),
        Request::get("/api?callback=jsonp123")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "application/javascript");
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("jsonp123("));
    assert!(text.ends_with(");"));
}

#[tokio::test]
async fn errors_carry_the_documented_shape() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body) = get_json(router(state), "/api?queries=not-json").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], json!("error"));
    assert_eq!(body["message"], json!("invalid query"));
    assert!(body["details"].as_str().is_some());
    assert_eq!(body["arguments"]["queries"], json!("not-json"));
}

#[tokio::test]
async fn bare_query_strings_are_accepted() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body) = get_json(router(state), "/api?query=Oxford").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"][0]["id"], json!("Q34433"));
}

#[tokio::test]
async fn suggest_property_offers_paths_first() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body) = get_json(
        router(state),
        "/en/suggest/property?prefix=P17%2FP297",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first = &body["result"][0];
    assert_eq!(first["id"], json!("P17/P297"));
    assert_eq!(first["name"], json!("SPARQL: P17/P297"));
}

#[tokio::test]
async fn suggest_entities_list_upstream_hits() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body) = get_json(router(state), "/en/suggest/entity?prefix=Oxford").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"][0]["id"], json!("Q34433"));
}

#[tokio::test]
async fn flyout_renders_a_description_paragraph() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body) = get_json(router(state), "/en/flyout/entity?id=Q34433").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!("Q34433"));
    let html = body["html"].as_str().unwrap();
    assert!(html.contains("university in Oxford, England"));
}

#[tokio::test]
async fn preview_returns_an_html_card() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body, content_type) = call(
        router(state),
        Request::get("/en/preview?id=Q34433")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/html"));
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("University of Oxford"));
    assert!(html.contains("https://www.wikidata.org/wiki/Q34433"));
    assert!(html.contains("width: 400px"));
}

#[tokio::test]
async fn fetch_values_over_http() {
    let server = MockServer::start().await;
    let fixtures = fixtures().with_entity(
        entity("Q881333", "William Herschel Telescope")
            .string_claim("P213", "external-id", "0000 0004 0547 722X")
            .build(),
    );
    let state = test_state(&server, fixtures).await;

    let (status, body) = get_json(
        router(state),
        "/de/fetch_values?item=Q881333&prop=P213&flat=true",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!("0000 0004 0547 722X"));
}

#[tokio::test]
async fn propose_properties_falls_back_to_qid() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;

    let (status, body) = get_json(
        router(state),
        "/en/propose_properties?type=Q3918&limit=10",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], json!("Q3918"));
    assert_eq!(
        body["properties"],
        json!([{ "id": "qid", "name": "Qid" }])
    );
}

#[tokio::test]
async fn monitoring_reports_three_buckets() {
    let server = MockServer::start().await;
    let state = test_state(&server, fixtures()).await;
    let app = router(state.clone());

    // one query first, so the counters move
    let _ = get_json(app.clone(), "/api?query=Oxford").await;

    let (status, body) = get_json(app, "/monitoring").await;
    assert_eq!(status, StatusCode::OK);
    let stats = body["stats"].as_array().unwrap();
    assert_eq!(stats.len(), 3);
    let targets: Vec<u64> = stats
        .iter()
        .map(|s| s["measure_duration_target"].as_u64().unwrap())
        .collect();
    assert_eq!(targets, vec![60, 3600, 86400]);
    assert!(stats[0]["query_rate"].as_f64().unwrap() >= 0.0);
}
