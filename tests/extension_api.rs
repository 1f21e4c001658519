//! Data-extension scenarios: multi-path projection, settings, subfields.

mod support;

use serde_json::json;
use support::{Fixtures, entity, test_state};
use wikibase_reconcile::model::ExtendPayload;
use wikibase_reconcile::value::Cell;
use wiremock::MockServer;

fn universities() -> Fixtures {
    Fixtures::default()
        .with_entity(
            entity("Q34433", "University of Oxford")
                .string_claim("P2427", "external-id", "grid.4991.5")
                .item_claim("P17", "Q145")
                .time_claim("P571", "+1096-01-01T00:00:00Z", 9)
                .build(),
        )
        .with_entity(
            entity("Q83259", "École normale supérieure")
                .string_claim("P2427", "external-id", "grid.5607.4")
                .item_claim("P17", "Q142")
                .build(),
        )
        .with_entity(
            entity("Q145", "United Kingdom")
                .string_claim("P297", "external-id", "GB")
                .build(),
        )
        .with_entity(
            entity("Q142", "France")
                .string_claim("P297", "external-id", "FR")
                .build(),
        )
        .with_entity(entity("P2427", "GRID ID").build())
        .with_entity(entity("P17", "country").build())
}

#[tokio::test]
async fn rows_project_paths_over_items() {
    let server = MockServer::start().await;
    let state = test_state(&server, universities()).await;

    let payload: ExtendPayload = serde_json::from_value(json!({
        "ids": ["Q34433", "Q83259"],
        "properties": [{ "id": "P2427" }, { "id": "P17/P297" }],
    }))
    .unwrap();
    let response = state
        .engine
        .fetch_properties_by_batch("en", &payload)
        .await
        .unwrap();

    assert_eq!(
        response.rows["Q34433"]["P2427"],
        vec![Cell::Str { str: "grid.4991.5".into() }]
    );
    assert_eq!(
        response.rows["Q34433"]["P17/P297"],
        vec![Cell::Str { str: "GB".into() }]
    );
    assert_eq!(
        response.rows["Q83259"]["P2427"],
        vec![Cell::Str { str: "grid.5607.4".into() }]
    );
    assert_eq!(
        response.rows["Q83259"]["P17/P297"],
        vec![Cell::Str { str: "FR".into() }]
    );

    // meta: simple properties get their label, composites their rendering
    assert_eq!(response.meta[0].id, "P2427");
    assert_eq!(response.meta[0].name, "GRID ID");
    assert_eq!(response.meta[1].name, "P17/P297");
}

#[tokio::test]
async fn count_setting_replaces_values() {
    let server = MockServer::start().await;
    let fixtures = Fixtures::default().with_entity(
        entity("Q2831", "Michael Jackson")
            .item_claim("P40", "Q13053")
            .item_claim("P40", "Q13054")
            .item_claim("P40", "Q13055")
            .build(),
    );
    let state = test_state(&server, fixtures).await;

    let payload: ExtendPayload = serde_json::from_value(json!({
        "ids": ["Q2831"],
        "properties": [{ "id": "P40", "settings": { "count": "on" } }],
    }))
    .unwrap();
    let response = state
        .engine
        .fetch_properties_by_batch("en", &payload)
        .await
        .unwrap();
    assert_eq!(
        response.rows["Q2831"]["P40"],
        vec![Cell::Float { float: 3.0 }]
    );
    // settings echoed back
    assert_eq!(
        response.meta[0].settings,
        Some(json!({ "count": "on" }))
    );
}

#[tokio::test]
async fn limit_setting_truncates_values() {
    let server = MockServer::start().await;
    let fixtures = Fixtures::default().with_entity(
        entity("Q2831", "Michael Jackson")
            .item_claim("P40", "Q13053")
            .item_claim("P40", "Q13054")
            .item_claim("P40", "Q13055")
            .build(),
    );
    let state = test_state(&server, fixtures).await;

    let payload: ExtendPayload = serde_json::from_value(json!({
        "ids": ["Q2831"],
        "properties": [{ "id": "P40", "settings": { "limit": 2 } }],
    }))
    .unwrap();
    let response = state
        .engine
        .fetch_properties_by_batch("en", &payload)
        .await
        .unwrap();
    assert_eq!(response.rows["Q2831"]["P40"].len(), 2);
}

#[tokio::test]
async fn subfields_extract_derived_values() {
    let server = MockServer::start().await;
    let fixtures = universities().with_entity(
        entity("Q23011", "Greenwich")
            .coords_claim("P625", 51.47, 0.0)
            .build(),
    );
    let state = test_state(&server, fixtures).await;

    let payload: ExtendPayload = serde_json::from_value(json!({
        "ids": ["Q34433"],
        "properties": [{ "id": "P571@year" }],
    }))
    .unwrap();
    let response = state
        .engine
        .fetch_properties_by_batch("en", &payload)
        .await
        .unwrap();
    assert_eq!(
        response.rows["Q34433"]["P571@year"],
        vec![Cell::Float { float: 1096.0 }]
    );

    let payload: ExtendPayload = serde_json::from_value(json!({
        "ids": ["Q23011"],
        "properties": [{ "id": "P625@lng" }],
    }))
    .unwrap();
    let response = state
        .engine
        .fetch_properties_by_batch("en", &payload)
        .await
        .unwrap();
    assert_eq!(
        response.rows["Q23011"]["P625@lng"],
        vec![Cell::Float { float: 0.0 }]
    );
}

#[tokio::test]
async fn item_values_render_as_entity_cells() {
    let server = MockServer::start().await;
    let state = test_state(&server, universities()).await;

    let payload: ExtendPayload = serde_json::from_value(json!({
        "ids": ["Q34433"],
        "properties": [{ "id": "P17" }],
    }))
    .unwrap();
    let response = state
        .engine
        .fetch_properties_by_batch("en", &payload)
        .await
        .unwrap();
    assert_eq!(
        response.rows["Q34433"]["P17"],
        vec![Cell::Entity {
            id: "Q145".into(),
            name: "United Kingdom".into()
        }]
    );
}

#[tokio::test]
async fn fetch_values_flat_returns_a_bare_scalar() {
    let server = MockServer::start().await;
    let fixtures = Fixtures::default().with_entity(
        entity("Q881333", "William Herschel Telescope")
            .string_claim("P213", "external-id", "0000 0004 0547 722X")
            .build(),
    );
    let state = test_state(&server, fixtures).await;

    let mut args = std::collections::HashMap::new();
    args.insert("item".to_string(), "Q881333".to_string());
    args.insert("prop".to_string(), "P213".to_string());
    args.insert("lang".to_string(), "de".to_string());
    args.insert("flat".to_string(), "true".to_string());
    let value = state.engine.fetch_values(&args).await.unwrap();
    assert_eq!(value, json!("0000 0004 0547 722X"));
}

#[tokio::test]
async fn fetch_values_without_flat_wraps_the_values() {
    let server = MockServer::start().await;
    let fixtures = Fixtures::default().with_entity(
        entity("Q881333", "ISNI holder")
            .string_claim("P213", "external-id", "0000 0004 0547 722X")
            .build(),
    );
    let state = test_state(&server, fixtures).await;

    let mut args = std::collections::HashMap::new();
    args.insert("item".to_string(), "Q881333".to_string());
    args.insert("prop".to_string(), "P213".to_string());
    args.insert("lang".to_string(), "en".to_string());
    let value = state.engine.fetch_values(&args).await.unwrap();
    assert_eq!(
        value,
        json!({
            "item": "Q881333",
            "prop": "P213",
            "values": ["0000 0004 0547 722X"],
        })
    );
}

#[tokio::test]
async fn missing_lang_is_rejected() {
    let server = MockServer::start().await;
    let state = test_state(&server, Fixtures::default()).await;

    let mut args = std::collections::HashMap::new();
    args.insert("item".to_string(), "Q881333".to_string());
    args.insert("prop".to_string(), "P213".to_string());
    let err = state.engine.fetch_values(&args).await.unwrap_err();
    assert_eq!(err.kind(), "bad-argument");
}

#[tokio::test]
async fn invalid_ids_are_rejected() {
    let server = MockServer::start().await;
    let state = test_state(&server, Fixtures::default()).await;

    let payload: ExtendPayload = serde_json::from_value(json!({
        "ids": ["not-an-id"],
        "properties": [{ "id": "P17" }],
    }))
    .unwrap();
    let err = state
        .engine
        .fetch_properties_by_batch("en", &payload)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "bad-argument");
}
