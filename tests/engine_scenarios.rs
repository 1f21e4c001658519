//! End-to-end reconciliation scenarios against a mock Wikibase.

mod support;

use serde_json::json;
use support::{Fixtures, entity, test_state};
use wikibase_reconcile::model::{PropertyConstraint, ReconQuery};
use wiremock::MockServer;

fn query(text: &str) -> ReconQuery {
    ReconQuery {
        query: Some(text.to_string()),
        ..ReconQuery::default()
    }
}

fn constraint(pid: &str, v: &str) -> PropertyConstraint {
    serde_json::from_value(json!({ "pid": pid, "v": v })).unwrap()
}

/// Wikimedia-internal classes filtered by the default configuration.
fn base_fixtures() -> Fixtures {
    Fixtures::default()
        .with_children("Q17442446", &["Q17442446", "Q4167836"])
        .with_unique_properties(&["P214", "P1566", "P213", "P2427"])
}

#[tokio::test]
async fn plain_text_query_ranks_the_best_label_first() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_search("Recumbent bicycle", &["Q750483", "Q11442"])
        .with_autocomplete("item", "Recumbent bicycle", &["Q750483"])
        .with_children("Q2095", &["Q2095"])
        .with_entity(
            entity("Q750483", "recumbent bicycle")
                .description("en", "type of bicycle")
                .item_claim("P31", "Q2095")
                .build(),
        )
        .with_entity(
            entity("Q11442", "bicycle")
                .item_claim("P31", "Q2095")
                .build(),
        )
        .with_entity(entity("Q2095", "vehicle").build());
    let state = test_state(&server, fixtures).await;

    let result = state
        .engine
        .process_single_query(query("Recumbent bicycle"), "en")
        .await
        .unwrap();

    assert!(!result.result.is_empty());
    assert_eq!(result.result[0].id, "Q750483");
    assert_eq!(result.result[0].score, 100.0);
    assert_eq!(result.result[0].name, "recumbent bicycle");
    // well ahead of the runner-up, so the match flag fires
    assert!(result.result[0].match_flag);
    assert!(!result.result.iter().skip(1).any(|c| c.match_flag));
    // the label constraint is reported as a feature
    assert_eq!(result.result[0].features.last().unwrap().id, "all_labels");
}

#[tokio::test]
async fn type_constraint_gates_candidates() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_search("Oxford", &["Q34433", "Q34217"])
        .with_children("Q3918", &["Q3918"])
        .with_children("Q3957", &["Q3957"])
        .with_entity(
            entity("Q34433", "University of Oxford")
                .alias("en", "Oxford")
                .item_claim("P31", "Q3918")
                .build(),
        )
        .with_entity(
            entity("Q34217", "Oxford")
                .item_claim("P31", "Q3957")
                .build(),
        )
        .with_entity(entity("Q3918", "university").build())
        .with_entity(entity("Q3957", "town").build());
    let state = test_state(&server, fixtures).await;

    let mut as_university = query("Oxford");
    as_university.entity_type = Some(serde_json::from_value(json!("Q3918")).unwrap());
    let result = state
        .engine
        .process_single_query(as_university, "en")
        .await
        .unwrap();
    assert_eq!(result.result[0].id, "Q34433");
    assert_eq!(
        result.result[0].entity_type,
        vec![wikibase_reconcile::model::TypeRef {
            id: "Q3918".to_string(),
            name: "university".to_string()
        }]
    );
    assert!(!result.result.iter().any(|c| c.id == "Q34217"));

    let mut as_town = query("Oxford");
    as_town.entity_type = Some(serde_json::from_value(json!(["Q3957"])).unwrap());
    let result = state.engine.process_single_query(as_town, "en").await.unwrap();
    assert!(!result.result.is_empty());
    assert_ne!(result.result[0].id, "Q34433");
    assert_eq!(result.result[0].id, "Q34217");
}

#[tokio::test]
async fn unique_identifier_constraint_skips_text_search() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_value_lookup("wdt:P214", "142129514", &[("Q34433", "University of Oxford")])
        .with_children("Q3918", &["Q3918"])
        .with_entity(
            entity("Q34433", "University of Oxford")
                .item_claim("P31", "Q3918")
                .string_claim("P214", "external-id", "142129514")
                .build(),
        )
        .with_entity(entity("Q3918", "university").build());
    // deliberately no search fixtures: the text must never be used
    let state = test_state(&server, fixtures).await;

    let mut q = query("this string is ignored");
    q.properties = vec![constraint("P214", "142129514")];
    let result = state.engine.process_single_query(q, "en").await.unwrap();

    assert_eq!(result.result.len(), 1);
    assert_eq!(result.result[0].id, "Q34433");
    assert_eq!(result.result[0].score, 100.0);
    assert!(result.result[0].match_flag);
}

#[tokio::test]
async fn missed_identifier_falls_back_to_scored_search() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_search("Warsaw", &["Q270"])
        .with_autocomplete("item", "Warsaw", &["Q270"])
        .with_children("Q515", &["Q515"])
        .with_entity(
            entity("Q270", "Warsaw")
                .item_claim("P31", "Q515")
                .item_claim("P17", "Q36")
                .string_claim("P1566", "external-id", "756135")
                .build(),
        )
        .with_entity(
            entity("Q36", "Poland")
                .string_claim("P297", "external-id", "PL")
                .build(),
        )
        .with_entity(entity("Q515", "city").build());
    let state = test_state(&server, fixtures).await;

    let mut q = query("Warsaw");
    q.properties = vec![
        constraint("P1566", "fictuous id"),
        constraint("P17/P297", "PL"),
    ];
    let result = state.engine.process_single_query(q, "en").await.unwrap();

    assert_eq!(result.result[0].id, "Q270");
    // the label and the country-code path both hit 100; the missed
    // identifier contributes neither score nor weight, so the aggregate
    // lands on 100
    assert!((result.result[0].score - 100.0).abs() < 1e-9);
    let features = &result.result[0].features;
    assert_eq!(features.len(), 3);
    assert_eq!(features[0].id, "P1566");
    assert_eq!(features[0].value, 0.0);
    assert_eq!(features[1].id, "P17/P297");
    assert_eq!(features[1].value, 100.0);
    assert_eq!(features[2].id, "all_labels");
}

#[tokio::test]
async fn wikimedia_internal_items_are_filtered_out() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_search("Category:Oxford", &["Q8765843"])
        .with_entity(
            entity("Q8765843", "Category:Oxford")
                .item_claim("P31", "Q4167836")
                .build(),
        )
        .with_entity(entity("Q4167836", "Wikimedia category").build());
    let state = test_state(&server, fixtures).await;

    let result = state
        .engine
        .process_single_query(query("Category:Oxford"), "en")
        .await
        .unwrap();
    assert!(result.result.is_empty());
}

#[tokio::test]
async fn query_text_matching_an_entity_id_short_circuits() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_children("Q5", &["Q5"])
        .with_entity(
            entity("Q42", "Douglas Adams")
                .item_claim("P31", "Q5")
                .build(),
        )
        .with_entity(entity("Q5", "human").build());
    let state = test_state(&server, fixtures).await;

    let result = state
        .engine
        .process_single_query(query("Q42"), "en")
        .await
        .unwrap();
    assert_eq!(result.result.len(), 1);
    assert_eq!(result.result[0].id, "Q42");
}

#[tokio::test]
async fn sitelink_queries_resolve_through_the_wiki() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_children("Q3918", &["Q3918"])
        .with_entity(
            entity("Q34433", "University of Oxford")
                .item_claim("P31", "Q3918")
                .sitelink("enwiki", "University of Oxford")
                .build(),
        )
        .with_entity(entity("Q3918", "university").build());
    let state = test_state(&server, fixtures).await;

    let result = state
        .engine
        .process_single_query(
            query("https://en.wikipedia.org/wiki/University_of_Oxford"),
            "en",
        )
        .await
        .unwrap();
    assert_eq!(result.result.len(), 1);
    assert_eq!(result.result[0].id, "Q34433");
}

#[tokio::test]
async fn missing_query_without_identifiers_is_a_bad_argument() {
    let server = MockServer::start().await;
    let state = test_state(&server, base_fixtures()).await;

    let err = state
        .engine
        .process_single_query(ReconQuery::default(), "en")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "bad-argument");
}

#[tokio::test]
async fn invalid_type_strict_is_rejected() {
    let server = MockServer::start().await;
    let fixtures = base_fixtures()
        .with_search("Oxford", &["Q34433"])
        .with_entity(entity("Q34433", "University of Oxford").build());
    let state = test_state(&server, fixtures).await;

    let mut q = query("Oxford");
    q.type_strict = Some("sometimes".to_string());
    let err = state.engine.process_single_query(q, "en").await.unwrap_err();
    assert_eq!(err.kind(), "bad-argument");
}

#[tokio::test]
async fn malformed_constraint_paths_are_bad_paths() {
    let server = MockServer::start().await;
    let state = test_state(&server, base_fixtures()).await;

    let mut q = query("Oxford");
    q.properties = vec![constraint("P17//P297", "PL")];
    let err = state.engine.process_single_query(q, "en").await.unwrap_err();
    assert_eq!(err.kind(), "bad-path");
}
