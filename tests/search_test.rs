mod helpers;

use helpers::test_service;
use thinkdrop_memory::memory::service::{
    RequestContext, SearchPayload, StorePayload, UpdatePayload,
};

fn ctx() -> RequestContext {
    RequestContext {
        user_id: Some("u1".into()),
        ..Default::default()
    }
}

fn store_payload(text: &str) -> StorePayload {
    StorePayload {
        text: text.to_string(),
        record_type: None,
        user_id: None,
        entities: Vec::new(),
        metadata: None,
        screenshot: None,
        extracted_text: None,
    }
}

fn search_payload(query: &str) -> SearchPayload {
    SearchPayload {
        query: query.to_string(),
        limit: None,
        record_type: None,
        session_id: None,
        max_age_days: None,
        min_similarity: None,
    }
}

#[tokio::test]
async fn semantic_search_recovers_near_paraphrase() {
    let service = test_service();
    let stored = service
        .store(
            store_payload("I have an appointment with Dr. Johnson next Tuesday"),
            &ctx(),
        )
        .await
        .unwrap();

    let mut payload = search_payload("doctor appointment");
    payload.min_similarity = Some(0.3);
    let results = service.search(payload, &ctx()).await.unwrap();

    assert!(!results.results.is_empty(), "expected at least one result");
    let hit = results
        .results
        .iter()
        .find(|h| h.record.id == stored.memory_id)
        .expect("stored memory should match the paraphrase");
    assert!(hit.similarity >= 0.30, "similarity {}", hit.similarity);
}

#[tokio::test]
async fn results_are_sorted_by_descending_similarity() {
    let service = test_service();
    for text in [
        "grocery list for the weekend shopping trip",
        "weekend shopping trip with the kids",
        "quarterly earnings report for the board",
    ] {
        service.store(store_payload(text), &ctx()).await.unwrap();
    }

    let mut payload = search_payload("weekend shopping");
    payload.min_similarity = Some(0.0);
    let results = service.search(payload, &ctx()).await.unwrap();
    for pair in results.results.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
}

#[tokio::test]
async fn min_similarity_floor_is_enforced() {
    let service = test_service();
    service
        .store(store_payload("completely unrelated cooking recipe"), &ctx())
        .await
        .unwrap();

    let mut payload = search_payload("kubernetes cluster networking");
    payload.min_similarity = Some(0.9);
    let results = service.search(payload, &ctx()).await.unwrap();
    for hit in &results.results {
        assert!(hit.similarity >= 0.9);
    }
}

#[tokio::test]
async fn search_respects_type_filter() {
    let service = test_service();
    let mut tagged = store_payload("browsing the documentation site");
    tagged.record_type = Some("screen_capture".into());
    service.store(tagged, &ctx()).await.unwrap();
    service
        .store(store_payload("browsing the documentation site"), &ctx())
        .await
        .unwrap();

    let mut payload = search_payload("documentation site");
    payload.record_type = Some("screen_capture".into());
    payload.min_similarity = Some(0.0);
    let results = service.search(payload, &ctx()).await.unwrap();
    assert!(!results.results.is_empty());
    for hit in &results.results {
        assert_eq!(hit.record.record_type.as_str(), "screen_capture");
    }
}

#[tokio::test]
async fn search_includes_entities() {
    let service = test_service();
    let mut payload = store_payload("Lunch with Maria at the harbor");
    payload.entities = vec![thinkdrop_memory::memory::types::EntityInput {
        kind: Some("person".into()),
        value: Some("Maria".into()),
    }];
    service.store(payload, &ctx()).await.unwrap();

    let mut search = search_payload("lunch with maria");
    search.min_similarity = Some(0.0);
    let results = service.search(search, &ctx()).await.unwrap();
    assert!(!results.results.is_empty());
    assert_eq!(results.results[0].entities.len(), 1);
    assert_eq!(results.results[0].entities[0].entity, "Maria");
}

#[tokio::test]
async fn search_rejects_empty_query() {
    let service = test_service();
    let err = service.search(search_payload("  "), &ctx()).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_REQUEST");
}

#[tokio::test]
async fn updated_record_wins_over_control_for_new_text() {
    let service = test_service();
    let meeting = service
        .store(store_payload("Meeting on Tuesday"), &ctx())
        .await
        .unwrap();
    let control = service
        .store(store_payload("Coffee on Friday"), &ctx())
        .await
        .unwrap();

    service
        .update(
            UpdatePayload {
                memory_id: meeting.memory_id.clone(),
                text: Some("Meeting on Wednesday".into()),
                record_type: None,
                metadata: None,
                screenshot: None,
                extracted_text: None,
                entities: None,
            },
            &ctx(),
        )
        .await
        .unwrap();

    let mut payload = search_payload("Wednesday meeting");
    payload.min_similarity = Some(0.0);
    let results = service.search(payload, &ctx()).await.unwrap();

    let updated_score = results
        .results
        .iter()
        .find(|h| h.record.id == meeting.memory_id)
        .map(|h| h.similarity)
        .expect("updated record should match");
    let control_score = results
        .results
        .iter()
        .find(|h| h.record.id == control.memory_id)
        .map(|h| h.similarity)
        .unwrap_or(-1.0);
    assert!(
        updated_score > control_score,
        "updated {updated_score} vs control {control_score}"
    );
}

#[tokio::test]
async fn session_filter_matches_metadata_substring() {
    let service = test_service();
    let mut in_session = store_payload("notes from the planning call");
    in_session.metadata = Some(serde_json::json!({"sessionId": "sess-alpha"}));
    let stored = service.store(in_session, &ctx()).await.unwrap();
    service
        .store(store_payload("notes from the planning call"), &ctx())
        .await
        .unwrap();

    let mut payload = search_payload("planning call notes");
    payload.session_id = Some("sess-alpha".into());
    payload.min_similarity = Some(0.0);
    let results = service.search(payload, &ctx()).await.unwrap();
    assert_eq!(results.results.len(), 1);
    assert_eq!(results.results[0].record.id, stored.memory_id);
}
