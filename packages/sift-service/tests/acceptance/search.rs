use std::{
	sync::{Arc, atomic::Ordering},
	time::Duration,
};

use time::OffsetDateTime;

use sift_config::Config;
use sift_domain::{BehaviorEvent, EventType, TimeRange};
use sift_service::{
	Candidate, Error, Providers, RankedResult, SearchRequest, SiftService, Stores, SubmitOutcome,
};
use sift_storage::EventLog;

use super::{
	FailingLlm, FailingRetrieval, ScriptedLlm, StaticRetrieval, stub_providers, test_config,
};

const TOLERANCE: f64 = 1e-12;

fn request(query: &str) -> SearchRequest {
	SearchRequest {
		query: query.to_string(),
		session_id: "s1".to_string(),
		user_id: None,
		limit: None,
	}
}

fn catalog() -> Arc<StaticRetrieval> {
	Arc::new(StaticRetrieval::new(vec![
		Candidate::new("A", 0.9).with_summary("Solid oak desk."),
		Candidate::new("B", 0.7).with_summary("Walnut writing desk."),
	]))
}

fn service(cfg: Config, providers: Providers) -> SiftService {
	SiftService::new(cfg, Stores::in_memory(), providers)
}

fn ids(results: &[RankedResult]) -> Vec<&str> {
	results.iter().map(|result| result.item_id.as_str()).collect()
}

async fn idle(service: &SiftService) {
	tokio::time::timeout(Duration::from_secs(10), service.ingestor.wait_idle())
		.await
		.expect("Ingestion must settle.");
}

#[tokio::test]
async fn search_ranks_candidates_and_records_impressions() {
	let service = service(test_config(), stub_providers(catalog()));
	let response = service.search(request(" oak desk ")).await.expect("Search must succeed.");

	assert_eq!(response.query, "oak desk");
	assert_eq!(ids(&response.results), vec!["A", "B"]);
	assert!((response.results[0].final_score - 0.36).abs() < TOLERANCE);
	assert!((response.results[1].final_score - 0.28).abs() < TOLERANCE);
	assert_eq!(response.total_candidates, 2);
	assert!(!response.personalized);
	assert_eq!(response.expanded_query, None);

	idle(&service).await;

	let events = service
		.stores
		.events
		.list(TimeRange::trailing_days(OffsetDateTime::now_utc(), 1))
		.await
		.expect("List must succeed.");
	let query_event = events
		.iter()
		.find(|event| event.item_id.is_none())
		.expect("The query event is logged.");

	assert_eq!(events.len(), 3);
	assert_eq!(query_event.event_id, response.search_id);
	assert_eq!(query_event.query_text(), Some("oak desk"));

	for item_id in ["A", "B"] {
		let record = service.item_metrics(item_id).await.expect("Read must succeed.");

		assert_eq!(record.total_searches_seen, 1);
	}
}

#[tokio::test]
async fn clicks_change_the_next_ranking() {
	let service = service(test_config(), stub_providers(catalog()));

	service.search(request("oak desk")).await.expect("Search must succeed.");

	let click = BehaviorEvent::new(EventType::Click, "s1").with_item("B").with_query("oak desk");

	assert_eq!(service.track(click).await.expect("Track must succeed."), SubmitOutcome::Queued);

	idle(&service).await;

	let response = service.search(request("oak desk")).await.expect("Search must succeed.");

	assert_eq!(ids(&response.results), vec!["B", "A"]);
	assert!((response.results[0].final_score - 0.46).abs() < TOLERANCE);
	assert!((response.results[1].final_score - 0.36).abs() < TOLERANCE);
}

#[tokio::test]
async fn retrieval_failure_fails_the_search() {
	let service = service(test_config(), stub_providers(Arc::new(FailingRetrieval)));
	let err = service.search(request("oak desk")).await.expect_err("Search must fail.");

	assert!(matches!(err, Error::Retrieval { .. }), "Unexpected error: {err:?}");
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
	let service = service(test_config(), stub_providers(catalog()));

	for req in [
		request("   "),
		SearchRequest { session_id: String::new(), ..request("oak desk") },
		SearchRequest { limit: Some(0), ..request("oak desk") },
	] {
		let err = service.search(req).await.expect_err("Search must fail.");

		assert!(matches!(err, Error::InvalidRequest { .. }), "Unexpected error: {err:?}");
	}
}

#[tokio::test]
async fn limit_truncates_but_counts_every_candidate() {
	let service = service(test_config(), stub_providers(catalog()));
	let response = service
		.search(SearchRequest { limit: Some(1), ..request("oak desk") })
		.await
		.expect("Search must succeed.");

	assert_eq!(ids(&response.results), vec!["A"]);
	assert_eq!(response.total_candidates, 2);
}

#[tokio::test]
async fn failing_llm_collaborators_fall_back() {
	let mut cfg = test_config();

	cfg.search.expansion.enabled = true;
	cfg.search.rerank.enabled = true;
	cfg.search.rerank.min_candidates = 1;
	cfg.search.explain.enabled = true;

	let llm = Arc::new(FailingLlm::default());
	let providers = Providers::new(catalog(), llm.clone(), llm.clone(), llm.clone());
	let service = service(cfg, providers);
	let response = service.search(request("oak desk")).await.expect("Search must succeed.");

	assert_eq!(ids(&response.results), vec!["A", "B"]);
	assert_eq!(response.expanded_query, None);
	assert!(response.results.iter().all(|result| result.explanation.is_none()));
	assert_eq!(llm.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn llm_collaborators_expand_rerank_and_explain() {
	let mut cfg = test_config();

	cfg.search.expansion.enabled = true;
	cfg.search.rerank.enabled = true;
	cfg.search.rerank.min_candidates = 1;
	cfg.search.explain.enabled = true;
	cfg.search.explain.top_k = 1;

	let retrieval = Arc::new(StaticRetrieval::new(vec![
		Candidate::new("A", 0.9),
		Candidate::new("B", 0.7),
		Candidate::new("C", 0.5),
	]));
	let llm = Arc::new(ScriptedLlm {
		expansion: "oak desk wooden".to_string(),
		ranked_ids: vec!["C".to_string(), "A".to_string()],
	});
	let providers = Providers::new(retrieval.clone(), llm.clone(), llm.clone(), llm);
	let service = service(cfg, providers);
	let response = service.search(request("oak desk")).await.expect("Search must succeed.");

	assert_eq!(response.expanded_query.as_deref(), Some("oak desk wooden"));
	assert_eq!(retrieval.seen_queries(), vec!["oak desk wooden".to_string()]);
	assert_eq!(ids(&response.results), vec!["C", "A", "B"]);
	assert_eq!(response.results[0].explanation.as_deref(), Some("C matches oak desk."));
	assert!(response.results[1..].iter().all(|result| result.explanation.is_none()));
}

#[tokio::test]
async fn personal_history_lifts_preferred_items() {
	let mut cfg = test_config();

	cfg.personalization.enabled = true;
	cfg.ranking.semantic_weight = 0.5;
	cfg.ranking.behavior_weight = 0.0;
	cfg.ranking.personalization_weight = 0.5;

	let service = service(cfg, stub_providers(catalog()));

	for _ in 0..3 {
		let purchase = BehaviorEvent::new(EventType::Purchase, "s0").with_item("B").with_user("u1");

		service.track(purchase).await.expect("Track must succeed.");
	}

	idle(&service).await;

	let anonymous = service.search(request("oak desk")).await.expect("Search must succeed.");
	let personal = service
		.search(SearchRequest { user_id: Some("u1".to_string()), ..request("oak desk") })
		.await
		.expect("Search must succeed.");

	assert!(!anonymous.personalized);
	assert_eq!(ids(&anonymous.results), vec!["A", "B"]);
	assert!(personal.personalized);
	assert_eq!(ids(&personal.results), vec!["B", "A"]);
	assert!(personal.results[0].score_breakdown.personalization_score > 0.0);
}
