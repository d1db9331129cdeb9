use std::{collections::HashMap, sync::Arc, time::Duration};

use time::macros::datetime;

use sift_config::RankingDecay;
use sift_domain::{CounterField, Weights};
use sift_service::{
	BoxFuture, Candidate, RankOptions, RankedResult, Ranker, RerankHook, RerankStage,
};
use sift_storage::{MetricsStore, memory::MemoryMetricsStore};

use super::SlowMetrics;

const TOLERANCE: f64 = 1e-12;

fn ranker(metrics: Arc<dyn MetricsStore>) -> Ranker {
	Ranker::new(metrics, Weights::default(), RankingDecay::default(), Duration::from_millis(200))
}

fn ids(results: &[RankedResult]) -> Vec<&str> {
	results.iter().map(|result| result.item_id.as_str()).collect()
}

async fn seeded_store() -> Arc<MemoryMetricsStore> {
	let store = Arc::new(MemoryMetricsStore::new());
	let at = datetime!(2026-03-01 12:00 UTC);

	for (field, delta) in [
		(CounterField::SearchesSeen, 100),
		(CounterField::Clicks, 25),
		(CounterField::Purchases, 2),
		(CounterField::Bounces, 1),
	] {
		store.increment("B", field, delta, at).await.expect("Increment must succeed.");
	}

	store
}

struct FixedOrder(Vec<&'static str>);
impl RerankHook for FixedOrder {
	fn rerank<'a>(
		&'a self,
		_query: &'a str,
		results: &'a [RankedResult],
	) -> BoxFuture<'a, color_eyre::Result<Vec<String>>> {
		assert!(results.len() <= 2, "Only the leading results reach the hook.");

		let order = self.0.iter().map(|id| id.to_string()).collect();

		Box::pin(async move { Ok(order) })
	}
}

struct BrokenHook;
impl RerankHook for BrokenHook {
	fn rerank<'a>(
		&'a self,
		_query: &'a str,
		_results: &'a [RankedResult],
	) -> BoxFuture<'a, color_eyre::Result<Vec<String>>> {
		Box::pin(async move { Err(color_eyre::eyre::eyre!("Model returned invalid JSON.")) })
	}
}

struct StalledHook;
impl RerankHook for StalledHook {
	fn rerank<'a>(
		&'a self,
		_query: &'a str,
		_results: &'a [RankedResult],
	) -> BoxFuture<'a, color_eyre::Result<Vec<String>>> {
		Box::pin(async move {
			tokio::time::sleep(Duration::from_secs(30)).await;

			Ok(vec!["c".to_string()])
		})
	}
}

#[tokio::test]
async fn cold_catalog_ranks_by_semantic_score() {
	let ranker = ranker(Arc::new(MemoryMetricsStore::new()));
	let results = ranker
		.rank(
			"oak desk",
			vec![Candidate::new("B", 0.7), Candidate::new("A", 0.9)],
			RankOptions::default(),
		)
		.await;

	assert_eq!(ids(&results), vec!["A", "B"]);
	assert!((results[0].final_score - 0.36).abs() < TOLERANCE);
	assert!((results[1].final_score - 0.28).abs() < TOLERANCE);
	assert_eq!(results[0].behavior_score, 0.0);
}

#[tokio::test]
async fn learned_behavior_is_scored_from_the_store() {
	let ranker = ranker(seeded_store().await);
	let results = ranker
		.rank(
			"oak desk",
			vec![Candidate::new("A", 0.9), Candidate::new("B", 0.7)],
			RankOptions::default(),
		)
		.await;
	let b = &results[1];

	assert_eq!(ids(&results), vec!["A", "B"]);
	assert!((b.score_breakdown.ctr - 0.25).abs() < TOLERANCE);
	assert!((b.score_breakdown.conversion_rate - 0.08).abs() < TOLERANCE);
	assert!((b.score_breakdown.bounce_rate - 0.04).abs() < TOLERANCE);
	assert!((b.behavior_score - 0.091).abs() < TOLERANCE);
	assert!((b.final_score - 0.3346).abs() < TOLERANCE);
}

#[tokio::test]
async fn equal_scores_keep_input_order_and_repeat_exactly() {
	let ranker = ranker(Arc::new(MemoryMetricsStore::new()));
	let candidates = vec![
		Candidate::new("c", 0.5),
		Candidate::new("a", 0.5),
		Candidate::new("b", 0.5),
		Candidate::new("d", 0.8),
	];
	let first = ranker.rank("q", candidates.clone(), RankOptions::default()).await;
	let second = ranker.rank("q", candidates, RankOptions::default()).await;

	assert_eq!(ids(&first), vec!["d", "c", "a", "b"]);
	assert_eq!(first, second);
}

#[tokio::test]
async fn empty_and_unusable_candidates_yield_what_is_left() {
	let ranker = ranker(Arc::new(MemoryMetricsStore::new()));

	assert!(ranker.rank("q", Vec::new(), RankOptions::default()).await.is_empty());

	let results = ranker
		.rank(
			"q",
			vec![
				Candidate::new("nan", f64::NAN),
				Candidate::new("high", 3.0),
				Candidate::new("low", -1.0),
			],
			RankOptions::default(),
		)
		.await;

	assert_eq!(ids(&results), vec!["high", "low"]);
	assert_eq!(results[0].semantic_score, 1.0);
	assert_eq!(results[1].semantic_score, 0.0);
}

#[tokio::test]
async fn slow_metrics_fall_back_to_cold_records() {
	let ranker = Ranker::new(
		Arc::new(SlowMetrics),
		Weights::default(),
		RankingDecay::default(),
		Duration::from_millis(20),
	);
	let results = ranker
		.rank(
			"q",
			vec![Candidate::new("a", 0.2), Candidate::new("b", 0.6)],
			RankOptions::default(),
		)
		.await;

	assert_eq!(ids(&results), vec!["b", "a"]);
	assert!(results.iter().all(|result| result.behavior_score == 0.0));
}

#[tokio::test]
async fn rerank_hook_reorders_only_the_leading_results() {
	let ranker = ranker(Arc::new(MemoryMetricsStore::new()));
	let hook = FixedOrder(vec!["b", "unknown"]);
	let results = ranker
		.rank(
			"q",
			vec![Candidate::new("a", 0.9), Candidate::new("b", 0.8), Candidate::new("c", 0.7)],
			RankOptions {
				rerank: Some(RerankStage {
					hook: &hook,
					top_k: 2,
					min_candidates: 1,
					timeout: Duration::from_secs(1),
				}),
				..Default::default()
			},
		)
		.await;

	assert_eq!(ids(&results), vec!["b", "a", "c"]);
}

#[tokio::test]
async fn failing_or_stalled_rerank_keeps_scored_order() {
	let ranker = ranker(Arc::new(MemoryMetricsStore::new()));
	let candidates =
		vec![Candidate::new("a", 0.9), Candidate::new("b", 0.8), Candidate::new("c", 0.7)];
	let hooks: [&dyn RerankHook; 2] = [&BrokenHook, &StalledHook];

	for hook in hooks {
		let results = ranker
			.rank(
				"q",
				candidates.clone(),
				RankOptions {
					rerank: Some(RerankStage {
						hook,
						top_k: 3,
						min_candidates: 1,
						timeout: Duration::from_millis(20),
					}),
					..Default::default()
				},
			)
			.await;

		assert_eq!(ids(&results), vec!["a", "b", "c"]);
	}
}

#[tokio::test]
async fn rerank_is_skipped_below_min_candidates() {
	let ranker = ranker(Arc::new(MemoryMetricsStore::new()));
	let hook = FixedOrder(vec!["b"]);
	let results = ranker
		.rank(
			"q",
			vec![Candidate::new("a", 0.9), Candidate::new("b", 0.8)],
			RankOptions {
				rerank: Some(RerankStage {
					hook: &hook,
					top_k: 2,
					min_candidates: 10,
					timeout: Duration::from_secs(1),
				}),
				..Default::default()
			},
		)
		.await;

	assert_eq!(ids(&results), vec!["a", "b"]);
}

#[tokio::test]
async fn personalization_lifts_preferred_items() {
	let weights = Weights {
		semantic: 0.4,
		behavior: 0.4,
		personalization: 0.2,
		..Weights::default()
	};
	let ranker = Ranker::new(
		Arc::new(MemoryMetricsStore::new()),
		weights,
		RankingDecay::default(),
		Duration::from_millis(200),
	);
	let preferences = HashMap::from([("b".to_string(), 1.0)]);
	let results = ranker
		.rank(
			"q",
			vec![Candidate::new("a", 0.9), Candidate::new("b", 0.7)],
			RankOptions { personalization: Some(&preferences), ..Default::default() },
		)
		.await;

	assert_eq!(ids(&results), vec!["b", "a"]);
	assert!((results[0].final_score - (0.4 * 0.7 + 0.2)).abs() < TOLERANCE);
}

#[tokio::test]
async fn decay_discounts_stale_behavior() {
	let store = seeded_store().await;
	let decay = RankingDecay { enabled: true, tau_days: 30.0 };
	let timeout = Duration::from_millis(200);
	let fresh = Ranker::new(store.clone(), Weights::default(), RankingDecay::default(), timeout);
	let stale = Ranker::new(store, Weights::default(), decay, timeout);
	let options =
		|| RankOptions { now: Some(datetime!(2026-03-31 12:00 UTC)), ..Default::default() };
	let fresh_b = fresh.rank("q", vec![Candidate::new("B", 0.7)], options()).await;
	let stale_b = stale.rank("q", vec![Candidate::new("B", 0.7)], options()).await;

	assert!((stale_b[0].behavior_score - 0.091 * (-1.0_f64).exp()).abs() < TOLERANCE);
	assert!(stale_b[0].final_score < fresh_b[0].final_score);
}
