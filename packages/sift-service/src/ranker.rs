use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use sift_config::{Config, RankingDecay};
use sift_domain::{
	BehaviorRecord, ScoreAdjustments, ScoreBreakdown, Weights,
	scoring::{self, freshness},
};
use sift_storage::MetricsStore;

use crate::BoxFuture;

/// A retrieved item awaiting ranking.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Candidate {
	pub item_id: String,
	pub semantic_score: f64,
	/// Short description handed to the re-rank and explanation collaborators.
	#[serde(default)]
	pub summary: Option<String>,
}
impl Candidate {
	pub fn new(item_id: impl Into<String>, semantic_score: f64) -> Self {
		Self { item_id: item_id.into(), semantic_score, summary: None }
	}

	pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
		self.summary = Some(summary.into());

		self
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedResult {
	pub item_id: String,
	pub semantic_score: f64,
	pub behavior_score: f64,
	pub final_score: f64,
	pub score_breakdown: ScoreBreakdown,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub explanation: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub summary: Option<String>,
}

/// Optional post-scoring reorder of the leading results.
pub trait RerankHook
where
	Self: Send + Sync,
{
	/// Returns item ids in preferred order.
	fn rerank<'a>(
		&'a self,
		query: &'a str,
		results: &'a [RankedResult],
	) -> BoxFuture<'a, color_eyre::Result<Vec<String>>>;
}

pub struct RerankStage<'a> {
	pub hook: &'a dyn RerankHook,
	pub top_k: usize,
	/// The hook is skipped when fewer results than this are available.
	pub min_candidates: usize,
	pub timeout: Duration,
}

#[derive(Default)]
pub struct RankOptions<'a> {
	/// Item id to preference score for the requesting user.
	pub personalization: Option<&'a HashMap<String, f64>>,
	pub rerank: Option<RerankStage<'a>>,
	/// Reference time for staleness decay. Defaults to now.
	pub now: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct Ranker {
	metrics: Arc<dyn MetricsStore>,
	weights: Weights,
	decay: RankingDecay,
	metrics_timeout: Duration,
}
impl Ranker {
	pub fn new(
		metrics: Arc<dyn MetricsStore>,
		weights: Weights,
		decay: RankingDecay,
		metrics_timeout: Duration,
	) -> Self {
		Self { metrics, weights, decay, metrics_timeout }
	}

	pub fn from_config(cfg: &Config, metrics: Arc<dyn MetricsStore>) -> Self {
		Self::new(
			metrics,
			Weights::from(&cfg.ranking),
			cfg.ranking.decay.clone(),
			Duration::from_millis(cfg.search.metrics_timeout_ms),
		)
	}

	pub fn weights(&self) -> &Weights {
		&self.weights
	}

	/// Scores, orders, and optionally re-ranks `candidates`.
	///
	/// Never fails: a slow or failing metrics read ranks with cold records, and a failing re-rank
	/// hook leaves the scored order untouched. Equal scores keep the input order.
	pub async fn rank(
		&self,
		query: &str,
		candidates: Vec<Candidate>,
		options: RankOptions<'_>,
	) -> Vec<RankedResult> {
		let candidates = sanitize_candidates(candidates);

		if candidates.is_empty() {
			return Vec::new();
		}

		let now = options.now.unwrap_or_else(OffsetDateTime::now_utc);
		let item_ids = candidates.iter().map(|candidate| candidate.item_id.clone()).collect::<Vec<_>>();
		let mut records = self.load_records(&item_ids).await;
		let mut results = Vec::with_capacity(candidates.len());

		for candidate in candidates {
			let record = records
				.remove(&candidate.item_id)
				.unwrap_or_else(|| BehaviorRecord::cold(candidate.item_id.as_str()));
			let personalization_score = options
				.personalization
				.and_then(|scores| scores.get(&candidate.item_id).copied())
				.filter(|score| score.is_finite())
				.unwrap_or(0.0);
			let adjustments = ScoreAdjustments {
				personalization_score,
				freshness: freshness(&record, now, &self.decay),
			};
			let breakdown =
				scoring::score_with(candidate.semantic_score, &record, &self.weights, adjustments);

			results.push(RankedResult {
				item_id: candidate.item_id,
				semantic_score: breakdown.semantic_score,
				behavior_score: breakdown.behavior_score,
				final_score: breakdown.final_score,
				score_breakdown: breakdown,
				explanation: None,
				summary: candidate.summary,
			});
		}

		results.sort_by(|left, right| right.final_score.total_cmp(&left.final_score));

		match options.rerank {
			Some(stage) => apply_rerank(query, results, &stage).await,
			None => results,
		}
	}

	async fn load_records(&self, item_ids: &[String]) -> HashMap<String, BehaviorRecord> {
		match tokio::time::timeout(self.metrics_timeout, self.metrics.get_many(item_ids)).await {
			Ok(Ok(records)) => records,
			Ok(Err(err)) => {
				warn!(error = %err, "Metrics read failed. Ranking with cold records.");

				HashMap::new()
			},
			Err(_) => {
				warn!(
					timeout_ms = self.metrics_timeout.as_millis() as u64,
					"Metrics read timed out. Ranking with cold records."
				);

				HashMap::new()
			},
		}
	}
}

/// Drops candidates that cannot be scored. Later duplicates of an item id are dropped too.
pub fn sanitize_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
	let mut seen = HashSet::with_capacity(candidates.len());
	let mut kept = Vec::with_capacity(candidates.len());

	for candidate in candidates {
		if candidate.item_id.trim().is_empty() {
			warn!("Dropping candidate with an empty item id.");

			continue;
		}
		if !candidate.semantic_score.is_finite() {
			warn!(
				item_id = %candidate.item_id,
				semantic_score = candidate.semantic_score,
				"Dropping candidate with a non-numeric semantic score."
			);

			continue;
		}
		if !seen.insert(candidate.item_id.clone()) {
			warn!(item_id = %candidate.item_id, "Dropping duplicate candidate.");

			continue;
		}

		kept.push(candidate);
	}

	kept
}

async fn apply_rerank(
	query: &str,
	results: Vec<RankedResult>,
	stage: &RerankStage<'_>,
) -> Vec<RankedResult> {
	if stage.top_k == 0 || results.len() < stage.min_candidates.max(1) {
		return results;
	}

	let head_len = stage.top_k.min(results.len());

	match tokio::time::timeout(stage.timeout, stage.hook.rerank(query, &results[..head_len])).await
	{
		Ok(Ok(ranked_ids)) => apply_rerank_order(results, head_len, &ranked_ids),
		Ok(Err(err)) => {
			warn!(error = %err, "Re-rank failed. Keeping scored order.");

			results
		},
		Err(_) => {
			warn!(
				timeout_ms = stage.timeout.as_millis() as u64,
				"Re-rank timed out. Keeping scored order."
			);

			results
		},
	}
}

/// Reorders the first `head_len` results: ids named in `ranked_ids` first in that order, then the
/// unnamed ones in their prior order. Unknown and repeated ids are ignored. The tail is untouched.
pub fn apply_rerank_order(
	results: Vec<RankedResult>,
	head_len: usize,
	ranked_ids: &[String],
) -> Vec<RankedResult> {
	let head_len = head_len.min(results.len());
	let mut results = results.into_iter();
	let mut head = results.by_ref().take(head_len).map(Some).collect::<Vec<_>>();
	let positions = head
		.iter()
		.enumerate()
		.filter_map(|(index, result)| result.as_ref().map(|result| (result.item_id.clone(), index)))
		.collect::<HashMap<_, _>>();
	let mut ordered = Vec::with_capacity(head_len);

	for item_id in ranked_ids {
		if let Some(&index) = positions.get(item_id)
			&& let Some(result) = head[index].take()
		{
			ordered.push(result);
		}
	}

	ordered.extend(head.into_iter().flatten());
	ordered.extend(results);

	ordered
}
