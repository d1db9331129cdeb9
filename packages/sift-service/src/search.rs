use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use sift_config::LlmProviderConfig;
use sift_domain::{BehaviorEvent, EventType};

use crate::{
	BoxFuture, Error, RankOptions, RankedResult, RerankHook, RerankProvider, RerankStage, Result,
	SiftService,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SearchRequest {
	pub query: String,
	pub session_id: String,
	#[serde(default)]
	pub user_id: Option<String>,
	/// Defaults to `search.top_k`.
	#[serde(default)]
	pub limit: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResponse {
	/// Also the `event_id` of the query-level SEARCH event.
	pub search_id: Uuid,
	pub query: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expanded_query: Option<String>,
	pub results: Vec<RankedResult>,
	pub total_candidates: usize,
	pub personalized: bool,
	pub took_ms: u64,
}

impl SiftService {
	/// Retrieves, ranks, and explains results for one query.
	///
	/// Only a retrieval failure fails the search. Every other collaborator falls back locally.
	/// Interaction events are handed to the ingestor without waiting for them.
	pub async fn search(&self, req: SearchRequest) -> Result<SearchResponse> {
		let started = Instant::now();
		let query = req.query.trim();
		let session_id = req.session_id.trim();

		if query.is_empty() {
			return Err(Error::InvalidRequest { message: "query must be non-empty.".to_string() });
		}
		if session_id.is_empty() {
			return Err(Error::InvalidRequest {
				message: "session_id must be non-empty.".to_string(),
			});
		}

		let limit = req.limit.unwrap_or(self.cfg.search.top_k);

		if limit == 0 {
			return Err(Error::InvalidRequest {
				message: "limit must be greater than zero.".to_string(),
			});
		}

		let user_id = req.user_id.as_deref().map(str::trim).filter(|user_id| !user_id.is_empty());
		let search_id = Uuid::new_v4();
		let now = OffsetDateTime::now_utc();

		self.ingestor.track(session_event(
			BehaviorEvent::new(EventType::Search, session_id)
				.with_id(search_id)
				.with_query(query)
				.at(now),
			user_id,
		));

		let expanded_query = self.expand_query(query).await;
		let candidates = self
			.providers
			.retrieval
			.retrieve(expanded_query.as_deref().unwrap_or(query), self.cfg.search.candidate_k)
			.await
			.map_err(|err| Error::Retrieval { message: err.to_string() })?;
		let total_candidates = candidates.len();
		let personalization = self.personalizer().scores(user_id, &candidates).await;
		let hook = LlmRerank { provider: self.providers.rerank.as_ref(), cfg: &self.cfg.providers.llm };
		let rerank_cfg = &self.cfg.search.rerank;
		let rerank = rerank_cfg.enabled.then(|| RerankStage {
			hook: &hook,
			top_k: rerank_cfg.top_k as usize,
			min_candidates: rerank_cfg.min_candidates as usize,
			timeout: Duration::from_millis(rerank_cfg.timeout_ms),
		});
		let mut results = self
			.ranker()
			.rank(
				query,
				candidates,
				RankOptions { personalization: Some(&personalization), rerank, now: Some(now) },
			)
			.await;

		results.truncate(limit as usize);

		for result in &results {
			let impression_id = Uuid::new_v5(&search_id, result.item_id.as_bytes());

			self.ingestor.track(session_event(
				BehaviorEvent::new(EventType::Search, session_id)
					.with_id(impression_id)
					.with_item(result.item_id.as_str())
					.at(now),
				user_id,
			));
		}

		if self.cfg.search.explain.enabled {
			self.attach_explanations(query, &mut results).await;
		}

		let took_ms = started.elapsed().as_millis() as u64;

		info!(
			search_id = %search_id,
			candidates = total_candidates,
			results = results.len(),
			took_ms,
			"Search completed."
		);

		Ok(SearchResponse {
			search_id,
			query: query.to_string(),
			expanded_query,
			results,
			total_candidates,
			personalized: !personalization.is_empty(),
			took_ms,
		})
	}

	/// Expanded query text, or `None` to search with the original query.
	async fn expand_query(&self, query: &str) -> Option<String> {
		let cfg = &self.cfg.search.expansion;

		if !cfg.enabled {
			return None;
		}

		let expansion = self.providers.expansion.expand(&self.cfg.providers.llm, query);

		match tokio::time::timeout(Duration::from_millis(cfg.timeout_ms), expansion).await {
			Ok(Ok(expanded)) => {
				let expanded = expanded.trim();

				(!expanded.is_empty() && expanded != query).then(|| expanded.to_string())
			},
			Ok(Err(err)) => {
				warn!(error = %err, "Query expansion failed. Using the original query.");

				None
			},
			Err(_) => {
				warn!(
					timeout_ms = cfg.timeout_ms,
					"Query expansion timed out. Using the original query."
				);

				None
			},
		}
	}

	async fn attach_explanations(&self, query: &str, results: &mut [RankedResult]) {
		let cfg = &self.cfg.search.explain;
		let timeout = Duration::from_millis(cfg.timeout_ms);
		let mut tasks = JoinSet::new();

		for (index, result) in results.iter().enumerate().take(cfg.top_k as usize) {
			let provider = self.providers.explanation.clone();
			let llm = self.cfg.providers.llm.clone();
			let query = query.to_string();
			let item_id = result.item_id.clone();
			let context = explanation_context(result);

			tasks.spawn(async move {
				let explained = tokio::time::timeout(
					timeout,
					provider.explain(&llm, &query, &item_id, &context),
				)
				.await;

				(index, item_id, explained)
			});
		}

		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok((index, _, Ok(Ok(text)))) if !text.trim().is_empty() =>
					results[index].explanation = Some(text.trim().to_string()),
				Ok((_, item_id, Ok(Ok(_)))) => {
					warn!(item_id = %item_id, "Explanation is empty.");
				},
				Ok((_, item_id, Ok(Err(err)))) => {
					warn!(item_id = %item_id, error = %err, "Explanation failed.");
				},
				Ok((_, item_id, Err(_))) => {
					warn!(
						item_id = %item_id,
						timeout_ms = cfg.timeout_ms,
						"Explanation timed out."
					);
				},
				Err(err) => {
					warn!(error = %err, "Explanation task failed.");
				},
			}
		}
	}
}

struct LlmRerank<'a> {
	provider: &'a dyn RerankProvider,
	cfg: &'a LlmProviderConfig,
}
impl RerankHook for LlmRerank<'_> {
	fn rerank<'a>(
		&'a self,
		query: &'a str,
		results: &'a [RankedResult],
	) -> BoxFuture<'a, color_eyre::Result<Vec<String>>> {
		Box::pin(async move {
			let item_ids = results.iter().map(|result| result.item_id.clone()).collect::<Vec<_>>();
			let documents = results
				.iter()
				.map(|result| result.summary.clone().unwrap_or_else(|| result.item_id.clone()))
				.collect::<Vec<_>>();

			self.provider.rerank(self.cfg, query, &item_ids, &documents).await
		})
	}
}

fn session_event(event: BehaviorEvent, user_id: Option<&str>) -> BehaviorEvent {
	match user_id {
		Some(user_id) => event.with_user(user_id),
		None => event,
	}
}

fn explanation_context(result: &RankedResult) -> String {
	let breakdown = &result.score_breakdown;
	let mut context = String::new();

	if let Some(summary) = result.summary.as_deref() {
		context.push_str(&format!("Description: {summary}\n"));
	}

	context.push_str(&format!(
		"Semantic relevance: {:.2}\nClick-through rate: {:.1}%\nConversion rate: {:.1}%\nFinal score: {:.3}",
		breakdown.semantic_score,
		breakdown.ctr * 100.0,
		breakdown.conversion_rate * 100.0,
		breakdown.final_score,
	));

	context
}
