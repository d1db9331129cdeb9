use std::{
	collections::{HashMap, HashSet},
	fs,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use clap::Parser;
use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use sift_config::Config;
use sift_domain::{BehaviorEvent, EventType, TimeRange};
use sift_service::{
	AnalyticsReport, BoxFuture, Candidate, IngestStats, Providers, RankOptions, RankedResult,
	RetrievalProvider, SearchRequest, SiftService, Stores,
};

const EVAL_SESSION_ID: &str = "sift-eval";
const IDLE_TIMEOUT_SECS: u64 = 60;

/// Replays recorded interactions through an in-memory pipeline and reports how rankings moved.
#[derive(Debug, Parser)]
#[command(
	version = sift_cli::VERSION,
	rename_all = "kebab",
	styles = sift_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[arg(long, short = 'd', value_name = "FILE")]
	pub dataset: PathBuf,
	#[arg(long, value_name = "N")]
	pub top_k: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct EvalDataset {
	pub name: Option<String>,
	#[serde(default)]
	pub events: Vec<DatasetEvent>,
	pub queries: Vec<EvalQuery>,
}

/// A recorded interaction. `event_id` is derived from the position when absent.
#[derive(Debug, Deserialize)]
pub struct DatasetEvent {
	#[serde(default)]
	pub event_id: Option<Uuid>,
	pub event_type: EventType,
	#[serde(default)]
	pub item_id: Option<String>,
	#[serde(default)]
	pub query: Option<String>,
	pub session_id: String,
	#[serde(default)]
	pub user_id: Option<String>,
	#[serde(with = "sift_domain::time_serde")]
	pub timestamp: OffsetDateTime,
	#[serde(default)]
	pub dwell_time: Option<f64>,
}
impl DatasetEvent {
	fn into_event(self, index: usize) -> BehaviorEvent {
		let event_id = self.event_id.unwrap_or_else(|| {
			Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("sift-eval:{index}").as_bytes())
		});

		BehaviorEvent {
			event_id,
			event_type: self.event_type,
			item_id: self.item_id,
			query: self.query,
			session_id: self.session_id,
			user_id: self.user_id,
			timestamp: self.timestamp,
			dwell_time: self.dwell_time,
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct EvalQuery {
	pub id: Option<String>,
	pub query: String,
	#[serde(default)]
	pub user_id: Option<String>,
	pub candidates: Vec<Candidate>,
	#[serde(default)]
	pub expected_item_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EvalOutput {
	pub dataset: EvalDatasetInfo,
	pub settings: EvalSettings,
	pub ingest: IngestStats,
	pub summary: EvalSummary,
	pub queries: Vec<QueryReport>,
	/// Covers the replayed events only. Absent when the dataset has none.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub analytics: Option<AnalyticsReport>,
}

#[derive(Debug, Serialize)]
pub struct EvalDatasetInfo {
	pub name: String,
	pub query_count: usize,
	pub event_count: usize,
}

#[derive(Debug, Serialize)]
pub struct EvalSettings {
	pub top_k: u32,
	pub semantic_weight: f64,
	pub behavior_weight: f64,
	pub personalization_weight: f64,
}

#[derive(Debug, Serialize)]
pub struct EvalSummary {
	pub cold_mean_rr: f64,
	pub learned_mean_rr: f64,
	pub cold_mean_ndcg: f64,
	pub learned_mean_ndcg: f64,
	pub moved_queries: usize,
}

#[derive(Debug, Serialize)]
pub struct QueryReport {
	pub id: String,
	pub query: String,
	pub expected_item_ids: Vec<String>,
	/// Ranked before any event was replayed.
	pub cold: VariantReport,
	/// Ranked through the full search path after the replay.
	pub learned: VariantReport,
}

#[derive(Debug, Serialize)]
pub struct VariantReport {
	pub item_ids: Vec<String>,
	pub final_scores: Vec<f64>,
	pub rr: f64,
	pub ndcg: f64,
}
impl VariantReport {
	fn new(results: &[RankedResult], expected: &[String], k: usize) -> Self {
		let item_ids = results.iter().map(|result| result.item_id.clone()).collect::<Vec<_>>();

		Self {
			rr: reciprocal_rank(&item_ids, expected),
			ndcg: ndcg_at_k(&item_ids, expected, k),
			final_scores: results.iter().map(|result| result.final_score).collect(),
			item_ids,
		}
	}
}

/// Serves each dataset query its recorded candidate list.
pub struct DatasetRetrieval {
	candidates: HashMap<String, Vec<Candidate>>,
}
impl DatasetRetrieval {
	pub fn new(queries: &[EvalQuery]) -> Self {
		let candidates = queries
			.iter()
			.map(|query| (query.query.trim().to_string(), query.candidates.clone()))
			.collect();

		Self { candidates }
	}
}
impl RetrievalProvider for DatasetRetrieval {
	fn retrieve<'a>(
		&'a self,
		query: &'a str,
		top_k: u32,
	) -> BoxFuture<'a, color_eyre::Result<Vec<Candidate>>> {
		let candidates = self
			.candidates
			.get(query.trim())
			.map(|candidates| candidates.iter().take(top_k as usize).cloned().collect())
			.unwrap_or_default();

		Box::pin(async move { Ok(candidates) })
	}
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = sift_config::load(&args.config)?;

	sift_cli::init_tracing(&config.service.log_level);

	let dataset = load_dataset(&args.dataset)?;
	let output = replay(config, dataset, args.top_k).await?;
	let json = serde_json::to_string_pretty(&output)?;

	println!("{json}");

	Ok(())
}

pub fn load_dataset(path: &Path) -> color_eyre::Result<EvalDataset> {
	let raw = fs::read_to_string(path)?;
	let dataset: EvalDataset = serde_json::from_str(&raw)?;

	if dataset.queries.is_empty() {
		return Err(eyre::eyre!("Dataset must contain at least one query."));
	}

	Ok(dataset)
}

/// Ranks every query cold, replays the events, then ranks again through `search`.
pub async fn replay(
	cfg: Config,
	dataset: EvalDataset,
	top_k: Option<u32>,
) -> color_eyre::Result<EvalOutput> {
	let top_k = top_k.unwrap_or(cfg.search.top_k).max(1);
	let settings = EvalSettings {
		top_k,
		semantic_weight: cfg.ranking.semantic_weight,
		behavior_weight: cfg.ranking.behavior_weight,
		personalization_weight: cfg.ranking.personalization_weight,
	};
	let providers = Providers::with_retrieval(Arc::new(DatasetRetrieval::new(&dataset.queries)));
	let service = SiftService::new(cfg, Stores::in_memory(), providers);
	let ranker = service.ranker();
	let mut cold = Vec::with_capacity(dataset.queries.len());

	for query in &dataset.queries {
		let mut results =
			ranker.rank(&query.query, query.candidates.clone(), RankOptions::default()).await;

		results.truncate(top_k as usize);
		cold.push(results);
	}

	let events = dataset
		.events
		.into_iter()
		.enumerate()
		.map(|(index, event)| event.into_event(index))
		.collect::<Vec<_>>();
	let event_count = events.len();
	let window = event_window(&events);

	for event in events {
		service.track(event).await?;
	}

	tokio::time::timeout(Duration::from_secs(IDLE_TIMEOUT_SECS), service.ingestor.wait_idle())
		.await
		.map_err(|_| eyre::eyre!("Event replay did not settle within {IDLE_TIMEOUT_SECS}s."))?;

	let ingest = service.ingestor.stats();

	info!(events = event_count, stats = ?ingest, "Event replay settled.");

	// Read before the learned searches log their own events.
	let analytics = match window {
		Some(range) => {
			let limit = service.cfg.analytics.top_limit as usize;

			Some(service.analytics().report(range, limit).await?)
		},
		None => None,
	};
	let mut queries = Vec::with_capacity(dataset.queries.len());

	for (query, cold) in dataset.queries.into_iter().zip(cold) {
		let response = service
			.search(SearchRequest {
				query: query.query.clone(),
				session_id: EVAL_SESSION_ID.to_string(),
				user_id: query.user_id.clone(),
				limit: Some(top_k),
			})
			.await?;
		let k = top_k as usize;

		queries.push(QueryReport {
			id: query.id.unwrap_or_else(|| query.query.clone()),
			cold: VariantReport::new(&cold, &query.expected_item_ids, k),
			learned: VariantReport::new(&response.results, &query.expected_item_ids, k),
			query: query.query,
			expected_item_ids: query.expected_item_ids,
		});
	}

	service.ingestor.shutdown().await;

	Ok(EvalOutput {
		dataset: EvalDatasetInfo {
			name: dataset.name.unwrap_or_else(|| "unnamed".to_string()),
			query_count: queries.len(),
			event_count,
		},
		settings,
		ingest,
		summary: summarize(&queries),
		queries,
		analytics,
	})
}

fn event_window(events: &[BehaviorEvent]) -> Option<TimeRange> {
	let start = events.iter().map(|event| event.timestamp).min()?;
	let end = events.iter().map(|event| event.timestamp).max()?;

	Some(TimeRange::new(start, end + time::Duration::nanoseconds(1)))
}

fn summarize(reports: &[QueryReport]) -> EvalSummary {
	let count = reports.len().max(1) as f64;
	let mean = |value: fn(&QueryReport) -> f64| reports.iter().map(value).sum::<f64>() / count;

	EvalSummary {
		cold_mean_rr: mean(|report| report.cold.rr),
		learned_mean_rr: mean(|report| report.learned.rr),
		cold_mean_ndcg: mean(|report| report.cold.ndcg),
		learned_mean_ndcg: mean(|report| report.learned.ndcg),
		moved_queries: reports
			.iter()
			.filter(|report| report.cold.item_ids != report.learned.item_ids)
			.count(),
	}
}

/// `1 / rank` of the first expected item, or 0.
pub fn reciprocal_rank(item_ids: &[String], expected: &[String]) -> f64 {
	let expected = expected.iter().collect::<HashSet<_>>();

	item_ids
		.iter()
		.position(|item_id| expected.contains(item_id))
		.map(|index| 1.0 / (index + 1) as f64)
		.unwrap_or(0.0)
}

/// Binary-relevance nDCG over the first `k` items.
pub fn ndcg_at_k(item_ids: &[String], expected: &[String], k: usize) -> f64 {
	let expected = expected.iter().collect::<HashSet<_>>();
	let dcg = item_ids
		.iter()
		.take(k)
		.enumerate()
		.filter(|(_, item_id)| expected.contains(item_id))
		.map(|(index, _)| 1.0 / ((index + 2) as f64).log2())
		.sum::<f64>();
	let ideal = (0..expected.len().min(k))
		.map(|index| 1.0 / ((index + 2) as f64).log2())
		.sum::<f64>();

	if ideal == 0.0 { 0.0 } else { dcg / ideal }
}
