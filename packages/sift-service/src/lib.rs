pub mod analytics;
pub mod ingest;
pub mod personalization;
pub mod ranker;
pub mod retrieval;
pub mod search;

mod error;

pub use analytics::{
	Analytics, AnalyticsReport, CtrInterval, CtrPoint, ItemSummary, QueryRef, QuerySummary,
};
pub use error::{Error, Result};
pub use ingest::{IngestStats, Ingestor, SubmitOutcome};
pub use personalization::Personalizer;
pub use ranker::{Candidate, RankOptions, RankedResult, Ranker, RerankHook, RerankStage};
pub use retrieval::QdrantRetrieval;
pub use search::{SearchRequest, SearchResponse};

use std::{future::Future, pin::Pin, sync::Arc};

use sift_config::{Config, LlmProviderConfig};
use sift_domain::{BehaviorEvent, BehaviorRecord, UserProfile};
use sift_providers::{expansion, explain, rerank};
use sift_storage::{
	DeadLetter, DeadLetterSink, EventLog, EventSpill, MetricsStore, ProfileStore,
	db::Db,
	memory::{MemoryDeadLetters, MemoryEventLog, MemoryMetricsStore, MemoryProfileStore},
	pg::{PgDeadLetters, PgEventLog, PgEventOutbox, PgMetricsStore, PgProfileStore},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Vector-similarity candidate source.
pub trait RetrievalProvider
where
	Self: Send + Sync,
{
	fn retrieve<'a>(
		&'a self,
		query: &'a str,
		top_k: u32,
	) -> BoxFuture<'a, color_eyre::Result<Vec<Candidate>>>;
}

pub trait ExpansionProvider
where
	Self: Send + Sync,
{
	fn expand<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		query: &'a str,
	) -> BoxFuture<'a, color_eyre::Result<String>>;
}

pub trait RerankProvider
where
	Self: Send + Sync,
{
	/// Returns item ids in preferred order. Ids may be missing or unknown.
	fn rerank<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		query: &'a str,
		item_ids: &'a [String],
		documents: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<String>>>;
}

pub trait ExplanationProvider
where
	Self: Send + Sync,
{
	fn explain<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		query: &'a str,
		item_id: &'a str,
		context: &'a str,
	) -> BoxFuture<'a, color_eyre::Result<String>>;
}

#[derive(Clone)]
pub struct Providers {
	pub retrieval: Arc<dyn RetrievalProvider>,
	pub expansion: Arc<dyn ExpansionProvider>,
	pub rerank: Arc<dyn RerankProvider>,
	pub explanation: Arc<dyn ExplanationProvider>,
}
impl Providers {
	pub fn new(
		retrieval: Arc<dyn RetrievalProvider>,
		expansion: Arc<dyn ExpansionProvider>,
		rerank: Arc<dyn RerankProvider>,
		explanation: Arc<dyn ExplanationProvider>,
	) -> Self {
		Self { retrieval, expansion, rerank, explanation }
	}

	/// Uses the HTTP chat client for expansion, re-ranking, and explanation.
	pub fn with_retrieval(retrieval: Arc<dyn RetrievalProvider>) -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { retrieval, expansion: provider.clone(), rerank: provider.clone(), explanation: provider }
	}
}

/// Backing stores for one service instance.
#[derive(Clone)]
pub struct Stores {
	pub metrics: Arc<dyn MetricsStore>,
	pub events: Arc<dyn EventLog>,
	pub dead_letters: Arc<dyn DeadLetterSink>,
	pub profiles: Arc<dyn ProfileStore>,
	pub spill: Option<Arc<dyn EventSpill>>,
}
impl Stores {
	pub fn in_memory() -> Self {
		Self {
			metrics: Arc::new(MemoryMetricsStore::new()),
			events: Arc::new(MemoryEventLog::new()),
			dead_letters: Arc::new(MemoryDeadLetters::new()),
			profiles: Arc::new(MemoryProfileStore::new()),
			spill: None,
		}
	}

	/// Postgres stores. Overflowing events spill into the outbox drained by `sift-worker`.
	pub fn postgres(db: Db) -> Self {
		Self {
			metrics: Arc::new(PgMetricsStore::new(db.clone())),
			events: Arc::new(PgEventLog::new(db.clone())),
			dead_letters: Arc::new(PgDeadLetters::new(db.clone())),
			profiles: Arc::new(PgProfileStore::new(db.clone())),
			spill: Some(Arc::new(PgEventOutbox::new(db))),
		}
	}

	pub fn with_spill(mut self, spill: Arc<dyn EventSpill>) -> Self {
		self.spill = Some(spill);

		self
	}
}

pub struct SiftService {
	pub cfg: Config,
	pub stores: Stores,
	pub providers: Providers,
	pub ingestor: Ingestor,
}
impl SiftService {
	/// Starts the ingestion workers, so it must be called inside a Tokio runtime.
	pub fn new(cfg: Config, stores: Stores, providers: Providers) -> Self {
		let ingestor = Ingestor::start(&cfg.ingest, &cfg.personalization, stores.clone());

		Self { cfg, stores, providers, ingestor }
	}

	pub fn ranker(&self) -> Ranker {
		Ranker::from_config(&self.cfg, self.stores.metrics.clone())
	}

	pub fn personalizer(&self) -> Personalizer {
		Personalizer::new(self.stores.profiles.clone(), self.cfg.personalization.clone())
	}

	pub fn analytics(&self) -> Analytics {
		Analytics::new(self.stores.events.clone(), self.cfg.analytics.clone())
	}

	/// Queues an interaction event. Returns once the event is queued, spilled, or dropped.
	pub async fn track(&self, event: BehaviorEvent) -> Result<SubmitOutcome> {
		self.ingestor.submit(event).await
	}

	pub async fn item_metrics(&self, item_id: &str) -> Result<BehaviorRecord> {
		Ok(self.stores.metrics.get(item_id).await?)
	}

	pub async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
		Ok(self.stores.profiles.get(user_id).await?)
	}

	pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
		Ok(self.stores.dead_letters.list(limit).await?)
	}
}

struct DefaultProviders;
impl ExpansionProvider for DefaultProviders {
	fn expand<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		query: &'a str,
	) -> BoxFuture<'a, color_eyre::Result<String>> {
		Box::pin(expansion::expand(cfg, query))
	}
}
impl RerankProvider for DefaultProviders {
	fn rerank<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		query: &'a str,
		item_ids: &'a [String],
		documents: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<String>>> {
		Box::pin(rerank::rerank(cfg, query, item_ids, documents))
	}
}
impl ExplanationProvider for DefaultProviders {
	fn explain<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		query: &'a str,
		item_id: &'a str,
		context: &'a str,
	) -> BoxFuture<'a, color_eyre::Result<String>> {
		Box::pin(explain::explain(cfg, query, item_id, context))
	}
}
