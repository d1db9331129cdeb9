use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	pub search: Search,
	#[serde(default)]
	pub ranking: Ranking,
	#[serde(default)]
	pub personalization: Personalization,
	#[serde(default)]
	pub ingest: Ingest,
	#[serde(default)]
	pub analytics: Analytics,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
	pub qdrant: Qdrant,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Qdrant {
	pub url: String,
	pub collection: String,
	pub vector_dim: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub llm: LlmProviderConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Search {
	pub top_k: u32,
	pub candidate_k: u32,
	pub metrics_timeout_ms: u64,
	#[serde(default)]
	pub expansion: SearchExpansion,
	#[serde(default)]
	pub rerank: SearchRerank,
	#[serde(default)]
	pub explain: SearchExplain,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SearchExpansion {
	pub enabled: bool,
	pub timeout_ms: u64,
}
impl Default for SearchExpansion {
	fn default() -> Self {
		Self { enabled: false, timeout_ms: 1_500 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SearchRerank {
	pub enabled: bool,
	/// Only the leading `top_k` results are handed to the re-ranker; the tail keeps its order.
	pub top_k: u32,
	/// Re-ranking is skipped when fewer candidates than this were retrieved.
	pub min_candidates: u32,
	pub timeout_ms: u64,
}
impl Default for SearchRerank {
	fn default() -> Self {
		Self { enabled: false, top_k: 50, min_candidates: 10, timeout_ms: 3_000 }
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SearchExplain {
	pub enabled: bool,
	pub top_k: u32,
	pub timeout_ms: u64,
}
impl Default for SearchExplain {
	fn default() -> Self {
		Self { enabled: false, top_k: 5, timeout_ms: 3_000 }
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Ranking {
	pub semantic_weight: f64,
	pub behavior_weight: f64,
	pub personalization_weight: f64,
	pub ctr_weight: f64,
	pub conversion_weight: f64,
	pub bounce_penalty: f64,
	pub decay: RankingDecay,
}
impl Default for Ranking {
	fn default() -> Self {
		Self {
			semantic_weight: 0.4,
			behavior_weight: 0.6,
			personalization_weight: 0.0,
			ctr_weight: 0.3,
			conversion_weight: 0.3,
			bounce_penalty: 0.2,
			decay: RankingDecay::default(),
		}
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RankingDecay {
	pub enabled: bool,
	pub tau_days: f64,
}
impl Default for RankingDecay {
	fn default() -> Self {
		Self { enabled: false, tau_days: 30.0 }
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Personalization {
	pub enabled: bool,
	pub min_interactions: u32,
	pub affinity_weight: f64,
	pub recency_weight: f64,
	pub recency_decay_positions: f64,
	pub max_recent_items: u32,
	pub timeout_ms: u64,
}
impl Default for Personalization {
	fn default() -> Self {
		Self {
			enabled: false,
			min_interactions: 3,
			affinity_weight: 0.5,
			recency_weight: 0.5,
			recency_decay_positions: 20.0,
			max_recent_items: 100,
			timeout_ms: 200,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
	/// Wait for queue capacity.
	Block,
	/// Discard the event and count it.
	Drop,
	/// Hand the event to the durable outbox.
	Spill,
}
impl BackpressureMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Block => "block",
			Self::Drop => "drop",
			Self::Spill => "spill",
		}
	}
}
impl<'de> Deserialize<'de> for BackpressureMode {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;

		match raw.trim().to_ascii_lowercase().as_str() {
			"block" => Ok(Self::Block),
			"drop" => Ok(Self::Drop),
			"spill" => Ok(Self::Spill),
			_ => Err(D::Error::unknown_variant(&raw, &["block", "drop", "spill"])),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Ingest {
	pub queue_capacity: u32,
	pub workers: u32,
	pub backpressure: BackpressureMode,
	pub max_attempts: u32,
	pub base_backoff_ms: u64,
	pub max_backoff_ms: u64,
}
impl Default for Ingest {
	fn default() -> Self {
		Self {
			queue_capacity: 10_000,
			workers: 4,
			backpressure: BackpressureMode::Block,
			max_attempts: 5,
			base_backoff_ms: 200,
			max_backoff_ms: 10_000,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Analytics {
	pub low_ctr_threshold: f64,
	pub low_conversion_threshold: f64,
	/// Fewest searches before a query can be flagged for low conversion.
	pub low_conversion_min_searches: u64,
	pub top_limit: u32,
}
impl Default for Analytics {
	fn default() -> Self {
		Self {
			low_ctr_threshold: 0.10,
			low_conversion_threshold: 0.05,
			low_conversion_min_searches: 6,
			top_limit: 50,
		}
	}
}
