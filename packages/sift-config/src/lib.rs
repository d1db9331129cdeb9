mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Analytics, BackpressureMode, Config, EmbeddingProviderConfig, Ingest, LlmProviderConfig,
	Personalization, Postgres, Providers, Qdrant, Ranking, RankingDecay, Search, SearchExpansion,
	SearchExplain, SearchRerank, Service, Storage,
};

use std::{fs, path::Path};

/// Tolerance for the blend weight sum. Anything further from 1.0 is rejected, never rescaled.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	parse(&raw).map_err(|err| match err {
		Error::ParseConfig { source, .. } => Error::ParseConfig { path: path.to_path_buf(), source },
		other => other,
	})
}

pub fn parse(raw: &str) -> Result<Config> {
	let mut cfg: Config = toml::from_str(raw)
		.map_err(|err| Error::ParseConfig { path: Default::default(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	validate_ranking(&cfg.ranking)?;
	validate_personalization(&cfg.personalization)?;

	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions != cfg.storage.qdrant.vector_dim {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must match storage.qdrant.vector_dim."
				.to_string(),
		});
	}
	if cfg.providers.embedding.api_key.trim().is_empty() {
		return Err(Error::Validation {
			message: "Provider embedding api_key must be non-empty.".to_string(),
		});
	}

	let llm_in_use =
		cfg.search.expansion.enabled || cfg.search.rerank.enabled || cfg.search.explain.enabled;

	if llm_in_use && cfg.providers.llm.api_key.trim().is_empty() {
		return Err(Error::Validation {
			message: "Provider llm api_key must be non-empty when expansion, rerank, or explain is enabled."
				.to_string(),
		});
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.search.top_k == 0 {
		return Err(Error::Validation {
			message: "search.top_k must be greater than zero.".to_string(),
		});
	}
	if cfg.search.candidate_k < cfg.search.top_k {
		return Err(Error::Validation {
			message: "search.candidate_k must be greater than or equal to search.top_k.".to_string(),
		});
	}

	for (label, value) in [
		("search.metrics_timeout_ms", cfg.search.metrics_timeout_ms),
		("search.expansion.timeout_ms", cfg.search.expansion.timeout_ms),
		("search.rerank.timeout_ms", cfg.search.rerank.timeout_ms),
		("search.explain.timeout_ms", cfg.search.explain.timeout_ms),
		("personalization.timeout_ms", cfg.personalization.timeout_ms),
		("providers.embedding.timeout_ms", cfg.providers.embedding.timeout_ms),
		("providers.llm.timeout_ms", cfg.providers.llm.timeout_ms),
	] {
		if value == 0 {
			return Err(Error::Validation { message: format!("{label} must be greater than zero.") });
		}
	}

	if cfg.search.rerank.enabled && cfg.search.rerank.top_k == 0 {
		return Err(Error::Validation {
			message: "search.rerank.top_k must be greater than zero when enabled.".to_string(),
		});
	}

	validate_ingest(&cfg.ingest)?;
	validate_analytics(&cfg.analytics)?;

	Ok(())
}

pub fn validate_ranking(ranking: &Ranking) -> Result<()> {
	for (label, value) in [
		("ranking.semantic_weight", ranking.semantic_weight),
		("ranking.behavior_weight", ranking.behavior_weight),
		("ranking.personalization_weight", ranking.personalization_weight),
		("ranking.ctr_weight", ranking.ctr_weight),
		("ranking.conversion_weight", ranking.conversion_weight),
		("ranking.bounce_penalty", ranking.bounce_penalty),
	] {
		if !value.is_finite() {
			return Err(Error::Validation { message: format!("{label} must be a finite number.") });
		}
		if value < 0.0 {
			return Err(Error::Validation { message: format!("{label} must be zero or greater.") });
		}
	}

	let sum = ranking.semantic_weight + ranking.behavior_weight + ranking.personalization_weight;

	if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
		return Err(Error::Validation {
			message: format!(
				"ranking.semantic_weight + ranking.behavior_weight + ranking.personalization_weight must equal 1.0, got {sum}."
			),
		});
	}
	if ranking.decay.enabled && !(ranking.decay.tau_days.is_finite() && ranking.decay.tau_days > 0.0)
	{
		return Err(Error::Validation {
			message: "ranking.decay.tau_days must be a finite number greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_personalization(personalization: &Personalization) -> Result<()> {
	for (label, value) in [
		("personalization.affinity_weight", personalization.affinity_weight),
		("personalization.recency_weight", personalization.recency_weight),
	] {
		if !value.is_finite() || value < 0.0 {
			return Err(Error::Validation {
				message: format!("{label} must be a finite number zero or greater."),
			});
		}
	}

	if !(personalization.recency_decay_positions.is_finite()
		&& personalization.recency_decay_positions > 0.0)
	{
		return Err(Error::Validation {
			message: "personalization.recency_decay_positions must be greater than zero."
				.to_string(),
		});
	}
	if personalization.max_recent_items == 0 {
		return Err(Error::Validation {
			message: "personalization.max_recent_items must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_ingest(ingest: &Ingest) -> Result<()> {
	for (label, value) in [
		("ingest.queue_capacity", ingest.queue_capacity),
		("ingest.workers", ingest.workers),
		("ingest.max_attempts", ingest.max_attempts),
	] {
		if value == 0 {
			return Err(Error::Validation { message: format!("{label} must be greater than zero.") });
		}
	}

	if ingest.base_backoff_ms == 0 {
		return Err(Error::Validation {
			message: "ingest.base_backoff_ms must be greater than zero.".to_string(),
		});
	}
	if ingest.base_backoff_ms > ingest.max_backoff_ms {
		return Err(Error::Validation {
			message: "ingest.base_backoff_ms must be less than or equal to ingest.max_backoff_ms."
				.to_string(),
		});
	}

	Ok(())
}

fn validate_analytics(analytics: &Analytics) -> Result<()> {
	for (label, value) in [
		("analytics.low_ctr_threshold", analytics.low_ctr_threshold),
		("analytics.low_conversion_threshold", analytics.low_conversion_threshold),
	] {
		if !(0.0..=1.0).contains(&value) {
			return Err(Error::Validation {
				message: format!("{label} must be in the range 0.0-1.0."),
			});
		}
	}

	if analytics.low_conversion_min_searches == 0 {
		return Err(Error::Validation {
			message: "analytics.low_conversion_min_searches must be greater than zero.".to_string(),
		});
	}
	if analytics.top_limit == 0 {
		return Err(Error::Validation {
			message: "analytics.top_limit must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	let level = cfg.service.log_level.trim().to_ascii_lowercase();

	cfg.service.log_level = if level.is_empty() { "info".to_string() } else { level };

	let embedding = &mut cfg.providers.embedding;
	let llm = &mut cfg.providers.llm;

	for api_base in [&mut embedding.api_base, &mut llm.api_base] {
		*api_base = api_base.trim().trim_end_matches('/').to_string();
	}
	for value in [
		&mut embedding.provider_id,
		&mut embedding.api_key,
		&mut embedding.path,
		&mut embedding.model,
		&mut llm.provider_id,
		&mut llm.api_key,
		&mut llm.path,
		&mut llm.model,
		&mut cfg.storage.postgres.dsn,
		&mut cfg.storage.qdrant.url,
		&mut cfg.storage.qdrant.collection,
	] {
		*value = value.trim().to_string();
	}
}
