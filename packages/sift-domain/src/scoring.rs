use serde::Serialize;
use time::OffsetDateTime;

use sift_config::{Ranking, RankingDecay};

use crate::BehaviorRecord;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Blend and sub-weights used by the scorer. Built from an already validated `[ranking]` section.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Weights {
	pub semantic: f64,
	pub behavior: f64,
	pub personalization: f64,
	pub ctr: f64,
	pub conversion: f64,
	pub bounce_penalty: f64,
}
impl Weights {
	/// Validates the blend before building weights. Use this for weights that did not come
	/// through `sift_config::load`.
	pub fn checked(ranking: &Ranking) -> sift_config::Result<Self> {
		sift_config::validate_ranking(ranking)?;

		Ok(Self::from(ranking))
	}
}
impl Default for Weights {
	fn default() -> Self {
		Self::from(&Ranking::default())
	}
}
impl From<&Ranking> for Weights {
	fn from(ranking: &Ranking) -> Self {
		Self {
			semantic: ranking.semantic_weight,
			behavior: ranking.behavior_weight,
			personalization: ranking.personalization_weight,
			ctr: ranking.ctr_weight,
			conversion: ranking.conversion_weight,
			bounce_penalty: ranking.bounce_penalty,
		}
	}
}

/// Per-call inputs that sit outside the item's behavioral record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreAdjustments {
	/// User-specific preference in `[0, 1]`. Zero without usable history.
	pub personalization_score: f64,
	/// Staleness multiplier in `(0, 1]` applied to the behavior score.
	pub freshness: f64,
}
impl Default for ScoreAdjustments {
	fn default() -> Self {
		Self { personalization_score: 0.0, freshness: 1.0 }
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScoreBreakdown {
	pub semantic_score: f64,
	pub behavior_score: f64,
	pub personalization_score: f64,
	pub ctr: f64,
	pub conversion_rate: f64,
	pub bounce_rate: f64,
	pub freshness: f64,
	pub final_score: f64,
}

pub fn behavior_score(record: &BehaviorRecord, weights: &Weights) -> f64 {
	let raw = weights.ctr * record.ctr() + weights.conversion * record.conversion_rate()
		- weights.bounce_penalty * record.bounce_rate();

	raw.clamp(0.0, 1.0)
}

pub fn score(semantic_score: f64, record: &BehaviorRecord, weights: &Weights) -> ScoreBreakdown {
	score_with(semantic_score, record, weights, ScoreAdjustments::default())
}

pub fn score_with(
	semantic_score: f64,
	record: &BehaviorRecord,
	weights: &Weights,
	adjustments: ScoreAdjustments,
) -> ScoreBreakdown {
	let semantic_score = semantic_score.clamp(0.0, 1.0);
	let freshness = adjustments.freshness.clamp(0.0, 1.0);
	let personalization_score = adjustments.personalization_score.clamp(0.0, 1.0);
	let behavior_score = behavior_score(record, weights) * freshness;
	let final_score = weights.semantic * semantic_score
		+ weights.behavior * behavior_score
		+ weights.personalization * personalization_score;

	ScoreBreakdown {
		semantic_score,
		behavior_score,
		personalization_score,
		ctr: record.ctr(),
		conversion_rate: record.conversion_rate(),
		bounce_rate: record.bounce_rate(),
		freshness,
		final_score,
	}
}

/// Staleness multiplier `exp(-age_days / tau_days)`, or 1.0 when decay is off or the record has
/// never been updated.
pub fn freshness(record: &BehaviorRecord, now: OffsetDateTime, decay: &RankingDecay) -> f64 {
	if !decay.enabled || decay.tau_days <= 0.0 {
		return 1.0;
	}

	let Some(last_updated) = record.last_updated else {
		return 1.0;
	};
	let age_days = ((now - last_updated).as_seconds_f64() / SECONDS_PER_DAY).max(0.0);

	(-age_days / decay.tau_days).exp()
}
