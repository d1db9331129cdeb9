use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::warn;

use sift_config::Personalization;
use sift_domain::UserProfile;
use sift_storage::ProfileStore;

use crate::Candidate;

/// Resolves per-item preference scores from a user's interaction history.
#[derive(Clone)]
pub struct Personalizer {
	profiles: Arc<dyn ProfileStore>,
	cfg: Personalization,
}
impl Personalizer {
	pub fn new(profiles: Arc<dyn ProfileStore>, cfg: Personalization) -> Self {
		Self { profiles, cfg }
	}

	/// Loads the profile under the personalization timeout. Failures read as no profile.
	pub async fn profile(&self, user_id: &str) -> Option<UserProfile> {
		let timeout = Duration::from_millis(self.cfg.timeout_ms);

		match tokio::time::timeout(timeout, self.profiles.get(user_id)).await {
			Ok(Ok(profile)) => profile,
			Ok(Err(err)) => {
				warn!(user_id, error = %err, "Profile read failed. Skipping personalization.");

				None
			},
			Err(_) => {
				warn!(
					user_id,
					timeout_ms = self.cfg.timeout_ms,
					"Profile read timed out. Skipping personalization."
				);

				None
			},
		}
	}

	/// Preference scores for `candidates`. Empty when personalization is off, the user is
	/// anonymous, or the history is too thin.
	pub async fn scores(
		&self,
		user_id: Option<&str>,
		candidates: &[Candidate],
	) -> HashMap<String, f64> {
		if !self.cfg.enabled {
			return HashMap::new();
		}

		let Some(user_id) = user_id.map(str::trim).filter(|user_id| !user_id.is_empty()) else {
			return HashMap::new();
		};
		let Some(profile) = self.profile(user_id).await else {
			return HashMap::new();
		};

		score_candidates(&profile, candidates, &self.cfg)
	}
}

pub fn score_candidates(
	profile: &UserProfile,
	candidates: &[Candidate],
	cfg: &Personalization,
) -> HashMap<String, f64> {
	if !profile.has_sufficient_history(cfg.min_interactions) {
		return HashMap::new();
	}

	candidates
		.iter()
		.map(|candidate| {
			(candidate.item_id.clone(), profile.preference_score(&candidate.item_id, cfg))
		})
		.filter(|(_, score)| *score > 0.0)
		.collect()
}
