use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use sift_config::Personalization;

use crate::{BehaviorEvent, EventType};

/// Behavioral history for one user. Holds interaction counts only, no personal data.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct UserProfile {
	pub user_id: String,
	pub total_searches: u64,
	pub total_clicks: u64,
	pub total_carts: u64,
	pub total_purchases: u64,
	/// Most recent first.
	pub recent_item_ids: Vec<String>,
	pub item_interactions: BTreeMap<String, u64>,
	#[serde(default, with = "crate::time_serde::option")]
	pub last_updated: Option<OffsetDateTime>,
}
impl UserProfile {
	pub fn new(user_id: impl Into<String>) -> Self {
		Self { user_id: user_id.into(), ..Default::default() }
	}

	pub fn total_interactions(&self) -> u64 {
		self.total_clicks.saturating_add(self.total_carts).saturating_add(self.total_purchases)
	}

	pub fn has_sufficient_history(&self, min_interactions: u32) -> bool {
		self.total_interactions() >= u64::from(min_interactions)
	}

	/// Folds one event into the profile. Impressions and bounces do not count as interactions.
	pub fn apply_event(&mut self, event: &BehaviorEvent, max_recent_items: usize) {
		match (event.event_type, event.item_id.as_deref()) {
			(EventType::Search, None) => self.total_searches = self.total_searches.saturating_add(1),
			(EventType::Click, Some(item_id)) => {
				self.total_clicks = self.total_clicks.saturating_add(1);
				self.record_interaction(item_id, max_recent_items);
			},
			(EventType::AddToCart, Some(item_id)) => {
				self.total_carts = self.total_carts.saturating_add(1);
				self.record_interaction(item_id, max_recent_items);
			},
			(EventType::Purchase, Some(item_id)) => {
				self.total_purchases = self.total_purchases.saturating_add(1);
				self.record_interaction(item_id, max_recent_items);
			},
			_ => return,
		}

		self.last_updated =
			Some(self.last_updated.map_or(event.timestamp, |current| current.max(event.timestamp)));
	}

	/// Preference for `item_id` in `[0, 1]`. Zero while the profile is below `min_interactions`.
	pub fn preference_score(&self, item_id: &str, cfg: &Personalization) -> f64 {
		if !self.has_sufficient_history(cfg.min_interactions) {
			return 0.0;
		}

		let max_interactions = self.item_interactions.values().copied().max().unwrap_or(0).max(1);
		let affinity = self.item_interactions.get(item_id).copied().unwrap_or(0) as f64
			/ max_interactions as f64;
		let recency = self
			.recent_item_ids
			.iter()
			.position(|recent| recent == item_id)
			.map(|position| (-(position as f64) / cfg.recency_decay_positions).exp())
			.unwrap_or(0.0);

		(cfg.affinity_weight * affinity + cfg.recency_weight * recency).clamp(0.0, 1.0)
	}

	fn record_interaction(&mut self, item_id: &str, max_recent_items: usize) {
		let count = self.item_interactions.entry(item_id.to_string()).or_insert(0);

		*count = count.saturating_add(1);

		self.recent_item_ids.retain(|recent| recent != item_id);
		self.recent_item_ids.insert(0, item_id.to_string());
		self.recent_item_ids.truncate(max_recent_items.max(1));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn interact(profile: &mut UserProfile, kind: EventType, item_id: &str) {
		let event = BehaviorEvent::new(kind, "s1").with_item(item_id).with_user("u1");

		profile.apply_event(&event, 100);
	}

	#[test]
	fn cold_profile_scores_zero() {
		let mut profile = UserProfile::new("u1");

		interact(&mut profile, EventType::Click, "a");
		interact(&mut profile, EventType::Click, "a");

		assert_eq!(profile.preference_score("a", &Personalization::default()), 0.0);
	}

	#[test]
	fn most_recent_and_most_frequent_item_scores_one() {
		let mut profile = UserProfile::new("u1");

		interact(&mut profile, EventType::Click, "b");
		interact(&mut profile, EventType::Click, "a");
		interact(&mut profile, EventType::AddToCart, "a");

		let cfg = Personalization::default();

		assert!((profile.preference_score("a", &cfg) - 1.0).abs() < 1e-12);
		assert!(profile.preference_score("b", &cfg) < profile.preference_score("a", &cfg));
		assert_eq!(profile.preference_score("zzz", &cfg), 0.0);
	}

	#[test]
	fn recent_items_are_bounded_and_deduplicated() {
		let mut profile = UserProfile::new("u1");

		for item_id in ["a", "b", "a", "c"] {
			let event = BehaviorEvent::new(EventType::Click, "s1").with_item(item_id);

			profile.apply_event(&event, 2);
		}

		assert_eq!(profile.recent_item_ids, vec!["c".to_string(), "a".to_string()]);
		assert_eq!(profile.item_interactions.get("a"), Some(&2));
	}

	#[test]
	fn impressions_and_bounces_are_not_interactions() {
		let mut profile = UserProfile::new("u1");

		interact(&mut profile, EventType::Search, "a");
		interact(&mut profile, EventType::Bounce, "a");

		assert_eq!(profile.total_interactions(), 0);
		assert_eq!(profile.total_searches, 0);
		assert!(profile.recent_item_ids.is_empty());
	}
}
