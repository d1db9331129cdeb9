use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{BehaviorEvent, Error, EventType, Result};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
	SearchesSeen,
	Clicks,
	Carts,
	Purchases,
	Bounces,
	DwellMs,
}
impl CounterField {
	pub const ALL: [Self; 6] =
		[Self::SearchesSeen, Self::Clicks, Self::Carts, Self::Purchases, Self::Bounces, Self::DwellMs];

	/// Column backing the counter in `item_behavior_metrics`.
	pub fn column(self) -> &'static str {
		match self {
			Self::SearchesSeen => "total_searches_seen",
			Self::Clicks => "total_clicks",
			Self::Carts => "total_carts",
			Self::Purchases => "total_purchases",
			Self::Bounces => "total_bounces",
			Self::DwellMs => "total_dwell_ms",
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Increment {
	pub field: CounterField,
	pub delta: u64,
}
impl Increment {
	pub fn one(field: CounterField) -> Self {
		Self { field, delta: 1 }
	}
}

/// Counter increments an event contributes to its item's record.
///
/// Query-level searches (no item) contribute nothing. A search that names an item is an
/// impression of that item.
pub fn increments_for(event: &BehaviorEvent) -> Vec<Increment> {
	if event.item_id.is_none() {
		return Vec::new();
	}

	let mut increments = match event.event_type {
		EventType::Search => vec![Increment::one(CounterField::SearchesSeen)],
		EventType::Click => vec![Increment::one(CounterField::Clicks)],
		EventType::AddToCart => vec![Increment::one(CounterField::Carts)],
		EventType::Purchase => vec![Increment::one(CounterField::Purchases)],
		EventType::Bounce => vec![Increment::one(CounterField::Bounces)],
	};

	if let Some(dwell_ms) = event.dwell_ms().filter(|dwell_ms| *dwell_ms > 0) {
		increments.push(Increment { field: CounterField::DwellMs, delta: dwell_ms });
	}

	increments
}

/// Aggregated behavioral counters for one catalog item.
///
/// Counters only grow. Every update is a pure addition plus a max over event timestamps, so the
/// final state does not depend on the order events are applied in.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct BehaviorRecord {
	pub item_id: String,
	pub total_searches_seen: u64,
	pub total_clicks: u64,
	pub total_carts: u64,
	pub total_purchases: u64,
	pub total_bounces: u64,
	pub total_dwell_ms: u64,
	#[serde(default, with = "crate::time_serde::option")]
	pub last_updated: Option<OffsetDateTime>,
}
impl BehaviorRecord {
	/// The zero-valued record returned for items with no observations.
	pub fn cold(item_id: impl Into<String>) -> Self {
		Self {
			item_id: item_id.into(),
			total_searches_seen: 0,
			total_clicks: 0,
			total_carts: 0,
			total_purchases: 0,
			total_bounces: 0,
			total_dwell_ms: 0,
			last_updated: None,
		}
	}

	pub fn is_cold(&self) -> bool {
		CounterField::ALL.iter().all(|field| self.counter(*field) == 0)
	}

	pub fn counter(&self, field: CounterField) -> u64 {
		match field {
			CounterField::SearchesSeen => self.total_searches_seen,
			CounterField::Clicks => self.total_clicks,
			CounterField::Carts => self.total_carts,
			CounterField::Purchases => self.total_purchases,
			CounterField::Bounces => self.total_bounces,
			CounterField::DwellMs => self.total_dwell_ms,
		}
	}

	pub fn increment(&mut self, field: CounterField, delta: u64) {
		let counter = match field {
			CounterField::SearchesSeen => &mut self.total_searches_seen,
			CounterField::Clicks => &mut self.total_clicks,
			CounterField::Carts => &mut self.total_carts,
			CounterField::Purchases => &mut self.total_purchases,
			CounterField::Bounces => &mut self.total_bounces,
			CounterField::DwellMs => &mut self.total_dwell_ms,
		};

		*counter = counter.saturating_add(delta);
	}

	pub fn touch(&mut self, at: OffsetDateTime) {
		self.last_updated = Some(self.last_updated.map_or(at, |current| current.max(at)));
	}

	pub fn apply(&mut self, increments: &[Increment], at: OffsetDateTime) {
		for increment in increments {
			self.increment(increment.field, increment.delta);
		}

		self.touch(at);
	}

	/// Applies one event to this record. The caller owns idempotency.
	pub fn apply_event(&mut self, event: &BehaviorEvent) -> Result<()> {
		match event.item_id.as_deref() {
			Some(item_id) if item_id == self.item_id => {},
			other => {
				return Err(Error::InvalidRecord {
					item_id: self.item_id.clone(),
					message: format!("Event {} targets item {other:?}.", event.event_id),
				});
			},
		}

		self.apply(&increments_for(event), event.timestamp);

		Ok(())
	}

	pub fn ctr(&self) -> f64 {
		rate(self.total_clicks, self.total_searches_seen)
	}

	pub fn conversion_rate(&self) -> f64 {
		rate(self.total_purchases, self.total_clicks)
	}

	pub fn bounce_rate(&self) -> f64 {
		rate(self.total_bounces, self.total_clicks)
	}

	/// Total dwell time in seconds.
	pub fn total_dwell_time(&self) -> f64 {
		self.total_dwell_ms as f64 / 1_000.0
	}

	/// Mean dwell time per click, in seconds.
	pub fn avg_dwell_time(&self) -> f64 {
		self.total_dwell_time() / self.total_clicks.max(1) as f64
	}
}

fn rate(numerator: u64, denominator: u64) -> f64 {
	(numerator as f64 / denominator.max(1) as f64).clamp(0.0, 1.0)
}
