use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use sift_domain::{BehaviorEvent, BehaviorRecord, CounterField, TimeRange, UserProfile};

use crate::{BoxFuture, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
	Applied,
	/// The `event_id` was applied before; nothing changed.
	Duplicate,
}

/// An event whose application was abandoned, kept for inspection and manual replay.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeadLetter {
	pub dead_letter_id: Uuid,
	pub event: BehaviorEvent,
	pub attempts: u32,
	pub last_error: String,
	#[serde(with = "sift_domain::time_serde")]
	pub failed_at: OffsetDateTime,
}
impl DeadLetter {
	pub fn new(
		event: BehaviorEvent,
		attempts: u32,
		last_error: impl Into<String>,
		failed_at: OffsetDateTime,
	) -> Self {
		Self { dead_letter_id: Uuid::new_v4(), event, attempts, last_error: last_error.into(), failed_at }
	}
}

/// Item id to behavioral counters.
///
/// All mutation goes through `increment` and `apply_event`. Updates to one item are linearizable;
/// updates to different items do not contend.
pub trait MetricsStore
where
	Self: Send + Sync,
{
	/// Returns the zero-valued record for unseen items.
	fn get<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<BehaviorRecord>>;

	/// Records for every requested id, cold records included.
	fn get_many<'a>(
		&'a self,
		item_ids: &'a [String],
	) -> BoxFuture<'a, Result<HashMap<String, BehaviorRecord>>>;

	fn increment<'a>(
		&'a self,
		item_id: &'a str,
		field: CounterField,
		delta: u64,
		at: OffsetDateTime,
	) -> BoxFuture<'a, Result<()>>;

	/// Applies an event at most once per `event_id`.
	fn apply_event<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<ApplyOutcome>>;
}

/// Raw event history read by analytics.
pub trait EventLog
where
	Self: Send + Sync,
{
	/// Returns `false` when an event with the same id is already stored.
	fn append<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<bool>>;

	/// Events inside `range`, ordered by timestamp then event id.
	fn list<'a>(&'a self, range: TimeRange) -> BoxFuture<'a, Result<Vec<BehaviorEvent>>>;
}

pub trait DeadLetterSink
where
	Self: Send + Sync,
{
	fn record<'a>(&'a self, dead_letter: &'a DeadLetter) -> BoxFuture<'a, Result<()>>;

	/// Most recent first.
	fn list<'a>(&'a self, limit: usize) -> BoxFuture<'a, Result<Vec<DeadLetter>>>;
}

pub trait ProfileStore
where
	Self: Send + Sync,
{
	fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<UserProfile>>>;

	/// No-op for events without a `user_id`.
	fn apply_event<'a>(
		&'a self,
		event: &'a BehaviorEvent,
		max_recent_items: usize,
	) -> BoxFuture<'a, Result<()>>;
}

/// Durable overflow for events the in-memory queue could not take.
pub trait EventSpill
where
	Self: Send + Sync,
{
	fn spill<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<()>>;
}
