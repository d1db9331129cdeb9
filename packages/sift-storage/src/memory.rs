use std::{
	collections::HashMap,
	hash::BuildHasher,
	sync::{Mutex, MutexGuard},
};

use ahash::{AHashMap, AHashSet, RandomState};
use time::OffsetDateTime;
use uuid::Uuid;

use sift_domain::{
	BehaviorEvent, BehaviorRecord, CounterField, TimeRange, UserProfile, record::increments_for,
};

use crate::{
	ApplyOutcome, BoxFuture, DeadLetter, DeadLetterSink, EventLog, EventSpill, MetricsStore,
	ProfileStore, Result,
};

const DEFAULT_SHARDS: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[derive(Default)]
struct MetricsShard {
	records: AHashMap<String, BehaviorRecord>,
	applied: AHashSet<Uuid>,
}
impl MetricsShard {
	fn record_mut(&mut self, item_id: &str) -> &mut BehaviorRecord {
		self.records
			.entry(item_id.to_string())
			.or_insert_with(|| BehaviorRecord::cold(item_id))
	}
}

/// In-process metrics store. Keys are spread over lock-per-shard maps, so one item's updates are
/// serialized while unrelated items proceed in parallel.
pub struct MemoryMetricsStore {
	shards: Box<[Mutex<MetricsShard>]>,
	hasher: RandomState,
}
impl MemoryMetricsStore {
	pub fn new() -> Self {
		Self::with_shards(DEFAULT_SHARDS)
	}

	pub fn with_shards(shards: usize) -> Self {
		let shards = (0..shards.max(1)).map(|_| Mutex::new(MetricsShard::default())).collect();

		Self { shards, hasher: RandomState::new() }
	}

	/// Every stored record, ordered by item id.
	pub fn snapshot(&self) -> Vec<BehaviorRecord> {
		let mut records = self
			.shards
			.iter()
			.flat_map(|shard| lock(shard).records.values().cloned().collect::<Vec<_>>())
			.collect::<Vec<_>>();

		records.sort_by(|a, b| a.item_id.cmp(&b.item_id));

		records
	}

	pub fn applied_events(&self) -> usize {
		self.shards.iter().map(|shard| lock(shard).applied.len()).sum()
	}

	fn shard(&self, key: &str) -> &Mutex<MetricsShard> {
		let index = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;

		&self.shards[index]
	}

	fn read(&self, item_id: &str) -> BehaviorRecord {
		lock(self.shard(item_id))
			.records
			.get(item_id)
			.cloned()
			.unwrap_or_else(|| BehaviorRecord::cold(item_id))
	}

	fn apply(&self, event: &BehaviorEvent) -> ApplyOutcome {
		// Item-less events still claim their id, in a shard picked by the id itself.
		let event_key = event.event_id.to_string();
		let key = event.item_id.as_deref().unwrap_or(event_key.as_str());
		let mut shard = lock(self.shard(key));

		if !shard.applied.insert(event.event_id) {
			return ApplyOutcome::Duplicate;
		}
		if let Some(item_id) = event.item_id.as_deref() {
			shard.record_mut(item_id).apply(&increments_for(event), event.timestamp);
		}

		ApplyOutcome::Applied
	}
}
impl Default for MemoryMetricsStore {
	fn default() -> Self {
		Self::new()
	}
}
impl MetricsStore for MemoryMetricsStore {
	fn get<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<BehaviorRecord>> {
		Box::pin(async move { Ok(self.read(item_id)) })
	}

	fn get_many<'a>(
		&'a self,
		item_ids: &'a [String],
	) -> BoxFuture<'a, Result<HashMap<String, BehaviorRecord>>> {
		Box::pin(async move {
			Ok(item_ids.iter().map(|item_id| (item_id.clone(), self.read(item_id))).collect())
		})
	}

	fn increment<'a>(
		&'a self,
		item_id: &'a str,
		field: CounterField,
		delta: u64,
		at: OffsetDateTime,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let mut shard = lock(self.shard(item_id));
			let record = shard.record_mut(item_id);

			record.increment(field, delta);
			record.touch(at);

			Ok(())
		})
	}

	fn apply_event<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<ApplyOutcome>> {
		Box::pin(async move { Ok(self.apply(event)) })
	}
}

#[derive(Default)]
struct EventLogInner {
	events: Vec<BehaviorEvent>,
	ids: AHashSet<Uuid>,
}

#[derive(Default)]
pub struct MemoryEventLog {
	inner: Mutex<EventLogInner>,
}
impl MemoryEventLog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		lock(&self.inner).events.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
impl EventLog for MemoryEventLog {
	fn append<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			let mut inner = lock(&self.inner);

			if !inner.ids.insert(event.event_id) {
				return Ok(false);
			}

			inner.events.push(event.clone());

			Ok(true)
		})
	}

	fn list<'a>(&'a self, range: TimeRange) -> BoxFuture<'a, Result<Vec<BehaviorEvent>>> {
		Box::pin(async move {
			let mut events = lock(&self.inner)
				.events
				.iter()
				.filter(|event| range.contains(event.timestamp))
				.cloned()
				.collect::<Vec<_>>();

			events.sort_by(|a, b| {
				a.timestamp.cmp(&b.timestamp).then_with(|| a.event_id.cmp(&b.event_id))
			});

			Ok(events)
		})
	}
}

#[derive(Default)]
pub struct MemoryDeadLetters {
	letters: Mutex<Vec<DeadLetter>>,
}
impl MemoryDeadLetters {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		lock(&self.letters).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
impl DeadLetterSink for MemoryDeadLetters {
	fn record<'a>(&'a self, dead_letter: &'a DeadLetter) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			lock(&self.letters).push(dead_letter.clone());

			Ok(())
		})
	}

	fn list<'a>(&'a self, limit: usize) -> BoxFuture<'a, Result<Vec<DeadLetter>>> {
		Box::pin(async move {
			let mut letters = lock(&self.letters).clone();

			letters.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
			letters.truncate(limit);

			Ok(letters)
		})
	}
}

#[derive(Default)]
pub struct MemoryProfileStore {
	profiles: Mutex<AHashMap<String, UserProfile>>,
}
impl MemoryProfileStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds or replaces a profile.
	pub fn insert(&self, profile: UserProfile) {
		lock(&self.profiles).insert(profile.user_id.clone(), profile);
	}
}
impl ProfileStore for MemoryProfileStore {
	fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<UserProfile>>> {
		Box::pin(async move { Ok(lock(&self.profiles).get(user_id).cloned()) })
	}

	fn apply_event<'a>(
		&'a self,
		event: &'a BehaviorEvent,
		max_recent_items: usize,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let Some(user_id) = event.user_id.as_deref() else {
				return Ok(());
			};

			lock(&self.profiles)
				.entry(user_id.to_string())
				.or_insert_with(|| UserProfile::new(user_id))
				.apply_event(event, max_recent_items);

			Ok(())
		})
	}
}

/// Collects spilled events in memory. Stands in for the Postgres outbox where no database is
/// available.
#[derive(Default)]
pub struct MemorySpill {
	events: Mutex<Vec<BehaviorEvent>>,
}
impl MemorySpill {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn drain(&self) -> Vec<BehaviorEvent> {
		std::mem::take(&mut *lock(&self.events))
	}

	pub fn len(&self) -> usize {
		lock(&self.events).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
impl EventSpill for MemorySpill {
	fn spill<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			lock(&self.events).push(event.clone());

			Ok(())
		})
	}
}
