use std::collections::HashMap;

use sqlx::PgConnection;
use time::OffsetDateTime;

use sift_domain::{
	BehaviorEvent, BehaviorRecord, CounterField, Increment, TimeRange, UserProfile,
	record::increments_for,
};

use crate::{
	ApplyOutcome, BoxFuture, DeadLetter, DeadLetterSink, Error, EventLog, EventSpill, MetricsStore,
	ProfileStore, Result,
	db::Db,
	models::{BehaviorEventRow, DeadLetterRow, ItemMetricsRow},
	outbox,
};

const METRICS_COLUMNS: &str = "\
item_id,
\ttotal_searches_seen,
\ttotal_clicks,
\ttotal_carts,
\ttotal_purchases,
\ttotal_bounces,
\ttotal_dwell_ms,
\tlast_updated";

/// Postgres metrics store. Row-level locks from the upsert serialize concurrent updates to one
/// item.
#[derive(Clone)]
pub struct PgMetricsStore {
	db: Db,
}
impl PgMetricsStore {
	pub fn new(db: Db) -> Self {
		Self { db }
	}
}
impl MetricsStore for PgMetricsStore {
	fn get<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<BehaviorRecord>> {
		Box::pin(async move {
			let sql = format!("SELECT {METRICS_COLUMNS} FROM item_behavior_metrics WHERE item_id = $1");
			let row = sqlx::query_as::<_, ItemMetricsRow>(&sql)
				.bind(item_id)
				.fetch_optional(&self.db.pool)
				.await?;

			match row {
				Some(row) => BehaviorRecord::try_from(row),
				None => Ok(BehaviorRecord::cold(item_id)),
			}
		})
	}

	fn get_many<'a>(
		&'a self,
		item_ids: &'a [String],
	) -> BoxFuture<'a, Result<HashMap<String, BehaviorRecord>>> {
		Box::pin(async move {
			let sql =
				format!("SELECT {METRICS_COLUMNS} FROM item_behavior_metrics WHERE item_id = ANY($1)");
			let rows = sqlx::query_as::<_, ItemMetricsRow>(&sql)
				.bind(item_ids)
				.fetch_all(&self.db.pool)
				.await?;
			let mut records = HashMap::with_capacity(item_ids.len());

			for row in rows {
				let record = BehaviorRecord::try_from(row)?;

				records.insert(record.item_id.clone(), record);
			}
			for item_id in item_ids {
				records
					.entry(item_id.clone())
					.or_insert_with(|| BehaviorRecord::cold(item_id.as_str()));
			}

			Ok(records)
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
			let mut conn = self.db.pool.acquire().await?;

			upsert_increments(&mut *conn, item_id, &[Increment { field, delta }], at).await
		})
	}

	fn apply_event<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<ApplyOutcome>> {
		Box::pin(async move {
			let mut tx = self.db.pool.begin().await?;
			let claimed = sqlx::query(
				"\
INSERT INTO applied_events (event_id, item_id)
VALUES ($1, $2)
ON CONFLICT (event_id) DO NOTHING",
			)
			.bind(event.event_id)
			.bind(event.item_id.as_deref())
			.execute(&mut *tx)
			.await?
			.rows_affected();

			if claimed == 0 {
				tx.rollback().await?;

				return Ok(ApplyOutcome::Duplicate);
			}
			if let Some(item_id) = event.item_id.as_deref() {
				upsert_increments(&mut *tx, item_id, &increments_for(event), event.timestamp).await?;
			}

			tx.commit().await?;

			Ok(ApplyOutcome::Applied)
		})
	}
}

async fn upsert_increments(
	conn: &mut PgConnection,
	item_id: &str,
	increments: &[Increment],
	at: OffsetDateTime,
) -> Result<()> {
	let mut deltas = [0_i64; CounterField::ALL.len()];

	for increment in increments {
		let index = increment.field as usize;
		let delta = i64::try_from(increment.delta).map_err(|_| {
			Error::InvalidArgument(format!(
				"Increment of {} for item {item_id:?} is out of range.",
				increment.field.column()
			))
		})?;

		deltas[index] = deltas[index].saturating_add(delta);
	}

	sqlx::query(
		"\
INSERT INTO item_behavior_metrics (
	item_id,
	total_searches_seen,
	total_clicks,
	total_carts,
	total_purchases,
	total_bounces,
	total_dwell_ms,
	last_updated
)
VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
ON CONFLICT (item_id) DO UPDATE
SET total_searches_seen = item_behavior_metrics.total_searches_seen + EXCLUDED.total_searches_seen,
	total_clicks = item_behavior_metrics.total_clicks + EXCLUDED.total_clicks,
	total_carts = item_behavior_metrics.total_carts + EXCLUDED.total_carts,
	total_purchases = item_behavior_metrics.total_purchases + EXCLUDED.total_purchases,
	total_bounces = item_behavior_metrics.total_bounces + EXCLUDED.total_bounces,
	total_dwell_ms = item_behavior_metrics.total_dwell_ms + EXCLUDED.total_dwell_ms,
	last_updated = GREATEST(item_behavior_metrics.last_updated, EXCLUDED.last_updated)",
	)
	.bind(item_id)
	.bind(deltas[0])
	.bind(deltas[1])
	.bind(deltas[2])
	.bind(deltas[3])
	.bind(deltas[4])
	.bind(deltas[5])
	.bind(at)
	.execute(conn)
	.await?;

	Ok(())
}

#[derive(Clone)]
pub struct PgEventLog {
	db: Db,
}
impl PgEventLog {
	pub fn new(db: Db) -> Self {
		Self { db }
	}
}
impl EventLog for PgEventLog {
	fn append<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			let inserted = sqlx::query(
				"\
INSERT INTO behavior_events (
	event_id,
	event_type,
	item_id,
	query,
	session_id,
	user_id,
	ts,
	dwell_time
)
VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
ON CONFLICT (event_id) DO NOTHING",
			)
			.bind(event.event_id)
			.bind(event.event_type.as_str())
			.bind(event.item_id.as_deref())
			.bind(event.query.as_deref())
			.bind(event.session_id.as_str())
			.bind(event.user_id.as_deref())
			.bind(event.timestamp)
			.bind(event.dwell_time)
			.execute(&self.db.pool)
			.await?
			.rows_affected();

			Ok(inserted > 0)
		})
	}

	fn list<'a>(&'a self, range: TimeRange) -> BoxFuture<'a, Result<Vec<BehaviorEvent>>> {
		Box::pin(async move {
			let rows = sqlx::query_as::<_, BehaviorEventRow>(
				"\
SELECT
\tevent_id,
\tevent_type,
\titem_id,
\tquery,
\tsession_id,
\tuser_id,
\tts,
\tdwell_time
FROM behavior_events
WHERE ts >= $1 AND ts < $2
ORDER BY ts ASC, event_id ASC",
			)
			.bind(range.start)
			.bind(range.end)
			.fetch_all(&self.db.pool)
			.await?;

			rows.into_iter().map(BehaviorEvent::try_from).collect()
		})
	}
}

#[derive(Clone)]
pub struct PgDeadLetters {
	db: Db,
}
impl PgDeadLetters {
	pub fn new(db: Db) -> Self {
		Self { db }
	}
}
impl DeadLetterSink for PgDeadLetters {
	fn record<'a>(&'a self, dead_letter: &'a DeadLetter) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let payload = serde_json::to_value(&dead_letter.event)?;

			sqlx::query(
				"\
INSERT INTO event_dead_letters (dead_letter_id, event_id, event, attempts, last_error, failed_at)
VALUES ($1,$2,$3,$4,$5,$6)",
			)
			.bind(dead_letter.dead_letter_id)
			.bind(dead_letter.event.event_id)
			.bind(payload)
			.bind(i32::try_from(dead_letter.attempts).unwrap_or(i32::MAX))
			.bind(dead_letter.last_error.as_str())
			.bind(dead_letter.failed_at)
			.execute(&self.db.pool)
			.await?;

			Ok(())
		})
	}

	fn list<'a>(&'a self, limit: usize) -> BoxFuture<'a, Result<Vec<DeadLetter>>> {
		Box::pin(async move {
			let rows = sqlx::query_as::<_, DeadLetterRow>(
				"\
SELECT dead_letter_id, event_id, event, attempts, last_error, failed_at
FROM event_dead_letters
ORDER BY failed_at DESC
LIMIT $1",
			)
			.bind(i64::try_from(limit).unwrap_or(i64::MAX))
			.fetch_all(&self.db.pool)
			.await?;

			rows.into_iter().map(DeadLetter::try_from).collect()
		})
	}
}

#[derive(Clone)]
pub struct PgProfileStore {
	db: Db,
}
impl PgProfileStore {
	pub fn new(db: Db) -> Self {
		Self { db }
	}
}
impl ProfileStore for PgProfileStore {
	fn get<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Option<UserProfile>>> {
		Box::pin(async move {
			let payload: Option<serde_json::Value> =
				sqlx::query_scalar("SELECT profile FROM user_profiles WHERE user_id = $1")
					.bind(user_id)
					.fetch_optional(&self.db.pool)
					.await?;

			payload.map(|payload| serde_json::from_value(payload).map_err(Error::from)).transpose()
		})
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
			let mut tx = self.db.pool.begin().await?;
			let empty = serde_json::to_value(UserProfile::new(user_id))?;

			sqlx::query(
				"\
INSERT INTO user_profiles (user_id, profile, updated_at)
VALUES ($1,$2,$3)
ON CONFLICT (user_id) DO NOTHING",
			)
			.bind(user_id)
			.bind(empty)
			.bind(event.timestamp)
			.execute(&mut *tx)
			.await?;

			let payload: serde_json::Value =
				sqlx::query_scalar("SELECT profile FROM user_profiles WHERE user_id = $1 FOR UPDATE")
					.bind(user_id)
					.fetch_one(&mut *tx)
					.await?;
			let mut profile: UserProfile = serde_json::from_value(payload)?;

			profile.apply_event(event, max_recent_items);

			sqlx::query("UPDATE user_profiles SET profile = $1, updated_at = $2 WHERE user_id = $3")
				.bind(serde_json::to_value(&profile)?)
				.bind(OffsetDateTime::now_utc())
				.bind(user_id)
				.execute(&mut *tx)
				.await?;

			tx.commit().await?;

			Ok(())
		})
	}
}

/// Spills events into `event_outbox`, drained by the worker binary.
#[derive(Clone)]
pub struct PgEventOutbox {
	db: Db,
}
impl PgEventOutbox {
	pub fn new(db: Db) -> Self {
		Self { db }
	}
}
impl EventSpill for PgEventOutbox {
	fn spill<'a>(&'a self, event: &'a BehaviorEvent) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			outbox::enqueue_event(&self.db.pool, event, OffsetDateTime::now_utc()).await
		})
	}
}
