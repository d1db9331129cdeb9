use sqlx::PgExecutor;
use time::OffsetDateTime;
use uuid::Uuid;

use sift_domain::BehaviorEvent;

use crate::{Result, db::Db, models::EventOutboxEntry};

pub async fn enqueue_event<'e, E>(executor: E, event: &BehaviorEvent, now: OffsetDateTime) -> Result<()>
where
	E: PgExecutor<'e>,
{
	let payload = serde_json::to_value(event)?;

	sqlx::query(
		"\
INSERT INTO event_outbox (outbox_id, event_id, event, status, available_at, created_at, updated_at)
VALUES ($1,$2,$3,'PENDING',$4,$4,$4)",
	)
	.bind(Uuid::new_v4())
	.bind(event.event_id)
	.bind(payload)
	.bind(now)
	.execute(executor)
	.await?;

	Ok(())
}

/// Leases the oldest available job. A claimed job whose lease lapses becomes claimable again.
pub async fn claim_next_event_outbox_job(
	db: &Db,
	now: OffsetDateTime,
	lease_seconds: i64,
) -> Result<Option<EventOutboxEntry>> {
	let mut tx = db.pool.begin().await?;
	let row = sqlx::query_as::<_, EventOutboxEntry>(
		"\
SELECT
\toutbox_id,
\tevent_id,
\tevent,
\tstatus,
\tattempts,
\tlast_error,
\tavailable_at,
\tcreated_at,
\tupdated_at
FROM event_outbox
WHERE status IN ('PENDING','FAILED','CLAIMED') AND available_at <= $1
ORDER BY available_at ASC
LIMIT 1
FOR UPDATE SKIP LOCKED",
	)
	.bind(now)
	.fetch_optional(&mut *tx)
	.await?;
	let job = if let Some(mut job) = row {
		let lease_until = now + time::Duration::seconds(lease_seconds);

		sqlx::query(
			"UPDATE event_outbox SET status = 'CLAIMED', available_at = $1, updated_at = $2 WHERE outbox_id = $3",
		)
		.bind(lease_until)
		.bind(now)
		.bind(job.outbox_id)
		.execute(&mut *tx)
		.await?;

		job.status = "CLAIMED".to_string();
		job.available_at = lease_until;
		job.updated_at = now;

		Some(job)
	} else {
		None
	};

	tx.commit().await?;

	Ok(job)
}

pub async fn mark_event_outbox_done(db: &Db, outbox_id: Uuid, now: OffsetDateTime) -> Result<()> {
	sqlx::query("UPDATE event_outbox SET status = 'DONE', updated_at = $1 WHERE outbox_id = $2")
		.bind(now)
		.bind(outbox_id)
		.execute(&db.pool)
		.await?;

	Ok(())
}

pub async fn mark_event_outbox_failed(
	db: &Db,
	outbox_id: Uuid,
	attempts: i32,
	error_text: &str,
	available_at: OffsetDateTime,
	now: OffsetDateTime,
) -> Result<()> {
	sqlx::query(
		"\
UPDATE event_outbox
SET status = 'FAILED',
\tattempts = $1,
\tlast_error = $2,
\tavailable_at = $3,
\tupdated_at = $4
WHERE outbox_id = $5",
	)
	.bind(attempts)
	.bind(error_text)
	.bind(available_at)
	.bind(now)
	.bind(outbox_id)
	.execute(&db.pool)
	.await?;

	Ok(())
}

pub async fn mark_event_outbox_dead(
	db: &Db,
	outbox_id: Uuid,
	attempts: i32,
	error_text: &str,
	now: OffsetDateTime,
) -> Result<()> {
	sqlx::query(
		"\
UPDATE event_outbox
SET status = 'DEAD',
\tattempts = $1,
\tlast_error = $2,
\tupdated_at = $3
WHERE outbox_id = $4",
	)
	.bind(attempts)
	.bind(error_text)
	.bind(now)
	.bind(outbox_id)
	.execute(&db.pool)
	.await?;

	Ok(())
}

/// Number of jobs not yet done or dead.
pub async fn count_open_jobs(db: &Db) -> Result<i64> {
	let count: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM event_outbox WHERE status IN ('PENDING','FAILED','CLAIMED')",
	)
	.fetch_one(&db.pool)
	.await?;

	Ok(count)
}
