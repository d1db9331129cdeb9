use std::time::Duration as StdDuration;

use color_eyre::Result;
use time::{Duration, OffsetDateTime};
use tokio::time as tokio_time;
use tracing::{error, info, warn};

use sift_config::Ingest;
use sift_service::{
	Stores,
	ingest::{self, backoff_for_attempt, redact_error},
};
use sift_storage::{
	ApplyOutcome, DeadLetter, DeadLetterSink,
	db::Db,
	models::EventOutboxEntry,
	outbox::{
		claim_next_event_outbox_job, mark_event_outbox_dead, mark_event_outbox_done,
		mark_event_outbox_failed,
	},
};

const POLL_INTERVAL_MS: u64 = 500;
const CLAIM_LEASE_SECONDS: i64 = 30;

pub struct WorkerState {
	pub db: Db,
	pub stores: Stores,
	pub ingest: Ingest,
	pub max_recent_items: usize,
}

/// What to do with a job whose attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
	Retry { attempts: i32, available_at: OffsetDateTime },
	Dead { attempts: i32 },
}

/// Why a job attempt failed.
#[derive(Debug)]
pub struct JobFailure {
	pub message: String,
	pub retryable: bool,
}
impl JobFailure {
	fn permanent(message: impl Into<String>) -> Self {
		Self { message: message.into(), retryable: false }
	}
}
impl From<sift_storage::Error> for JobFailure {
	fn from(err: sift_storage::Error) -> Self {
		Self { retryable: err.is_retryable(), message: err.to_string() }
	}
}

pub async fn run_worker(state: WorkerState) -> Result<()> {
	info!(
		max_attempts = state.ingest.max_attempts,
		lease_seconds = CLAIM_LEASE_SECONDS,
		"Event outbox worker started."
	);

	loop {
		match process_event_outbox_once(&state).await {
			Ok(true) => continue,
			Ok(false) => {},
			Err(err) => {
				error!(error = %err, "Event outbox processing failed.");
			},
		}

		tokio_time::sleep(StdDuration::from_millis(POLL_INTERVAL_MS)).await;
	}
}

/// Claims and settles at most one job. Returns whether a job was claimed.
pub async fn process_event_outbox_once(state: &WorkerState) -> Result<bool> {
	let now = OffsetDateTime::now_utc();
	let claimed = claim_next_event_outbox_job(&state.db, now, CLAIM_LEASE_SECONDS).await?;
	let Some(job) = claimed else {
		return Ok(false);
	};

	match handle_job(state, &job).await {
		Ok(outcome) => {
			mark_event_outbox_done(&state.db, job.outbox_id, OffsetDateTime::now_utc()).await?;
			info!(
				outbox_id = %job.outbox_id,
				event_id = %job.event_id,
				duplicate = outcome == ApplyOutcome::Duplicate,
				"Spilled event applied."
			);
		},
		Err(failure) => settle_failure(state, &job, failure).await?,
	}

	Ok(true)
}

async fn handle_job(
	state: &WorkerState,
	job: &EventOutboxEntry,
) -> Result<ApplyOutcome, JobFailure> {
	let event = job
		.decode_event()
		.map_err(|err| JobFailure::permanent(format!("Outbox payload is unreadable: {err}")))?;

	event.validate().map_err(|err| JobFailure::permanent(err.to_string()))?;

	Ok(ingest::apply_event(&state.stores, &event, state.max_recent_items).await?)
}

async fn settle_failure(
	state: &WorkerState,
	job: &EventOutboxEntry,
	failure: JobFailure,
) -> Result<()> {
	let now = OffsetDateTime::now_utc();
	let error_text = redact_error(&failure.message);

	match disposition(job.attempts, failure.retryable, &state.ingest, now) {
		Disposition::Retry { attempts, available_at } => {
			mark_event_outbox_failed(
				&state.db,
				job.outbox_id,
				attempts,
				&error_text,
				available_at,
				now,
			)
			.await?;
			warn!(
				outbox_id = %job.outbox_id,
				attempts,
				error = %error_text,
				"Spilled event failed. Retrying."
			);
		},
		Disposition::Dead { attempts } => {
			// Undecodable payloads have no event to preserve; the outbox row keeps the raw JSON.
			if let Ok(event) = job.decode_event() {
				let letter = DeadLetter::new(event, attempts as u32, error_text.clone(), now);

				state.stores.dead_letters.record(&letter).await?;
			}

			mark_event_outbox_dead(&state.db, job.outbox_id, attempts, &error_text, now).await?;
			error!(
				outbox_id = %job.outbox_id,
				attempts,
				error = %error_text,
				"Spilled event failed permanently."
			);
		},
	}

	Ok(())
}

/// `prior_attempts` counts earlier failed attempts of the job.
pub fn disposition(
	prior_attempts: i32,
	retryable: bool,
	cfg: &Ingest,
	now: OffsetDateTime,
) -> Disposition {
	let attempts = prior_attempts.max(0).saturating_add(1);

	if !retryable || attempts as u32 >= cfg.max_attempts {
		return Disposition::Dead { attempts };
	}

	let delay = backoff_for_attempt(attempts as u32, cfg.base_backoff_ms, cfg.max_backoff_ms);

	Disposition::Retry {
		attempts,
		available_at: now + Duration::milliseconds(delay.as_millis() as i64),
	}
}
