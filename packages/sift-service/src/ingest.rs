use std::{
	sync::{
		Arc, Mutex, MutexGuard,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::Duration,
};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
	sync::{
		Mutex as AsyncMutex,
		mpsc::{self, error::TrySendError},
		watch,
	},
	task::JoinHandle,
};
use tracing::{error, info, warn};

use sift_config::{BackpressureMode, Ingest, Personalization};
use sift_domain::BehaviorEvent;
use sift_storage::{ApplyOutcome, DeadLetter};

use crate::{Error, Result, Stores};

const MAX_ERROR_CHARS: usize = 1_024;
const MAX_BACKOFF_EXPONENT: u32 = 6;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
	Queued,
	/// The queue was full and the event went to the durable spill.
	Spilled,
	/// The queue was full and the event was discarded.
	Dropped,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct IngestStats {
	pub submitted: u64,
	pub applied: u64,
	pub duplicates: u64,
	pub retried: u64,
	pub dead_lettered: u64,
	pub dropped: u64,
	pub spilled: u64,
}

/// Bounded queue plus worker pool that applies interaction events off the request path.
///
/// Events are applied at least once; the metrics store's idempotency by `event_id` makes the
/// effect exactly once. Retryable failures are requeued with exponential backoff until
/// `max_attempts`, then dead-lettered.
#[derive(Clone)]
pub struct Ingestor {
	inner: Arc<Inner>,
}
impl Ingestor {
	/// Spawns `cfg.workers` consumer tasks on the current runtime.
	pub fn start(cfg: &Ingest, personalization: &Personalization, stores: Stores) -> Self {
		let (sender, receiver) = mpsc::channel(cfg.queue_capacity.max(1) as usize);
		let (pending, _) = watch::channel(0_usize);
		let ctx = Arc::new(WorkerContext {
			stores,
			cfg: cfg.clone(),
			max_recent_items: personalization.max_recent_items as usize,
			counters: Counters::default(),
			pending,
			requeue: sender.downgrade(),
		});
		let receiver = Arc::new(AsyncMutex::new(receiver));
		let workers = (0..cfg.workers.max(1))
			.map(|worker_id| tokio::spawn(run_worker(worker_id, ctx.clone(), receiver.clone())))
			.collect();

		info!(
			workers = cfg.workers,
			queue_capacity = cfg.queue_capacity,
			backpressure = cfg.backpressure.as_str(),
			"Event ingestor started."
		);

		Self {
			inner: Arc::new(Inner {
				sender: Mutex::new(Some(sender)),
				closed: AtomicBool::new(false),
				workers: Mutex::new(workers),
				ctx,
			}),
		}
	}

	/// Hands `event` to the queue. Waits only for queue capacity under `block` backpressure.
	pub async fn submit(&self, event: BehaviorEvent) -> Result<SubmitOutcome> {
		let sender = self.sender()?;
		let pending = PendingGuard::begin(&self.inner.ctx);

		self.enqueue(sender, event, pending).await
	}

	/// Fire-and-forget `submit`. The event counts as pending before this returns.
	pub fn track(&self, event: BehaviorEvent) {
		let sender = match self.sender() {
			Ok(sender) => sender,
			Err(err) => {
				warn!(event_id = %event.event_id, error = %err, "Failed to submit event.");

				return;
			},
		};

		let pending = PendingGuard::begin(&self.inner.ctx);
		let ingestor = self.clone();

		tokio::spawn(async move {
			let event_id = event.event_id;

			if let Err(err) = ingestor.enqueue(sender, event, pending).await {
				warn!(event_id = %event_id, error = %err, "Failed to submit event.");
			}
		});
	}

	pub fn stats(&self) -> IngestStats {
		self.inner.ctx.counters.snapshot()
	}

	/// Events queued or waiting for a retry.
	pub fn pending(&self) -> usize {
		*self.inner.ctx.pending.borrow()
	}

	/// Resolves once every submitted event reached a terminal state.
	pub async fn wait_idle(&self) {
		let mut pending = self.inner.ctx.pending.subscribe();

		// The sender lives in the context, so this never observes a closed channel.
		let _ = pending.wait_for(|count| *count == 0).await;
	}

	/// Stops accepting events, drains the queue and pending retries, then joins the workers.
	pub async fn shutdown(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		self.wait_idle().await;

		drop(lock(&self.inner.sender).take());

		let workers = std::mem::take(&mut *lock(&self.inner.workers));

		for worker in workers {
			if let Err(err) = worker.await {
				error!(error = %err, "Ingest worker panicked.");
			}
		}

		info!(stats = ?self.stats(), "Event ingestor stopped.");
	}

	/// `pending` is released unless the event reaches the queue, including when this future is
	/// dropped while waiting for capacity.
	async fn enqueue(
		&self,
		sender: mpsc::Sender<Envelope>,
		event: BehaviorEvent,
		pending: PendingGuard,
	) -> Result<SubmitOutcome> {
		let ctx = &self.inner.ctx;

		ctx.counters.submitted.fetch_add(1, Ordering::Relaxed);

		let envelope = Envelope { event, attempt: 1 };

		match ctx.cfg.backpressure {
			BackpressureMode::Block => match sender.send(envelope).await {
				Ok(()) => {
					pending.disarm();

					Ok(SubmitOutcome::Queued)
				},
				Err(_) => Err(shut_down()),
			},
			BackpressureMode::Drop | BackpressureMode::Spill => match sender.try_send(envelope) {
				Ok(()) => {
					pending.disarm();

					Ok(SubmitOutcome::Queued)
				},
				Err(TrySendError::Full(envelope)) => {
					drop(pending);

					Ok(self.overflow(envelope.event).await)
				},
				Err(TrySendError::Closed(_)) => Err(shut_down()),
			},
		}
	}

	fn sender(&self) -> Result<mpsc::Sender<Envelope>> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(shut_down());
		}

		lock(&self.inner.sender).clone().ok_or_else(shut_down)
	}

	async fn overflow(&self, event: BehaviorEvent) -> SubmitOutcome {
		let ctx = &self.inner.ctx;

		if ctx.cfg.backpressure == BackpressureMode::Spill {
			match ctx.stores.spill.as_ref() {
				Some(spill) => match spill.spill(&event).await {
					Ok(()) => {
						ctx.counters.spilled.fetch_add(1, Ordering::Relaxed);
						warn!(event_id = %event.event_id, "Ingest queue is full. Spilled event.");

						return SubmitOutcome::Spilled;
					},
					Err(err) => {
						warn!(event_id = %event.event_id, error = %err, "Spill failed.");
					},
				},
				None => warn!("Spill backpressure has no spill sink configured."),
			}
		}

		ctx.counters.dropped.fetch_add(1, Ordering::Relaxed);
		warn!(event_id = %event.event_id, "Ingest queue is full. Dropped event.");

		SubmitOutcome::Dropped
	}
}

struct Inner {
	sender: Mutex<Option<mpsc::Sender<Envelope>>>,
	closed: AtomicBool,
	workers: Mutex<Vec<JoinHandle<()>>>,
	ctx: Arc<WorkerContext>,
}

#[derive(Debug)]
struct Envelope {
	event: BehaviorEvent,
	attempt: u32,
}

#[derive(Default)]
struct Counters {
	submitted: AtomicU64,
	applied: AtomicU64,
	duplicates: AtomicU64,
	retried: AtomicU64,
	dead_lettered: AtomicU64,
	dropped: AtomicU64,
	spilled: AtomicU64,
}
impl Counters {
	fn snapshot(&self) -> IngestStats {
		IngestStats {
			submitted: self.submitted.load(Ordering::Relaxed),
			applied: self.applied.load(Ordering::Relaxed),
			duplicates: self.duplicates.load(Ordering::Relaxed),
			retried: self.retried.load(Ordering::Relaxed),
			dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
			spilled: self.spilled.load(Ordering::Relaxed),
		}
	}
}

/// One pending slot taken at submission. Dropping it releases the slot; `disarm` hands it to the
/// queue, whose workers release it once the event settles.
struct PendingGuard {
	ctx: Option<Arc<WorkerContext>>,
}
impl PendingGuard {
	fn begin(ctx: &Arc<WorkerContext>) -> Self {
		ctx.begin_pending();

		Self { ctx: Some(ctx.clone()) }
	}

	fn disarm(mut self) {
		self.ctx = None;
	}
}
impl Drop for PendingGuard {
	fn drop(&mut self) {
		if let Some(ctx) = self.ctx.take() {
			ctx.finish_pending();
		}
	}
}

struct WorkerContext {
	stores: Stores,
	cfg: Ingest,
	max_recent_items: usize,
	counters: Counters,
	pending: watch::Sender<usize>,
	requeue: mpsc::WeakSender<Envelope>,
}
impl WorkerContext {
	fn begin_pending(&self) {
		self.pending.send_modify(|count| *count += 1);
	}

	fn finish_pending(&self) {
		self.pending.send_modify(|count| *count = count.saturating_sub(1));
	}

	async fn process(self: &Arc<Self>, envelope: Envelope) {
		let Envelope { event, attempt } = envelope;

		if let Err(err) = event.validate() {
			warn!(event_id = %event.event_id, error = %err, "Rejected invalid event.");

			self.dead_letter(event, attempt, &err.to_string()).await;

			return;
		}

		match apply_event(&self.stores, &event, self.max_recent_items).await {
			Ok(ApplyOutcome::Applied) => {
				self.counters.applied.fetch_add(1, Ordering::Relaxed);
				self.finish_pending();
			},
			Ok(ApplyOutcome::Duplicate) => {
				self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
				self.finish_pending();
			},
			Err(err) if err.is_retryable() && attempt < self.cfg.max_attempts => {
				let delay =
					backoff_for_attempt(attempt, self.cfg.base_backoff_ms, self.cfg.max_backoff_ms);

				self.counters.retried.fetch_add(1, Ordering::Relaxed);
				warn!(
					event_id = %event.event_id,
					attempt,
					delay_ms = delay.as_millis() as u64,
					error = %err,
					"Event application failed. Retrying."
				);

				self.schedule_retry(Envelope { event, attempt: attempt + 1 }, delay);
			},
			Err(err) => {
				error!(
					event_id = %event.event_id,
					attempt,
					error = %err,
					"Event application failed permanently."
				);

				self.dead_letter(event, attempt, &err.to_string()).await;
			},
		}
	}

	fn schedule_retry(self: &Arc<Self>, envelope: Envelope, delay: Duration) {
		let ctx = self.clone();

		tokio::spawn(async move {
			tokio::time::sleep(delay).await;

			let Some(sender) = ctx.requeue.upgrade() else {
				let Envelope { event, attempt } = envelope;

				ctx.dead_letter(event, attempt, "Ingestor shut down before retry.").await;

				return;
			};

			if let Err(err) = sender.send(envelope).await {
				let Envelope { event, attempt } = err.0;

				ctx.dead_letter(event, attempt, "Ingestor shut down before retry.").await;
			}
		});
	}

	async fn dead_letter(&self, event: BehaviorEvent, attempts: u32, reason: &str) {
		let event_id = event.event_id;
		let letter = DeadLetter::new(event, attempts, redact_error(reason), OffsetDateTime::now_utc());

		if let Err(err) = self.stores.dead_letters.record(&letter).await {
			error!(event_id = %event_id, error = %err, "Failed to record dead letter.");
		}

		self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
		self.finish_pending();
	}
}

async fn run_worker(
	worker_id: u32,
	ctx: Arc<WorkerContext>,
	receiver: Arc<AsyncMutex<mpsc::Receiver<Envelope>>>,
) {
	loop {
		let next = receiver.lock().await.recv().await;
		let Some(envelope) = next else {
			break;
		};

		ctx.process(envelope).await;
	}

	info!(worker_id, "Ingest worker exited.");
}

/// Logs `event`, folds it into item metrics, and on first application into the user profile.
///
/// Redelivering an applied event is a no-op reported as `Duplicate`. Profile failures are logged
/// and do not fail the event.
pub async fn apply_event(
	stores: &Stores,
	event: &BehaviorEvent,
	max_recent_items: usize,
) -> sift_storage::Result<ApplyOutcome> {
	stores.events.append(event).await?;

	let outcome = stores.metrics.apply_event(event).await?;

	if outcome == ApplyOutcome::Applied
		&& event.user_id.is_some()
		&& let Err(err) = stores.profiles.apply_event(event, max_recent_items).await
	{
		warn!(event_id = %event.event_id, error = %err, "Profile update failed.");
	}

	Ok(outcome)
}

/// `base_ms * 2^(attempt - 1)`, capped at `max_ms`.
pub fn backoff_for_attempt(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
	let exp = attempt.max(1).saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
	let delay = base_ms.saturating_mul(1_u64 << exp);

	Duration::from_millis(delay.min(max_ms))
}

/// Masks credentials in an error message and bounds its length before it is persisted.
pub fn redact_error(text: &str) -> String {
	let mut words = Vec::new();
	let mut mask_next = false;

	for raw in text.split_whitespace() {
		if mask_next {
			words.push("[REDACTED]".to_string());
			mask_next = false;

			continue;
		}
		if raw.eq_ignore_ascii_case("bearer") {
			mask_next = true;
		}

		let lowered = raw.to_ascii_lowercase();
		let sensitive = ["api_key", "apikey", "password", "secret", "token"]
			.iter()
			.any(|key| lowered.contains(key));
		let separator = raw.find(['=', ':']);

		match separator {
			Some(index) if sensitive => words.push(format!("{}[REDACTED]", &raw[..=index])),
			_ => words.push(raw.to_string()),
		}
	}

	let mut out = words.join(" ");

	if out.chars().count() > MAX_ERROR_CHARS {
		out = out.chars().take(MAX_ERROR_CHARS).collect();
		out.push_str("...");
	}

	out
}

fn shut_down() -> Error {
	Error::Ingest { message: "Ingestor is shut down.".to_string() }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|err| err.into_inner())
}
