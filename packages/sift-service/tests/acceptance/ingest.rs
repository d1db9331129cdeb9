use std::{sync::Arc, time::Duration};

use time::{OffsetDateTime, macros::datetime};

use sift_config::{BackpressureMode, Ingest, Personalization};
use sift_domain::{BehaviorEvent, EventType};
use sift_service::{Ingestor, Stores, SubmitOutcome};
use sift_storage::{
	DeadLetterSink, MetricsStore, ProfileStore,
	memory::{
		MemoryDeadLetters, MemoryEventLog, MemoryMetricsStore, MemoryProfileStore, MemorySpill,
	},
};

use super::{FlakyMetrics, GatedMetrics};

fn ingest_cfg(backpressure: BackpressureMode, queue_capacity: u32, workers: u32) -> Ingest {
	Ingest {
		queue_capacity,
		workers,
		backpressure,
		max_attempts: 3,
		base_backoff_ms: 5,
		max_backoff_ms: 20,
	}
}

fn click(item_id: &str) -> BehaviorEvent {
	BehaviorEvent::new(EventType::Click, "s1")
		.with_item(item_id)
		.at(datetime!(2026-03-01 10:00 UTC))
}

fn start(cfg: Ingest, stores: Stores) -> Ingestor {
	Ingestor::start(&cfg, &Personalization::default(), stores)
}

async fn idle(ingestor: &Ingestor) {
	tokio::time::timeout(Duration::from_secs(10), ingestor.wait_idle())
		.await
		.expect("Ingestion must settle.");
}

#[tokio::test]
async fn redelivered_events_apply_once() {
	let metrics = Arc::new(MemoryMetricsStore::new());
	let stores = Stores { metrics: metrics.clone(), ..Stores::in_memory() };
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 64, 2), stores);
	let event = click("a").with_dwell_time(3.0);

	for _ in 0..3 {
		assert_eq!(
			ingestor.submit(event.clone()).await.expect("Submit must succeed."),
			SubmitOutcome::Queued
		);
	}

	idle(&ingestor).await;

	let record = metrics.get("a").await.expect("Read must succeed.");
	let stats = ingestor.stats();

	assert_eq!(record.total_clicks, 1);
	assert_eq!(record.total_dwell_ms, 3_000);
	assert_eq!((stats.submitted, stats.applied, stats.duplicates), (3, 1, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_lose_no_updates() {
	let metrics = Arc::new(MemoryMetricsStore::new());
	let stores = Stores { metrics: metrics.clone(), ..Stores::in_memory() };
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 16, 4), stores);
	let mut producers = Vec::new();

	for _ in 0..4 {
		let ingestor = ingestor.clone();

		producers.push(tokio::spawn(async move {
			for _ in 0..250 {
				ingestor.submit(click("hot")).await.expect("Submit must succeed.");
			}
		}));
	}
	for producer in producers {
		producer.await.expect("Producer must not panic.");
	}

	idle(&ingestor).await;

	assert_eq!(metrics.get("hot").await.expect("Read must succeed.").total_clicks, 1_000);
	assert_eq!(ingestor.stats().applied, 1_000);
}

#[tokio::test]
async fn transient_failures_are_retried_until_applied() {
	let metrics = Arc::new(FlakyMetrics::unavailable(2));
	let dead_letters = Arc::new(MemoryDeadLetters::new());
	let stores = Stores {
		metrics: metrics.clone(),
		dead_letters: dead_letters.clone(),
		..Stores::in_memory()
	};
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 8, 1), stores);

	ingestor.submit(click("a")).await.expect("Submit must succeed.");

	idle(&ingestor).await;

	let stats = ingestor.stats();

	assert_eq!((stats.retried, stats.applied, stats.dead_lettered), (2, 1, 0));
	assert_eq!(metrics.get("a").await.expect("Read must succeed.").total_clicks, 1);
	assert!(dead_letters.is_empty());
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_ingestion_continues() {
	let metrics = Arc::new(FlakyMetrics::unavailable(3));
	let dead_letters = Arc::new(MemoryDeadLetters::new());
	let stores = Stores {
		metrics: metrics.clone(),
		dead_letters: dead_letters.clone(),
		..Stores::in_memory()
	};
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 8, 1), stores);
	let doomed = click("a");

	ingestor.submit(doomed.clone()).await.expect("Submit must succeed.");

	idle(&ingestor).await;

	ingestor.submit(click("b")).await.expect("Submit must succeed.");

	idle(&ingestor).await;

	let letters = dead_letters.list(10).await.expect("List must succeed.");

	assert_eq!(letters.len(), 1);
	assert_eq!(letters[0].event.event_id, doomed.event_id);
	assert_eq!(letters[0].attempts, 3);
	assert!(letters[0].last_error.contains("restarting"));
	assert_eq!(metrics.get("b").await.expect("Read must succeed.").total_clicks, 1);
}

#[tokio::test]
async fn permanent_failures_skip_retries() {
	let dead_letters = Arc::new(MemoryDeadLetters::new());
	let stores = Stores {
		metrics: Arc::new(FlakyMetrics::rejecting()),
		dead_letters: dead_letters.clone(),
		..Stores::in_memory()
	};
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 8, 1), stores);

	ingestor.submit(click("a")).await.expect("Submit must succeed.");

	idle(&ingestor).await;

	let letters = dead_letters.list(10).await.expect("List must succeed.");

	assert_eq!(ingestor.stats().retried, 0);
	assert_eq!(letters.len(), 1);
	assert_eq!(letters[0].attempts, 1);
}

#[tokio::test]
async fn invalid_events_are_dead_lettered_without_touching_metrics() {
	let metrics = Arc::new(MemoryMetricsStore::new());
	let events = Arc::new(MemoryEventLog::new());
	let dead_letters = Arc::new(MemoryDeadLetters::new());
	let stores = Stores {
		metrics: metrics.clone(),
		events: events.clone(),
		dead_letters: dead_letters.clone(),
		..Stores::in_memory()
	};
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 8, 1), stores);
	let itemless_click = BehaviorEvent::new(EventType::Click, "s1");
	let negative_dwell = click("a").with_dwell_time(-1.0);

	ingestor.submit(itemless_click).await.expect("Submit must succeed.");
	ingestor.submit(negative_dwell).await.expect("Submit must succeed.");

	idle(&ingestor).await;

	assert_eq!(dead_letters.len(), 2);
	assert!(events.is_empty());
	assert_eq!(metrics.applied_events(), 0);
}

#[tokio::test]
async fn drop_backpressure_discards_overflow() {
	let metrics = Arc::new(GatedMetrics::new());
	let stores = Stores { metrics: metrics.clone(), ..Stores::in_memory() };
	let ingestor = start(ingest_cfg(BackpressureMode::Drop, 1, 1), stores);

	assert_eq!(ingestor.submit(click("a")).await.expect("Submit."), SubmitOutcome::Queued);

	metrics.entered.notified().await;

	assert_eq!(ingestor.submit(click("b")).await.expect("Submit."), SubmitOutcome::Queued);
	assert_eq!(ingestor.submit(click("c")).await.expect("Submit."), SubmitOutcome::Dropped);

	metrics.release.add_permits(16);

	idle(&ingestor).await;

	let stats = ingestor.stats();

	assert_eq!((stats.applied, stats.dropped), (2, 1));
	assert!(metrics.inner.get("c").await.expect("Read must succeed.").is_cold());
}

#[tokio::test]
async fn spill_backpressure_hands_overflow_to_the_spill() {
	let metrics = Arc::new(GatedMetrics::new());
	let spill = Arc::new(MemorySpill::new());
	let stores =
		Stores { metrics: metrics.clone(), ..Stores::in_memory() }.with_spill(spill.clone());
	let ingestor = start(ingest_cfg(BackpressureMode::Spill, 1, 1), stores);
	let overflow = click("c");

	ingestor.submit(click("a")).await.expect("Submit.");
	metrics.entered.notified().await;
	ingestor.submit(click("b")).await.expect("Submit.");

	assert_eq!(ingestor.submit(overflow.clone()).await.expect("Submit."), SubmitOutcome::Spilled);

	metrics.release.add_permits(16);

	idle(&ingestor).await;

	assert_eq!(spill.drain(), vec![overflow]);
	assert_eq!(ingestor.stats().spilled, 1);
}

#[tokio::test]
async fn spill_without_a_sink_drops() {
	let metrics = Arc::new(GatedMetrics::new());
	let stores = Stores { metrics: metrics.clone(), ..Stores::in_memory() };
	let ingestor = start(ingest_cfg(BackpressureMode::Spill, 1, 1), stores);

	ingestor.submit(click("a")).await.expect("Submit.");
	metrics.entered.notified().await;
	ingestor.submit(click("b")).await.expect("Submit.");

	assert_eq!(ingestor.submit(click("c")).await.expect("Submit."), SubmitOutcome::Dropped);

	metrics.release.add_permits(16);

	idle(&ingestor).await;
}

#[tokio::test]
async fn cancelled_blocked_submit_releases_its_pending_slot() {
	let metrics = Arc::new(GatedMetrics::new());
	let stores = Stores { metrics: metrics.clone(), ..Stores::in_memory() };
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 1, 1), stores);

	assert_eq!(ingestor.submit(click("a")).await.expect("Submit."), SubmitOutcome::Queued);

	metrics.entered.notified().await;

	assert_eq!(ingestor.submit(click("b")).await.expect("Submit."), SubmitOutcome::Queued);

	let blocked = tokio::time::timeout(Duration::from_millis(50), ingestor.submit(click("c"))).await;

	assert!(blocked.is_err(), "Submit must wait for queue capacity.");

	metrics.release.add_permits(16);

	idle(&ingestor).await;

	assert_eq!(ingestor.pending(), 0);
	assert_eq!(ingestor.stats().applied, 2);
	assert!(metrics.inner.get("c").await.expect("Read must succeed.").is_cold());

	tokio::time::timeout(Duration::from_secs(10), ingestor.shutdown())
		.await
		.expect("Shutdown must finish.");
}

#[tokio::test]
async fn applied_events_update_user_profiles() {
	let profiles = Arc::new(MemoryProfileStore::new());
	let stores = Stores { profiles: profiles.clone(), ..Stores::in_memory() };
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 8, 1), stores);
	let purchase = BehaviorEvent::new(EventType::Purchase, "s1")
		.with_item("a")
		.with_user("u1")
		.at(OffsetDateTime::now_utc());

	ingestor.submit(purchase.clone()).await.expect("Submit must succeed.");
	ingestor.submit(purchase).await.expect("Submit must succeed.");

	idle(&ingestor).await;

	let profile = profiles.get("u1").await.expect("Read must succeed.").expect("Profile exists.");

	assert_eq!(profile.total_purchases, 1);
	assert_eq!(profile.recent_item_ids, vec!["a".to_string()]);
}

#[tokio::test]
async fn shutdown_drains_and_rejects_new_events() {
	let metrics = Arc::new(MemoryMetricsStore::new());
	let stores = Stores { metrics: metrics.clone(), ..Stores::in_memory() };
	let ingestor = start(ingest_cfg(BackpressureMode::Block, 64, 2), stores);

	for item_id in ["a", "b", "c"] {
		ingestor.submit(click(item_id)).await.expect("Submit must succeed.");
	}

	tokio::time::timeout(Duration::from_secs(10), ingestor.shutdown())
		.await
		.expect("Shutdown must finish.");

	assert_eq!(metrics.applied_events(), 3);
	assert!(ingestor.submit(click("d")).await.is_err());
}
