use std::sync::Arc;

use time::{Duration, OffsetDateTime, macros::datetime};

use sift_domain::{BehaviorEvent, EventType, TimeRange};
use sift_service::{Analytics, CtrInterval, QuerySummary};
use sift_storage::{EventLog, memory::MemoryEventLog};

use super::test_config;

const TOLERANCE: f64 = 1e-12;

fn at(minute: i64) -> OffsetDateTime {
	datetime!(2026-03-01 10:00 UTC) + Duration::minutes(minute)
}

fn day() -> TimeRange {
	TimeRange::new(datetime!(2026-03-01 00:00 UTC), datetime!(2026-03-02 00:00 UTC))
}

fn analytics(events: Arc<MemoryEventLog>) -> Analytics {
	Analytics::new(events, test_config().analytics)
}

async fn append(log: &MemoryEventLog, events: Vec<BehaviorEvent>) {
	for event in events {
		log.append(&event).await.expect("Append must succeed.");
	}
}

fn searches(query: &str, prefix: &str, count: i64, first_minute: i64) -> Vec<BehaviorEvent> {
	(0..count)
		.map(|index| {
			BehaviorEvent::new(EventType::Search, format!("{prefix}-{index}"))
				.with_query(query)
				.at(at(first_minute + index))
		})
		.collect()
}

fn interaction(
	event_type: EventType,
	session_id: &str,
	item_id: &str,
	minute: i64,
) -> BehaviorEvent {
	BehaviorEvent::new(event_type, session_id).with_item(item_id).at(at(minute))
}

/// chair: 20 searches, 1 click, 1 purchase. lamp: 10 searches, 5 clicks. zzz: 3 searches.
async fn catalog_log() -> Arc<MemoryEventLog> {
	let log = Arc::new(MemoryEventLog::new());

	append(&log, searches("chair", "chair", 20, 0)).await;
	append(&log, searches("lamp", "lamp", 10, 30)).await;
	append(&log, searches("zzz", "zzz", 3, 60)).await;
	append(
		&log,
		vec![
			interaction(EventType::Click, "chair-0", "c1", 100),
			interaction(EventType::Purchase, "chair-0", "c1", 101),
		],
	)
	.await;

	for index in 0..10 {
		let session_id = format!("lamp-{index}");

		append(&log, vec![interaction(EventType::Search, &session_id, "l1", 40 + index)]).await;

		if index < 5 {
			append(&log, vec![interaction(EventType::Click, &session_id, "l1", 110 + index)]).await;
		}
	}

	log
}

fn find<'a>(summaries: &'a [QuerySummary], query: &str) -> &'a QuerySummary {
	summaries
		.iter()
		.find(|summary| summary.query == query)
		.unwrap_or_else(|| panic!("Missing summary for {query}."))
}

#[tokio::test]
async fn unclicked_queries_are_reported_until_clicked() {
	let log = Arc::new(MemoryEventLog::new());
	let analytics = analytics(log.clone());

	append(&log, searches("zzz", "s", 3, 0)).await;

	let zero = analytics.zero_result_queries(day()).await.expect("Query must succeed.");

	assert_eq!(zero.len(), 1);
	assert_eq!((zero[0].query.as_str(), zero[0].searches), ("zzz", 3));
	assert_eq!(zero[0].last_seen, at(2));

	append(&log, vec![interaction(EventType::Click, "s-0", "z1", 10)]).await;

	assert!(analytics.zero_result_queries(day()).await.expect("Query must succeed.").is_empty());
}

#[tokio::test]
async fn performance_flags_are_independent() {
	let analytics = analytics(catalog_log().await);
	let summaries = analytics.summarize(day(), 5).await.expect("Summarize must succeed.");
	let chair = find(&summaries, "chair");
	let lamp = find(&summaries, "lamp");

	assert!(summaries.iter().all(|summary| summary.query != "zzz"));

	assert!((chair.ctr - 0.05).abs() < TOLERANCE);
	assert_eq!(chair.conversion_rate, 1.0);
	assert!(chair.low_ctr);
	assert!(!chair.low_conversion);
	assert!(!chair.zero_result);
	assert_eq!(chair.zero_result_count, 19);
	assert_eq!(chair.sessions, 20);

	assert!((lamp.ctr - 0.5).abs() < TOLERANCE);
	assert!(!lamp.low_ctr);
	assert!(lamp.low_conversion);
	assert!(!lamp.zero_result);
	assert!(lamp.is_poor_performing());
}

#[tokio::test]
async fn low_conversion_needs_enough_searches() {
	let analytics = analytics(catalog_log().await);
	let summaries = analytics.summarize(day(), 1).await.expect("Summarize must succeed.");

	assert!(!find(&summaries, "zzz").low_conversion);
	assert!(find(&summaries, "lamp").low_conversion);

	let strict = analytics.summarize(day(), 11).await.expect("Summarize must succeed.");

	assert_eq!(strict.len(), 1);
	assert!(!find(&strict, "chair").low_conversion);
}

#[tokio::test]
async fn report_ignores_conversion_of_low_traffic_queries() {
	let log = Arc::new(MemoryEventLog::new());
	let analytics = analytics(log.clone());

	append(&log, searches("desk", "desk", 2, 0)).await;
	append(&log, vec![interaction(EventType::Click, "desk-0", "d1", 5)]).await;

	let report = analytics.report(day(), 10).await.expect("Report must succeed.");
	let desk = find(&report.top_queries, "desk");

	assert_eq!((desk.searches, desk.clicks), (2, 1));
	assert!((desk.ctr - 0.5).abs() < TOLERANCE);
	assert!(!desk.low_conversion);
	assert!(report.poor_performing_queries.is_empty());
}

#[tokio::test]
async fn report_totals_and_orders_every_list() {
	let analytics = analytics(catalog_log().await);
	let report = analytics.report(day(), 10).await.expect("Report must succeed.");
	let top = report.top_queries.iter().map(|summary| summary.query.as_str()).collect::<Vec<_>>();
	let poor = report
		.poor_performing_queries
		.iter()
		.map(|summary| summary.query.as_str())
		.collect::<Vec<_>>();

	assert_eq!(report.total_queries, 3);
	assert_eq!(report.total_searches, 33);
	assert_eq!(report.total_clicks, 6);
	assert_eq!(report.total_purchases, 1);
	assert!((report.overall_ctr - 6.0 / 33.0).abs() < TOLERANCE);
	assert!((report.overall_conversion_rate - 1.0 / 6.0).abs() < TOLERANCE);
	assert_eq!(report.zero_result_queries, 1);
	assert_eq!(top, vec!["chair", "lamp", "zzz"]);
	assert_eq!(poor, vec!["zzz", "chair", "lamp"]);
	assert_eq!(report.top_viewed_items[0].item_id, "l1");
	assert_eq!(report.top_converted_items[0].item_id, "c1");

	let limited = analytics.report(day(), 1).await.expect("Report must succeed.");

	assert_eq!(limited.top_queries.len(), 1);
	assert_eq!(limited.poor_performing_queries[0].query, "zzz");
}

#[tokio::test]
async fn item_metrics_count_impressions_and_interactions() {
	let analytics = analytics(catalog_log().await);
	let items = analytics.item_metrics(day(), 10).await.expect("Query must succeed.");
	let lamp = &items[0];

	assert_eq!(lamp.item_id, "l1");
	assert_eq!((lamp.appearances, lamp.clicks, lamp.purchases), (10, 5, 0));
	assert!((lamp.ctr - 0.5).abs() < TOLERANCE);
	assert_eq!(analytics.item_metrics(day(), 1).await.expect("Query must succeed.").len(), 1);
}

#[tokio::test]
async fn daily_ctr_covers_the_whole_day() {
	let analytics = analytics(catalog_log().await);
	let series =
		analytics.ctr_over_time(day(), CtrInterval::Day).await.expect("Query must succeed.");

	assert_eq!(series.len(), 1);
	assert_eq!(series[0].bucket_start, datetime!(2026-03-01 00:00 UTC));
	assert_eq!((series[0].searches, series[0].clicks), (33, 6));
}

#[tokio::test]
async fn events_outside_the_range_are_ignored() {
	let analytics = analytics(catalog_log().await);
	let earlier = TimeRange::new(datetime!(2026-02-01 00:00 UTC), datetime!(2026-03-01 00:00 UTC));
	let report = analytics.report(earlier, 10).await.expect("Report must succeed.");

	assert_eq!(report.total_queries, 0);
	assert_eq!(report.overall_ctr, 0.0);
	assert!(report.ctr_over_time.is_empty());
}
