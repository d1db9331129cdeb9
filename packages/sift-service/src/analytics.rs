use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashMap, HashSet},
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, Time, UtcOffset};

use sift_domain::{BehaviorEvent, EventType, TimeRange};
use sift_storage::EventLog;

use crate::Result;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuerySummary {
	pub query: String,
	pub searches: u64,
	pub clicks: u64,
	pub carts: u64,
	pub purchases: u64,
	pub sessions: u64,
	/// Searches that received no click.
	pub zero_result_count: u64,
	pub ctr: f64,
	/// Purchases per click.
	pub conversion_rate: f64,
	/// Seconds, averaged over attributed events that reported a dwell time.
	pub avg_dwell_time: f64,
	#[serde(with = "sift_domain::time_serde")]
	pub first_seen: OffsetDateTime,
	#[serde(with = "sift_domain::time_serde")]
	pub last_seen: OffsetDateTime,
	pub low_ctr: bool,
	pub zero_result: bool,
	pub low_conversion: bool,
}
impl QuerySummary {
	pub fn is_poor_performing(&self) -> bool {
		self.low_ctr || self.zero_result || self.low_conversion
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryRef {
	pub query: String,
	pub searches: u64,
	#[serde(with = "sift_domain::time_serde")]
	pub last_seen: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ItemSummary {
	pub item_id: String,
	/// Times the item was shown in a result list.
	pub appearances: u64,
	pub clicks: u64,
	pub carts: u64,
	pub purchases: u64,
	pub bounces: u64,
	pub ctr: f64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CtrInterval {
	Hour,
	Day,
}
impl CtrInterval {
	fn bucket_start(self, at: OffsetDateTime) -> OffsetDateTime {
		let utc = at.to_offset(UtcOffset::UTC);
		let midnight = utc.replace_time(Time::MIDNIGHT);

		match self {
			Self::Hour => midnight + Duration::hours(i64::from(utc.hour())),
			Self::Day => midnight,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CtrPoint {
	#[serde(with = "sift_domain::time_serde")]
	pub bucket_start: OffsetDateTime,
	pub searches: u64,
	pub clicks: u64,
	pub ctr: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalyticsReport {
	pub range: TimeRange,
	pub total_queries: usize,
	pub total_searches: u64,
	pub total_clicks: u64,
	pub total_carts: u64,
	pub total_purchases: u64,
	pub overall_ctr: f64,
	pub overall_conversion_rate: f64,
	pub zero_result_queries: usize,
	pub top_queries: Vec<QuerySummary>,
	pub poor_performing_queries: Vec<QuerySummary>,
	pub top_viewed_items: Vec<ItemSummary>,
	pub top_converted_items: Vec<ItemSummary>,
	pub ctr_over_time: Vec<CtrPoint>,
}

/// Read-side aggregation over the event log. Never mutates anything.
#[derive(Clone)]
pub struct Analytics {
	events: Arc<dyn EventLog>,
	cfg: sift_config::Analytics,
}
impl Analytics {
	pub fn new(events: Arc<dyn EventLog>, cfg: sift_config::Analytics) -> Self {
		Self { events, cfg }
	}

	/// Per-query summaries for queries searched at least `min_searches` times, busiest first.
	///
	/// Low conversion is flagged only once a query also reaches
	/// `analytics.low_conversion_min_searches`.
	pub async fn summarize(&self, range: TimeRange, min_searches: u64) -> Result<Vec<QuerySummary>> {
		let events = self.events.list(range).await?;

		Ok(summarize_events(&events, min_searches, &self.cfg))
	}

	/// Queries searched at least once in `range` without a single click.
	pub async fn zero_result_queries(&self, range: TimeRange) -> Result<Vec<QueryRef>> {
		let summaries = self.summarize(range, 1).await?;

		Ok(summaries
			.into_iter()
			.filter(|summary| summary.zero_result)
			.map(|summary| QueryRef {
				query: summary.query,
				searches: summary.searches,
				last_seen: summary.last_seen,
			})
			.collect())
	}

	pub async fn item_metrics(&self, range: TimeRange, limit: usize) -> Result<Vec<ItemSummary>> {
		let events = self.events.list(range).await?;
		let mut items = item_summaries(&events);

		items.truncate(limit);

		Ok(items)
	}

	pub async fn ctr_over_time(
		&self,
		range: TimeRange,
		interval: CtrInterval,
	) -> Result<Vec<CtrPoint>> {
		let events = self.events.list(range).await?;

		Ok(ctr_series(&events, interval))
	}

	/// Totals, leaders, and poor performers for `range`. `limit` bounds every list.
	pub async fn report(&self, range: TimeRange, limit: usize) -> Result<AnalyticsReport> {
		let events = self.events.list(range).await?;
		let summaries = summarize_events(&events, 1, &self.cfg);
		let total_searches = summaries.iter().map(|summary| summary.searches).sum::<u64>();
		let total_clicks = summaries.iter().map(|summary| summary.clicks).sum::<u64>();
		let total_carts = summaries.iter().map(|summary| summary.carts).sum::<u64>();
		let total_purchases = summaries.iter().map(|summary| summary.purchases).sum::<u64>();
		let zero_result_queries = summaries.iter().filter(|summary| summary.zero_result).count();
		let mut poor_performing_queries = summaries
			.iter()
			.filter(|summary| summary.is_poor_performing())
			.cloned()
			.collect::<Vec<_>>();

		poor_performing_queries.sort_by(|left, right| {
			left.ctr
				.total_cmp(&right.ctr)
				.then_with(|| right.conversion_rate.total_cmp(&left.conversion_rate))
				.then_with(|| left.query.cmp(&right.query))
		});
		poor_performing_queries.truncate(limit);

		let items = item_summaries(&events);
		let mut top_viewed_items = items.clone();
		let mut top_converted_items = items;

		top_viewed_items.sort_by(|left, right| by_count_desc(left.clicks, right.clicks, left, right));
		top_viewed_items.truncate(limit);
		top_converted_items
			.sort_by(|left, right| by_count_desc(left.purchases, right.purchases, left, right));
		top_converted_items.truncate(limit);

		let total_queries = summaries.len();
		let mut top_queries = summaries;

		top_queries.truncate(limit);

		Ok(AnalyticsReport {
			range,
			total_queries,
			total_searches,
			total_clicks,
			total_carts,
			total_purchases,
			overall_ctr: ratio(total_clicks, total_searches),
			overall_conversion_rate: ratio(total_purchases, total_clicks),
			zero_result_queries,
			top_queries,
			poor_performing_queries,
			top_viewed_items,
			top_converted_items,
			ctr_over_time: ctr_series(&events, CtrInterval::Hour),
		})
	}
}

#[derive(Default)]
struct QueryTally {
	searches: u64,
	clicks: u64,
	carts: u64,
	purchases: u64,
	dwell_ms: u64,
	dwell_events: u64,
	sessions: HashSet<String>,
	first_seen: Option<OffsetDateTime>,
	last_seen: Option<OffsetDateTime>,
}

struct SearchInstance {
	query: String,
	clicked: bool,
}

/// Aggregates `events` (ordered by timestamp) per query string, keeping queries with at least
/// `min_searches` searches.
///
/// A query-level SEARCH is a SEARCH without an item. Other events count toward the query they
/// carry, or else toward the latest query-level SEARCH of the same session at or before them.
pub fn summarize_events(
	events: &[BehaviorEvent],
	min_searches: u64,
	cfg: &sift_config::Analytics,
) -> Vec<QuerySummary> {
	let mut tallies: HashMap<String, QueryTally> = HashMap::new();
	let mut instances: Vec<SearchInstance> = Vec::new();
	let mut latest_by_session: HashMap<&str, usize> = HashMap::new();

	for event in events {
		match (event.event_type, event.item_id.as_deref()) {
			(EventType::Search, None) => {
				let Some(query) = event.query_text() else {
					continue;
				};
				let tally = tallies.entry(query.to_string()).or_default();

				tally.searches += 1;
				tally.sessions.insert(event.session_id.clone());
				tally.first_seen =
					Some(tally.first_seen.map_or(event.timestamp, |at| at.min(event.timestamp)));
				tally.last_seen =
					Some(tally.last_seen.map_or(event.timestamp, |at| at.max(event.timestamp)));

				latest_by_session.insert(event.session_id.as_str(), instances.len());
				instances.push(SearchInstance { query: query.to_string(), clicked: false });
			},
			(EventType::Search, Some(_)) => {},
			(event_type, _) => {
				let latest = latest_by_session.get(event.session_id.as_str()).copied();
				let (query, instance) = match event.query_text() {
					Some(query) => {
						let instance = latest.filter(|&index| instances[index].query == query);

						(query.to_string(), instance)
					},
					None => match latest {
						Some(index) => (instances[index].query.clone(), Some(index)),
						None => continue,
					},
				};
				let tally = tallies.entry(query).or_default();

				match event_type {
					EventType::Click => {
						tally.clicks += 1;

						if let Some(index) = instance {
							instances[index].clicked = true;
						}
					},
					EventType::AddToCart => tally.carts += 1,
					EventType::Purchase => tally.purchases += 1,
					EventType::Bounce | EventType::Search => {},
				}

				if let Some(dwell_ms) = event.dwell_ms() {
					tally.dwell_ms = tally.dwell_ms.saturating_add(dwell_ms);
					tally.dwell_events += 1;
				}
			},
		}
	}

	let mut unclicked: HashMap<&str, u64> = HashMap::new();

	for instance in instances.iter().filter(|instance| !instance.clicked) {
		*unclicked.entry(instance.query.as_str()).or_default() += 1;
	}

	let conversion_min_searches = cfg.low_conversion_min_searches.max(min_searches);
	let mut summaries = tallies
		.iter()
		.filter(|(_, tally)| tally.searches >= min_searches.max(1))
		.filter_map(|(query, tally)| {
			let ctr = ratio(tally.clicks, tally.searches);
			let conversion_rate = ratio(tally.purchases, tally.clicks);
			let avg_dwell_time = if tally.dwell_events == 0 {
				0.0
			} else {
				tally.dwell_ms as f64 / 1_000.0 / tally.dwell_events as f64
			};

			Some(QuerySummary {
				query: query.clone(),
				searches: tally.searches,
				clicks: tally.clicks,
				carts: tally.carts,
				purchases: tally.purchases,
				sessions: tally.sessions.len() as u64,
				zero_result_count: unclicked.get(query.as_str()).copied().unwrap_or(0),
				ctr,
				conversion_rate,
				avg_dwell_time,
				first_seen: tally.first_seen?,
				last_seen: tally.last_seen?,
				low_ctr: ctr < cfg.low_ctr_threshold,
				zero_result: tally.clicks == 0,
				low_conversion: conversion_rate < cfg.low_conversion_threshold
					&& tally.searches >= conversion_min_searches,
			})
		})
		.collect::<Vec<_>>();

	summaries.sort_by(|left, right| {
		right.searches.cmp(&left.searches).then_with(|| left.query.cmp(&right.query))
	});

	summaries
}

/// Per-item counts, most shown first.
pub fn item_summaries(events: &[BehaviorEvent]) -> Vec<ItemSummary> {
	let mut items: HashMap<&str, ItemSummary> = HashMap::new();

	for event in events {
		let Some(item_id) = event.item_id.as_deref() else {
			continue;
		};
		let item = items.entry(item_id).or_insert_with(|| ItemSummary {
			item_id: item_id.to_string(),
			appearances: 0,
			clicks: 0,
			carts: 0,
			purchases: 0,
			bounces: 0,
			ctr: 0.0,
		});

		match event.event_type {
			EventType::Search => item.appearances += 1,
			EventType::Click => item.clicks += 1,
			EventType::AddToCart => item.carts += 1,
			EventType::Purchase => item.purchases += 1,
			EventType::Bounce => item.bounces += 1,
		}
	}

	let mut items = items
		.into_values()
		.map(|mut item| {
			item.ctr = ratio(item.clicks, item.appearances);

			item
		})
		.collect::<Vec<_>>();

	items.sort_by(|left, right| by_count_desc(left.appearances, right.appearances, left, right));

	items
}

/// Query-level searches against clicks per UTC bucket, oldest first.
pub fn ctr_series(events: &[BehaviorEvent], interval: CtrInterval) -> Vec<CtrPoint> {
	let mut buckets: BTreeMap<OffsetDateTime, (u64, u64)> = BTreeMap::new();

	for event in events {
		let is_query_search = event.event_type == EventType::Search && event.item_id.is_none();
		let is_click = event.event_type == EventType::Click;

		if !is_query_search && !is_click {
			continue;
		}

		let bucket = buckets.entry(interval.bucket_start(event.timestamp)).or_default();

		if is_query_search {
			bucket.0 += 1;
		} else {
			bucket.1 += 1;
		}
	}

	buckets
		.into_iter()
		.map(|(bucket_start, (searches, clicks))| CtrPoint {
			bucket_start,
			searches,
			clicks,
			ctr: ratio(clicks, searches),
		})
		.collect()
}

fn by_count_desc(
	left_count: u64,
	right_count: u64,
	left: &ItemSummary,
	right: &ItemSummary,
) -> Ordering {
	right_count.cmp(&left_count).then_with(|| left.item_id.cmp(&right.item_id))
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
	(numerator as f64 / denominator.max(1) as f64).clamp(0.0, 1.0)
}
