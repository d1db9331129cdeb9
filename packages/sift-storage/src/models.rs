use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use sift_domain::{BehaviorEvent, BehaviorRecord, EventType};

use crate::{DeadLetter, Error, Result};

#[derive(Debug, sqlx::FromRow)]
pub struct ItemMetricsRow {
	pub item_id: String,
	pub total_searches_seen: i64,
	pub total_clicks: i64,
	pub total_carts: i64,
	pub total_purchases: i64,
	pub total_bounces: i64,
	pub total_dwell_ms: i64,
	pub last_updated: Option<OffsetDateTime>,
}
impl TryFrom<ItemMetricsRow> for BehaviorRecord {
	type Error = Error;

	fn try_from(row: ItemMetricsRow) -> Result<Self> {
		let counter = |label: &str, value: i64| {
			u64::try_from(value).map_err(|_| {
				Error::InvalidArgument(format!(
					"Stored {label} for item {:?} is negative: {value}.",
					row.item_id
				))
			})
		};

		Ok(Self {
			total_searches_seen: counter("total_searches_seen", row.total_searches_seen)?,
			total_clicks: counter("total_clicks", row.total_clicks)?,
			total_carts: counter("total_carts", row.total_carts)?,
			total_purchases: counter("total_purchases", row.total_purchases)?,
			total_bounces: counter("total_bounces", row.total_bounces)?,
			total_dwell_ms: counter("total_dwell_ms", row.total_dwell_ms)?,
			last_updated: row.last_updated,
			item_id: row.item_id,
		})
	}
}

#[derive(Debug, sqlx::FromRow)]
pub struct BehaviorEventRow {
	pub event_id: Uuid,
	pub event_type: String,
	pub item_id: Option<String>,
	pub query: Option<String>,
	pub session_id: String,
	pub user_id: Option<String>,
	pub ts: OffsetDateTime,
	pub dwell_time: Option<f64>,
}
impl TryFrom<BehaviorEventRow> for BehaviorEvent {
	type Error = Error;

	fn try_from(row: BehaviorEventRow) -> Result<Self> {
		let event_type = row.event_type.parse::<EventType>().map_err(|message| {
			Error::InvalidArgument(format!("Stored event {} is unreadable: {message}", row.event_id))
		})?;

		Ok(Self {
			event_id: row.event_id,
			event_type,
			item_id: row.item_id,
			query: row.query,
			session_id: row.session_id,
			user_id: row.user_id,
			timestamp: row.ts,
			dwell_time: row.dwell_time,
		})
	}
}

#[derive(Debug, sqlx::FromRow)]
pub struct DeadLetterRow {
	pub dead_letter_id: Uuid,
	pub event_id: Uuid,
	pub event: Value,
	pub attempts: i32,
	pub last_error: String,
	pub failed_at: OffsetDateTime,
}
impl TryFrom<DeadLetterRow> for DeadLetter {
	type Error = Error;

	fn try_from(row: DeadLetterRow) -> Result<Self> {
		Ok(Self {
			dead_letter_id: row.dead_letter_id,
			event: serde_json::from_value(row.event)?,
			attempts: u32::try_from(row.attempts).unwrap_or(0),
			last_error: row.last_error,
			failed_at: row.failed_at,
		})
	}
}

#[derive(Debug, sqlx::FromRow)]
pub struct EventOutboxEntry {
	pub outbox_id: Uuid,
	pub event_id: Uuid,
	pub event: Value,
	pub status: String,
	pub attempts: i32,
	pub last_error: Option<String>,
	pub available_at: OffsetDateTime,
	pub created_at: OffsetDateTime,
	pub updated_at: OffsetDateTime,
}
impl EventOutboxEntry {
	pub fn decode_event(&self) -> Result<BehaviorEvent> {
		Ok(serde_json::from_value(self.event.clone())?)
	}
}
