use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	Search,
	Click,
	AddToCart,
	Purchase,
	Bounce,
}
impl EventType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Search => "search",
			Self::Click => "click",
			Self::AddToCart => "add_to_cart",
			Self::Purchase => "purchase",
			Self::Bounce => "bounce",
		}
	}

	pub fn requires_item(self) -> bool {
		!matches!(self, Self::Search)
	}

	pub fn carries_dwell_time(self) -> bool {
		matches!(self, Self::Click | Self::Bounce)
	}
}
impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for EventType {
	type Err = String;

	fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"search" => Ok(Self::Search),
			"click" => Ok(Self::Click),
			"add_to_cart" => Ok(Self::AddToCart),
			"purchase" => Ok(Self::Purchase),
			"bounce" => Ok(Self::Bounce),
			other => Err(format!("Unknown event type {other:?}.")),
		}
	}
}

/// One user action. Events are immutable once recorded and identified by `event_id` for
/// idempotent replay.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BehaviorEvent {
	pub event_id: Uuid,
	pub event_type: EventType,
	#[serde(default)]
	pub item_id: Option<String>,
	#[serde(default)]
	pub query: Option<String>,
	pub session_id: String,
	#[serde(default)]
	pub user_id: Option<String>,
	#[serde(with = "crate::time_serde")]
	pub timestamp: OffsetDateTime,
	/// Seconds.
	#[serde(default)]
	pub dwell_time: Option<f64>,
}
impl BehaviorEvent {
	pub fn new(event_type: EventType, session_id: impl Into<String>) -> Self {
		Self {
			event_id: Uuid::new_v4(),
			event_type,
			item_id: None,
			query: None,
			session_id: session_id.into(),
			user_id: None,
			timestamp: OffsetDateTime::now_utc(),
			dwell_time: None,
		}
	}

	pub fn with_id(mut self, event_id: Uuid) -> Self {
		self.event_id = event_id;

		self
	}

	pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
		self.item_id = Some(item_id.into());

		self
	}

	pub fn with_query(mut self, query: impl Into<String>) -> Self {
		self.query = Some(query.into());

		self
	}

	pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());

		self
	}

	pub fn with_dwell_time(mut self, seconds: f64) -> Self {
		self.dwell_time = Some(seconds);

		self
	}

	pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
		self.timestamp = timestamp;

		self
	}

	/// Query text with surrounding whitespace removed, `None` when absent or blank.
	pub fn query_text(&self) -> Option<&str> {
		self.query.as_deref().map(str::trim).filter(|query| !query.is_empty())
	}

	/// Dwell time in whole milliseconds, only for event types where it is meaningful.
	pub fn dwell_ms(&self) -> Option<u64> {
		if !self.event_type.carries_dwell_time() {
			return None;
		}

		self.dwell_time
			.filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
			.map(|seconds| (seconds * 1_000.0).round() as u64)
	}

	/// Rejects events that would corrupt aggregates. Runs at the ingestion boundary.
	pub fn validate(&self) -> Result<()> {
		if self.session_id.trim().is_empty() {
			return Err(self.invalid("session_id must be non-empty."));
		}

		match self.item_id.as_deref() {
			Some(item_id) if item_id.trim().is_empty() =>
				return Err(self.invalid("item_id must be non-empty when present.")),
			None if self.event_type.requires_item() =>
				return Err(
					self.invalid(&format!("{} events must reference an item.", self.event_type))
				),
			_ => {},
		}

		if let Some(seconds) = self.dwell_time {
			if !seconds.is_finite() {
				return Err(self.invalid("dwell_time must be a finite number."));
			}
			if seconds < 0.0 {
				return Err(self.invalid("dwell_time must be zero or greater."));
			}
		}

		Ok(())
	}

	fn invalid(&self, message: &str) -> Error {
		Error::InvalidEvent { event_id: self.event_id, message: message.to_string() }
	}
}
