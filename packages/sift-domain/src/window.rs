use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Half-open time window `[start, end)`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimeRange {
	#[serde(with = "crate::time_serde")]
	pub start: OffsetDateTime,
	#[serde(with = "crate::time_serde")]
	pub end: OffsetDateTime,
}
impl TimeRange {
	pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
		Self { start, end }
	}

	/// The window of `days` days ending at `now`, inclusive of `now`.
	pub fn trailing_days(now: OffsetDateTime, days: i64) -> Self {
		Self { start: now - Duration::days(days), end: now + Duration::nanoseconds(1) }
	}

	pub fn contains(&self, at: OffsetDateTime) -> bool {
		self.start <= at && at < self.end
	}

	pub fn is_empty(&self) -> bool {
		self.end <= self.start
	}
}
