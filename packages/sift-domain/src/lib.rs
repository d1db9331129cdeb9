pub mod event;
pub mod profile;
pub mod record;
pub mod scoring;
pub mod time_serde;
pub mod window;

mod error;

pub use error::{Error, Result};
pub use event::{BehaviorEvent, EventType};
pub use profile::UserProfile;
pub use record::{BehaviorRecord, CounterField, Increment};
pub use scoring::{ScoreAdjustments, ScoreBreakdown, Weights};
pub use window::TimeRange;
