pub mod db;
pub mod memory;
pub mod models;
pub mod outbox;
pub mod pg;
pub mod qdrant;
pub mod schema;
pub mod store;

mod error;

pub use error::Error;
pub use store::{
	ApplyOutcome, DeadLetter, DeadLetterSink, EventLog, EventSpill, MetricsStore, ProfileStore,
};

use std::{future::Future, pin::Pin};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
