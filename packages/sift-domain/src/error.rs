use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid event {event_id}: {message}")]
	InvalidEvent { event_id: Uuid, message: String },
	#[error("Invalid behavioral record for item {item_id}: {message}")]
	InvalidRecord { item_id: String, message: String },
}
