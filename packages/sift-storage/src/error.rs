#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Conflict: {0}")]
	Conflict(String),
	#[error("Unavailable: {0}")]
	Unavailable(String),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Qdrant(#[from] Box<qdrant_client::QdrantError>),
}
impl Error {
	/// Whether retrying the same operation later can succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Sqlx(err) => !matches!(
				err,
				sqlx::Error::ColumnDecode { .. }
					| sqlx::Error::ColumnNotFound(_)
					| sqlx::Error::Decode(_)
					| sqlx::Error::TypeNotFound { .. }
			),
			Self::Unavailable(_) | Self::Conflict(_) | Self::Qdrant(_) => true,
			Self::InvalidArgument(_) | Self::NotFound(_) | Self::Json(_) => false,
		}
	}
}
impl From<qdrant_client::QdrantError> for Error {
	fn from(err: qdrant_client::QdrantError) -> Self {
		Self::Qdrant(Box::new(err))
	}
}
impl From<sift_domain::Error> for Error {
	fn from(err: sift_domain::Error) -> Self {
		Self::InvalidArgument(err.to_string())
	}
}
