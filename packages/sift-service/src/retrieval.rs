use std::collections::HashMap;

use color_eyre::eyre;
use qdrant_client::qdrant::{
	Query, QueryPointsBuilder, ScoredPoint, Value, point_id::PointIdOptions, value::Kind,
};

use sift_config::EmbeddingProviderConfig;
use sift_providers::embedding;
use sift_storage::qdrant::{DENSE_VECTOR_NAME, ITEM_ID_PAYLOAD_KEY, QdrantStore};

use crate::{BoxFuture, Candidate, RetrievalProvider};

const SUMMARY_PAYLOAD_KEY: &str = "summary";

/// Dense nearest-neighbour retrieval over the catalog collection.
pub struct QdrantRetrieval {
	qdrant: QdrantStore,
	embedding: EmbeddingProviderConfig,
}
impl QdrantRetrieval {
	pub fn new(qdrant: QdrantStore, embedding: EmbeddingProviderConfig) -> Self {
		Self { qdrant, embedding }
	}
}
impl RetrievalProvider for QdrantRetrieval {
	fn retrieve<'a>(
		&'a self,
		query: &'a str,
		top_k: u32,
	) -> BoxFuture<'a, color_eyre::Result<Vec<Candidate>>> {
		Box::pin(async move {
			let vectors = embedding::embed(&self.embedding, &[query.to_string()]).await?;
			let Some(vector) = vectors.into_iter().next() else {
				return Err(eyre::eyre!("Embedding provider returned no vector."));
			};

			if vector.len() != self.qdrant.vector_dim as usize {
				return Err(eyre::eyre!("Embedding vector dimension mismatch."));
			}

			let search = QueryPointsBuilder::new(self.qdrant.collection.clone())
				.query(Query::new_nearest(vector))
				.using(DENSE_VECTOR_NAME)
				.limit(u64::from(top_k))
				.with_payload(true);
			let response = self.qdrant.client.query(search).await?;

			Ok(response.result.into_iter().filter_map(candidate_from_point).collect())
		})
	}
}

fn candidate_from_point(point: ScoredPoint) -> Option<Candidate> {
	let item_id = payload_string(&point.payload, ITEM_ID_PAYLOAD_KEY).or_else(|| {
		match point.id.as_ref()?.point_id_options.as_ref()? {
			PointIdOptions::Num(id) => Some(id.to_string()),
			PointIdOptions::Uuid(id) => Some(id.clone()),
		}
	})?;
	let summary = payload_string(&point.payload, SUMMARY_PAYLOAD_KEY);

	Some(Candidate { item_id, semantic_score: f64::from(point.score), summary })
}

fn payload_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
	match &payload.get(key)?.kind {
		Some(Kind::StringValue(text)) if !text.trim().is_empty() => Some(text.clone()),
		_ => None,
	}
}
