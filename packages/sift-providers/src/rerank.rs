use color_eyre::{Result, eyre};
use serde_json::Value;

const SYSTEM_PROMPT: &str = "You rank products by relevance to a search query. Always respond with valid JSON.";

/// Asks the model to order `item_ids` by relevance. `documents[i]` describes `item_ids[i]`.
pub async fn rerank(
	cfg: &sift_config::LlmProviderConfig,
	query: &str,
	item_ids: &[String],
	documents: &[String],
) -> Result<Vec<String>> {
	if item_ids.len() != documents.len() {
		return Err(eyre::eyre!("Rerank input has mismatched ids and documents."));
	}

	let listing = item_ids
		.iter()
		.zip(documents)
		.enumerate()
		.map(|(position, (item_id, document))| format!("{}. ID: {item_id}. {document}", position + 1))
		.collect::<Vec<_>>()
		.join("\n");
	let prompt = format!(
		"Rank the products below by relevance to the query, most relevant first.\n\nQuery: \
		 {query}\n\nProducts:\n{listing}\n\nReturn a JSON object of the form \
		 {{\"ranked_ids\": [\"id1\", \"id2\"]}}."
	);
	let content = crate::chat::complete(cfg, SYSTEM_PROMPT, &prompt, true).await?;

	parse_ranked_ids(&content)
}

pub fn parse_ranked_ids(content: &str) -> Result<Vec<String>> {
	let json: Value = serde_json::from_str(content.trim())
		.map_err(|_| eyre::eyre!("Rerank content is not valid JSON."))?;
	let ids = json
		.get("ranked_ids")
		.or_else(|| json.get("ids"))
		.and_then(|v| v.as_array())
		.ok_or_else(|| eyre::eyre!("Rerank content is missing ranked_ids."))?;

	Ok(ids
		.iter()
		.filter_map(|id| match id {
			Value::String(id) => Some(id.trim().to_string()),
			Value::Number(id) => Some(id.to_string()),
			_ => None,
		})
		.filter(|id| !id.is_empty())
		.collect())
}
