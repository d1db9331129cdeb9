use color_eyre::{Result, eyre};

const SYSTEM_PROMPT: &str = "You explain briefly why a product matches a search query.";

/// One or two sentences on why `item_id` was shown for `query`. `context` carries the item
/// description and its score breakdown.
pub async fn explain(
	cfg: &sift_config::LlmProviderConfig,
	query: &str,
	item_id: &str,
	context: &str,
) -> Result<String> {
	let prompt = format!(
		"Explain in one or two sentences why this product is relevant to the search query.\n\n\
		 Query: {query}\nProduct ID: {item_id}\n{context}"
	);
	let content = crate::chat::complete(cfg, SYSTEM_PROMPT, &prompt, false).await?;

	if content.is_empty() {
		return Err(eyre::eyre!("Explanation response is empty."));
	}

	Ok(content)
}
