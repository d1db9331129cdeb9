use color_eyre::{Result, eyre};

const SYSTEM_PROMPT: &str =
	"You expand product search queries so that semantic retrieval finds more relevant items.";

pub async fn expand(cfg: &sift_config::LlmProviderConfig, query: &str) -> Result<String> {
	let prompt = format!(
		"Rewrite the search query below into one expanded query. Add synonyms and closely related \
		 terms, keep the original intent, and answer with the expanded query only.\n\nQuery: {query}"
	);
	let content = crate::chat::complete(cfg, SYSTEM_PROMPT, &prompt, false).await?;

	parse_expansion(&content)
}

/// Strips labels and quoting models tend to wrap around the answer.
pub fn parse_expansion(content: &str) -> Result<String> {
	let mut text = content.trim();

	for label in ["Expanded query:", "Expanded Query:", "Query:"] {
		if let Some(rest) = text.strip_prefix(label) {
			text = rest.trim();
		}
	}

	let text = text.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();

	if text.is_empty() {
		return Err(eyre::eyre!("Expansion response is empty."));
	}

	Ok(text.to_string())
}
