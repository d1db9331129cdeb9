use std::time::Duration;

use color_eyre::{Result, eyre};
use reqwest::Client;
use serde_json::{Value, json};

/// Sends one OpenAI-compatible chat completion and returns the first choice's content.
pub async fn complete(
	cfg: &sift_config::LlmProviderConfig,
	system: &str,
	user: &str,
	json_mode: bool,
) -> Result<String> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let mut body = json!({
		"model": cfg.model,
		"temperature": cfg.temperature,
		"messages": [
			{ "role": "system", "content": system },
			{ "role": "user", "content": user },
		],
	});

	if json_mode {
		body["response_format"] = json!({ "type": "json_object" });
	}

	let res = client
		.post(url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_chat_content(&json)
}

pub fn parse_chat_content(json: &Value) -> Result<String> {
	let content = json
		.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|choices| choices.first())
		.and_then(|choice| choice.get("message"))
		.and_then(|message| message.get("content"))
		.and_then(|content| content.as_str())
		.ok_or_else(|| eyre::eyre!("Chat response is missing choice content."))?;

	Ok(content.trim().to_string())
}
