pub fn render_schema() -> String {
	expand_includes(include_str!("../../../sql/init.sql"))
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"tables/001_item_behavior_metrics.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_item_behavior_metrics.sql")),
				"tables/002_applied_events.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_applied_events.sql")),
				"tables/003_behavior_events.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_behavior_events.sql")),
				"tables/004_event_dead_letters.sql" =>
					out.push_str(include_str!("../../../sql/tables/004_event_dead_letters.sql")),
				"tables/005_user_profiles.sql" =>
					out.push_str(include_str!("../../../sql/tables/005_user_profiles.sql")),
				"tables/006_event_outbox.sql" =>
					out.push_str(include_str!("../../../sql/tables/006_event_outbox.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn schema_expands_every_include() {
		let sql = render_schema();

		assert!(!sql.contains("\\ir "));

		for table in [
			"item_behavior_metrics",
			"applied_events",
			"behavior_events",
			"event_dead_letters",
			"user_profiles",
			"event_outbox",
		] {
			assert!(sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")), "Missing {table}.");
		}
	}
}
