pub mod worker;

use clap::Parser;

use sift_service::Stores;
use sift_storage::db::Db;

/// Drains spilled interaction events from the Postgres outbox into the behavior stores.
#[derive(Debug, Parser)]
#[command(
	version = sift_cli::VERSION,
	rename_all = "kebab",
	styles = sift_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: std::path::PathBuf,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = sift_config::load(&args.config)?;

	sift_cli::init_tracing(&config.service.log_level);

	let db = Db::connect(&config.storage.postgres).await?;

	db.ensure_schema().await?;

	let state = worker::WorkerState {
		stores: Stores::postgres(db.clone()),
		db,
		ingest: config.ingest,
		max_recent_items: config.personalization.max_recent_items as usize,
	};

	worker::run_worker(state).await
}
