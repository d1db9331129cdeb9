use clap::Parser;

use sift_worker::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	sift_worker::run(Args::parse()).await
}
