mod config;
mod metrics;
mod worker;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "SPAN_BUFFER_CONFIG", default_value = "span-buffer.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = config::Config::load(&args.config)?;

    // Logs go to stderr; stdout carries flushed segments
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.general.log_level)?)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Loaded config from {:?}", args.config);
    worker::run(config).await
}
