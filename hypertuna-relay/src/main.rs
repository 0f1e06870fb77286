use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (HYPERTUNA_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("HYPERTUNA_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("hypertuna_relay=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = hypertuna_relay::config::WorkerConfig::parse();
    tracing::info!("Starting relay worker, gateway on {}", config.gateway_addr);

    let worker = hypertuna_relay::worker::Worker::new(config);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = worker.run(stdin, stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down...");
            Ok(())
        }
    }
}
