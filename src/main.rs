use clap::Parser; // for cli
use quotes_gateway::config::{Args, GatewayConfig};
use tracing_subscriber::EnvFilter;

// this is main async function with tokio
#[tokio::main]
async fn main() {
    // parse cli arguments
    let args = Args::parse();
    let config = GatewayConfig::from(args);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Err(e) = quotes_gateway::server::run(config).await {
        tracing::error!("gateway error: {e}");
        std::process::exit(1);
    }
}
