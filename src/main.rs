use tracing::info;

use tarn::link::config::LinkConfig;
use tarn::link::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::var("TARN_CONFIG").unwrap_or_else(|_| "tarn.toml".to_string());
    let config = LinkConfig::load(&config_path)?;

    info!(
        server = %config.server_name,
        version = server::SERVER_VERSION,
        "tarnd starting"
    );
    server::run(config, Some(config_path.into())).await
}
