use vidyasphere::app;
use vidyasphere::config::Config;

/// Main entry point for the VidyaSphere backend
///
/// Reads configuration from the environment and serves the API until the
/// process is stopped. `RUST_LOG` controls log verbosity (default `info`).
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load()?;
    app::run_with_config(config).await
}
