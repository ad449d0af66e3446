use anyhow::Result;
use orbit::{auth::state::generate_nonce, config::Config, crypto::SECRET_LEN, server};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // Check for subcommands
    if args.len() >= 2 {
        match args[1].as_str() {
            "secret" => {
                // Alphanumeric, so its byte length equals its char length
                println!("{}", generate_nonce(SECRET_LEN)?);
                return Ok(());
            }
            "serve" => {}
            other => {
                eprintln!("Unknown command: {}", other);
                eprintln!("Usage: orbit [serve|secret]");
                std::process::exit(1);
            }
        }
    }

    // Load configuration before logging so the configured level applies
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!("Orbit v{}", orbit::VERSION);
    info!("Configuration loaded");
    info!("  HTTP: {}", config.server.bind);
    info!("  OAuth client: {}", config.oauth.client_id);
    info!("  Login state TTL: {}s", config.oauth.state_ttl_secs);

    server::run(config).await?;

    Ok(())
}
