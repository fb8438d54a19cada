//! Voicebox gateway server binary.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use voicebox_gateway::{serve, AppState, Config};

/// Realtime voice-assistant gateway.
///
/// Relays browser push-to-talk audio to the Doubao realtime dialogue
/// service and streams synthesized audio and transcripts back. Configured
/// through the environment (DOUBAO_*, HOST, PORT, SAVE_HISTORY); the flags
/// below override the bind address.
#[derive(Parser)]
#[command(name = "voicebox")]
#[command(about = "Realtime voice-assistant gateway")]
#[command(version)]
struct Cli {
    /// Bind host (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config);
    serve(state, &addr).await?;
    Ok(())
}
