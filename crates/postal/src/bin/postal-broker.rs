//! postal-broker — the embedded pub/sub broker, standalone.
//!
//! # Usage
//!
//! ```bash
//! postal-broker
//! postal-broker --host 0.0.0.0 --port 5000
//! POSTAL_HOST=0.0.0.0 POSTAL_PORT=5000 postal-broker
//! ```

use clap::Parser;
use postal::broker::{Broker, DEFAULT_PORT};

/// Standalone embedded broker for the postal messaging layer.
#[derive(Parser, Debug)]
#[command(name = "postal-broker", version, about)]
struct Cli {
    /// Host/address to bind to.
    #[arg(long, env = "POSTAL_HOST", default_value = "0.0.0.0")]
    host: String,

    /// TCP port to bind to.
    #[arg(long, env = "POSTAL_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interval in seconds between broker summary log lines (0 = disabled).
    #[arg(long, default_value_t = 30)]
    metrics_interval_secs: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(host = %cli.host, port = cli.port, "starting postal-broker");

    let broker = Broker::bind(&cli.host, cli.port)?;
    let local_addr = broker.local_addr()?;
    let handle = broker.spawn()?;
    tracing::info!(%local_addr, "postal-broker listening");

    // Blocks forever; the process is expected to be stopped by signal
    // (SIGINT/SIGTERM), same as the reference broker's lifetime.
    if cli.metrics_interval_secs == 0 {
        handle.join();
        return Ok(());
    }
    loop {
        std::thread::sleep(std::time::Duration::from_secs(cli.metrics_interval_secs));
        tracing::info!(%local_addr, "postal-broker alive");
    }
}
