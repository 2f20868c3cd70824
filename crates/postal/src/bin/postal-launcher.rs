//! postal-launcher — development launcher: starts the embedded broker plus
//! a couple of demo publisher/subscriber clients against it, for manual
//! smoke testing of a `postal.toml` configuration.
//!
//! # Usage
//!
//! ```bash
//! postal-launcher
//! postal-launcher --config path/to/postal.toml
//! ```

use std::time::Duration;

use clap::Parser;
use postal::{create_post_office, Broker, PostalConfig};

/// Starts the embedded broker and a demo producer/consumer pair against it.
#[derive(Parser, Debug)]
#[command(name = "postal-launcher", version, about)]
struct Cli {
    /// Path to the postal configuration file.
    #[arg(long, default_value = "postal.toml")]
    config: String,

    /// Topic the demo producer/consumer pair exchanges messages on.
    #[arg(long, default_value = "postal.demo")]
    demo_topic: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match PostalConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, path = %cli.config, "failed to load config, using defaults");
            PostalConfig::default()
        }
    };

    let bind_host = if config.server_host.is_empty() {
        "0.0.0.0"
    } else {
        config.effective_host()
    };
    let broker = Broker::bind(bind_host, config.server_port)?;
    let local_addr = broker.local_addr()?;
    let broker_handle = broker.spawn()?;
    tracing::info!(%local_addr, "postal-launcher: embedded broker listening");

    let mut demo_config = config.clone();
    demo_config.server_port = local_addr.port();
    demo_config.server_host = if local_addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        local_addr.ip().to_string()
    };

    let consumer_config = demo_config.clone();
    let topic = cli.demo_topic.clone();
    let consumer = std::thread::spawn(move || {
        let mut office = create_post_office(consumer_config, "postal-launcher-consumer");
        office.subscribe(&topic);
        for _ in 0..5 {
            if let Some(msg) = office.receive(Duration::from_secs(5)) {
                tracing::info!(
                    topic = msg.topic(),
                    bytes = msg.payload().len(),
                    "demo consumer received message"
                );
            }
        }
        office.close();
    });

    std::thread::sleep(Duration::from_millis(300));

    let mut producer = create_post_office(demo_config, "postal-launcher-producer");
    for i in 0..5 {
        let payload = format!("demo message {i}");
        if producer.publish(&cli.demo_topic, payload.as_bytes()) {
            tracing::info!(i, "demo producer published message");
        } else {
            tracing::warn!(error = %producer.error(), "demo producer publish failed");
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    producer.close();

    let _ = consumer.join();

    tracing::info!("postal-launcher demo run complete; broker keeps running");
    broker_handle.join();
    Ok(())
}
