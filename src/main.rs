use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod config;
mod connections;
mod discovery;
mod dispatch;
mod engine;
mod http_objects;
mod node_manager;
mod routes;
mod service;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file")]
    config: Option<PathBuf>,
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match config::GatewayConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config: {e:#}");
                std::process::exit(1);
            }
        },
        None => config::GatewayConfig::default(),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let service = match service::Service::new(config) {
            Ok(service) => service,
            Err(e) => {
                error!("failed to initialize gateway: {e:#}");
                std::process::exit(1);
            }
        };
        if let Err(e) = service.start().await {
            error!("error running gateway: {e:#}");
            std::process::exit(1);
        }
    });
}
