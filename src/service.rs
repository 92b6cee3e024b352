use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use data_model::FunctionRegistry;
use metrics::{gateway_stats, init_provider};
use prometheus::Registry;
use tokio::{signal, sync::watch};
use tracing::{error, info};

use crate::{
    config::GatewayConfig,
    discovery::{AddressPublisher, FilePublisher},
    dispatch::DispatchCore,
    engine::{bind_engine_listener, run_engine_listener},
    node_manager::GatewayNodeManager,
    routes::{create_grpc_routes, create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: GatewayConfig,
    pub registry: Arc<FunctionRegistry>,
    pub node_manager: Arc<GatewayNodeManager>,
    pub core: Arc<DispatchCore>,
    pub stats: Arc<gateway_stats::Metrics>,
    pub metrics_registry: Arc<Registry>,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
}

impl Service {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let metrics_registry = Arc::new(init_provider()?);
        let registry = Arc::new(
            FunctionRegistry::from_path(&config.func_config_path)
                .context("error loading function config")?,
        );
        info!(functions = registry.entries().len(), "loaded function config");

        let node_manager = Arc::new(GatewayNodeManager::new(config.max_inflight_per_node));
        let stats = Arc::new(gateway_stats::Metrics::new());
        let core = Arc::new(DispatchCore::new(
            registry.clone(),
            node_manager.clone(),
            stats.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        Ok(Self {
            config,
            registry,
            node_manager,
            core,
            stats,
            metrics_registry,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn start(&self) -> Result<()> {
        let engine_addr: SocketAddr = format!(
            "{}:{}",
            self.config.listen_addr, self.config.engine_port
        )
        .parse()?;
        let engine_listener = bind_engine_listener(engine_addr, self.config.listen_backlog)
            .with_context(|| format!("failed to listen on {engine_addr} for engine connections"))?;
        info!(%engine_addr, "listening for engine connections");
        tokio::spawn(run_engine_listener(
            engine_listener,
            self.core.clone(),
            self.node_manager.clone(),
            self.config.engine_queue_depth,
            self.shutdown_rx.clone(),
        ));

        let publisher = self
            .config
            .discovery_path
            .as_ref()
            .map(|path| Arc::new(FilePublisher::new(path)));
        if let Some(publisher) = &publisher {
            publisher
                .publish(&format!("{}:{}", self.config.hostname, self.config.engine_port))
                .context("error publishing gateway address")?;
        }

        let route_state = RouteState {
            core: self.core.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            metrics_registry: self.metrics_registry.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            if let Some(publisher) = publisher {
                publisher.retract();
            }
        });

        if let Some(grpc_port) = self.config.grpc_port {
            let grpc_addr: SocketAddr =
                format!("{}:{}", self.config.listen_addr, grpc_port).parse()?;
            let grpc_routes = create_grpc_routes(route_state.clone());
            let grpc_handle = handle.clone();
            info!(%grpc_addr, "listening for gRPC-flavored requests");
            tokio::spawn(async move {
                if let Err(e) = axum_server::bind(grpc_addr)
                    .handle(grpc_handle)
                    .serve(grpc_routes.into_make_service())
                    .await
                {
                    error!("gRPC listener failed: {e}");
                }
            });
        }

        let http_addr: SocketAddr = format!(
            "{}:{}",
            self.config.listen_addr, self.config.http_port
        )
        .parse()?;
        info!(%http_addr, "listening for HTTP requests");
        axum_server::bind(http_addr)
            .handle(handle)
            .serve(create_routes(route_state).into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down gateway gracefully");
}
