use std::net::IpAddr;

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the engine, HTTP and gRPC listeners bind to.
    pub listen_addr: String,
    pub http_port: u16,
    /// Optional; the gRPC-flavored listener is absent when not configured.
    pub grpc_port: Option<u16>,
    pub engine_port: u16,
    /// Hostname advertised to engines through discovery.
    pub hostname: String,
    /// Path to the function config document (JSON array of entries).
    pub func_config_path: String,
    /// Size of the I/O worker pool backing the runtime.
    pub io_workers: usize,
    pub listen_backlog: u32,
    /// Per-node cap on dispatched-but-unfinished calls.
    pub max_inflight_per_node: usize,
    /// Outbound frame queue depth per engine connection.
    pub engine_queue_depth: usize,
    /// Where to publish the gateway address for engines; discovery is
    /// skipped when unset.
    pub discovery_path: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_addr: "0.0.0.0".to_string(),
            http_port: 8080,
            grpc_port: None,
            engine_port: 10007,
            hostname: "localhost".to_string(),
            func_config_path: "func_config.json".to_string(),
            io_workers: 4,
            listen_backlog: 1024,
            max_inflight_per_node: 32,
            engine_queue_depth: 256,
            discovery_path: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_path(path: &str) -> Result<GatewayConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<IpAddr>().is_err() {
            return Err(anyhow::anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.io_workers == 0 {
            return Err(anyhow::anyhow!("io_workers must be positive"));
        }
        if self.max_inflight_per_node == 0 {
            return Err(anyhow::anyhow!("max_inflight_per_node must be positive"));
        }
        if self.engine_queue_depth == 0 {
            return Err(anyhow::anyhow!("engine_queue_depth must be positive"));
        }
        if self.func_config_path.is_empty() {
            return Err(anyhow::anyhow!("func_config_path must be set"));
        }
        Ok(())
    }
}
