use std::io::Write;

use anyhow::Result;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::GatewayConfig, service::Service};

pub const TEST_FUNC_CONFIG: &str = r#"[
    {"funcName": "echo", "funcId": 7},
    {"funcName": "Greeter", "funcId": 9, "grpcMethods": ["SayHello"]}
]"#;

pub struct TestService {
    pub service: Service,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let func_config_path = temp_dir.path().join("func_config.json");
        let mut file = std::fs::File::create(&func_config_path)?;
        file.write_all(TEST_FUNC_CONFIG.as_bytes())?;

        let config = GatewayConfig {
            listen_addr: "127.0.0.1".to_string(),
            func_config_path: func_config_path.to_string_lossy().to_string(),
            ..Default::default()
        };
        let service = Service::new(config)?;

        Ok(Self {
            service,
            _temp_dir: temp_dir,
        })
    }
}
