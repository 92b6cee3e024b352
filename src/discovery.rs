use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Where engines look up the gateway address. Publish on start, retract on
/// exit; the coordination-service client proper lives behind this seam.
pub trait AddressPublisher: Send + Sync {
    fn publish(&self, addr: &str) -> Result<()>;
    fn retract(&self);
}

/// Publishes the address as an ephemeral file under a shared directory.
pub struct FilePublisher {
    path: PathBuf,
}

impl FilePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AddressPublisher for FilePublisher {
    fn publish(&self, addr: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, addr)
            .with_context(|| format!("failed to publish gateway address to {}", self.path.display()))?;
        info!(addr, path = %self.path.display(), "published gateway address");
        Ok(())
    }

    fn retract(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to retract gateway address: {e}");
            }
        }
    }
}
