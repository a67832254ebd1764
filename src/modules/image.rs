//! Image provisioning through the external image tool.
//!
//! The tool is the only record of which instances exist. Instances are
//! named after the volume identifier, so `release` needs nothing but the
//! identifier that `provision` was given.

use super::config::DriverConfig;
use super::constants::{NOT_FOUND_MARKERS, TOOL_CREATE, TOOL_DELETE, TOOL_MOUNT};
use super::error::{VolumeError, VolumeResult};
use super::exec::CommandRunner;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;

/// Creates and deletes image instances keyed by volume identifier.
#[derive(Clone)]
pub struct ImageProvisioner {
    config: Arc<DriverConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl ImageProvisioner {
    /// Creates a provisioner that invokes the configured tool through `runner`.
    pub fn new(config: Arc<DriverConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Pulls `image_ref` into an instance named `volume_id` and returns its root path.
    ///
    /// # Errors
    ///
    /// Propagates invoker failures unchanged. Empty tool output is an internal error.
    pub async fn provision(&self, volume_id: &str, image_ref: &str) -> VolumeResult<PathBuf> {
        let args = vec![
            TOOL_CREATE.to_string(),
            "--name".to_string(),
            volume_id.to_string(),
            "--pull".to_string(),
            image_ref.to_string(),
        ];
        let output = self.invoke(&args).await?;

        let output = if self.config.resolve_root_with_mount {
            self.invoke(&[TOOL_MOUNT.to_string(), volume_id.to_string()])
                .await?
        } else {
            output
        };

        let root = parse_root(&output).ok_or_else(|| {
            VolumeError::internal(format!(
                "image tool returned no root path for volume {}",
                volume_id
            ))
        })?;
        debug!("Volume {} provisioned at {}", volume_id, root.display());
        Ok(root)
    }

    /// Deletes the instance named `volume_id`.
    ///
    /// An instance that is already gone counts as released.
    pub async fn release(&self, volume_id: &str) -> VolumeResult<()> {
        let args = vec![TOOL_DELETE.to_string(), volume_id.to_string()];
        match self.invoke(&args).await {
            Ok(_) => {
                debug!("Volume {} released", volume_id);
                Ok(())
            }
            Err(VolumeError::ProcessFailure { ref output, .. }) if is_not_found(output) => {
                info!("Volume {} was already released", volume_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn invoke(&self, args: &[String]) -> VolumeResult<Vec<u8>> {
        self.runner
            .run(&self.config.tool_path, args, self.config.timeout)
            .await
    }
}

fn parse_root(output: &[u8]) -> Option<PathBuf> {
    let text = String::from_utf8_lossy(output);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn is_not_found(output: &str) -> bool {
    let output = output.to_lowercase();
    NOT_FOUND_MARKERS
        .iter()
        .any(|marker| output.contains(marker))
}
