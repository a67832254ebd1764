//! Volume lifecycle entry points.
//!
//! [`NodeServer`] validates requests, serializes work per volume identifier,
//! and sequences the [`ImageProvisioner`] and [`MountOrchestrator`]. Its
//! methods return the full [`VolumeError`] taxonomy; [`NodeServer::handle`]
//! is the boundary adapter that narrows failures to a wire [`Status`].

use super::config::DriverConfig;
use super::constants::{DEVICE_ID_KEY, IMAGE_ATTRIBUTE};
use super::error::{Status, VolumeError, VolumeResult};
use super::exec::{CommandRunner, ProcessRunner};
use super::image::ImageProvisioner;
use super::mount::{HostMounter, MountOrchestrator, Mounter};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Filesystem access requested for a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountVolume {
    /// Filesystem type hint. Bind mounts ignore it.
    pub fs_type: String,
    /// Extra mount(8) style flags.
    pub mount_flags: Vec<String>,
}

/// Capability the volume is published with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeCapability {
    /// Present for filesystem access.
    pub mount: Option<MountVolume>,
}

/// Request to expose an image at a target path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishVolumeRequest {
    /// Volume identifier, also the image instance name.
    pub volume_id: String,
    /// Directory the image root is bind-mounted on.
    pub target_path: String,
    /// Requested access. Required.
    pub volume_capability: Option<VolumeCapability>,
    /// Volume attributes. `image` names the image to expose.
    pub volume_context: HashMap<String, String>,
    /// Publish context. Only `deviceID` is read, for logging.
    pub publish_context: HashMap<String, String>,
    /// Mount the root read-only.
    pub readonly: bool,
}

/// Request to take a published volume down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpublishVolumeRequest {
    /// Volume identifier whose image instance is released.
    pub volume_id: String,
    /// Directory to unmount.
    pub target_path: String,
}

/// Staging request. Accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageVolumeRequest {
    /// Volume identifier.
    pub volume_id: String,
    /// Staging directory.
    pub staging_target_path: String,
}

/// Unstaging request. Accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnstageVolumeRequest {
    /// Volume identifier.
    pub volume_id: String,
    /// Staging directory.
    pub staging_target_path: String,
}

/// A boundary call, tagged by method name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum NodeRequest {
    /// Provision and mount.
    Publish(PublishVolumeRequest),
    /// Unmount and release.
    Unpublish(UnpublishVolumeRequest),
    /// No-op.
    Stage(StageVolumeRequest),
    /// No-op.
    Unstage(UnstageVolumeRequest),
}

/// Result of a boundary call. Successful calls carry no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResponse {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Narrowed failure, present when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Status>,
}

impl NodeResponse {
    pub(crate) fn from_result(result: VolumeResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(err) => Self {
                ok: false,
                error: Some(Status::from(err)),
            },
        }
    }
}

/// Per-identifier mutual exclusion.
#[derive(Default)]
struct VolumeLocks {
    inner: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct VolumeGuard<'a> {
    locks: &'a VolumeLocks,
    volume_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl VolumeLocks {
    async fn lock(&self, volume_id: &str) -> VolumeGuard<'_> {
        let mutex = self
            .inner
            .lock()
            .entry(volume_id.to_string())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            locks: self,
            volume_id: volume_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for VolumeGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut inner = self.locks.inner.lock();
        if let Some(mutex) = inner.get(&self.volume_id) {
            if Arc::strong_count(mutex) == 1 {
                inner.remove(&self.volume_id);
            }
        }
    }
}

/// Node-side volume lifecycle.
pub struct NodeServer {
    images: ImageProvisioner,
    mounts: MountOrchestrator,
    locks: VolumeLocks,
}

impl NodeServer {
    /// Creates a server that runs the real image tool and mounts on the host.
    pub fn new(config: DriverConfig) -> Self {
        Self::with_collaborators(
            Arc::new(config),
            Arc::new(ProcessRunner::new()),
            Arc::new(HostMounter::new()),
        )
    }

    /// Creates a server with the given command runner and mounter.
    pub fn with_collaborators(
        config: Arc<DriverConfig>,
        runner: Arc<dyn CommandRunner>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let mounts = MountOrchestrator::new(mounter, config.target_dir_mode);
        Self {
            images: ImageProvisioner::new(config, runner),
            mounts,
            locks: VolumeLocks::default(),
        }
    }

    /// Provisions the requested image and bind-mounts it at the target path.
    ///
    /// A target that is already mounted is left as is and nothing is provisioned.
    ///
    /// # Errors
    ///
    /// * [`VolumeError::InvalidArgument`] if the capability, volume ID, target path
    ///   or image attribute is missing. Nothing external runs in that case.
    /// * Provisioning and mount failures keep their kind.
    pub async fn publish_volume(&self, req: &PublishVolumeRequest) -> VolumeResult<()> {
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| VolumeError::invalid_argument("Volume capability missing in request"))?;
        if req.volume_id.is_empty() {
            return Err(VolumeError::invalid_argument("Volume ID missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(VolumeError::invalid_argument("Target path missing in request"));
        }
        let image = req
            .volume_context
            .get(IMAGE_ATTRIBUTE)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| VolumeError::invalid_argument("Image missing in volume attributes"))?;

        let target = Path::new(&req.target_path);
        let mount = capability.mount.clone().unwrap_or_default();
        debug!(
            "publish target {} fstype {:?} device {:?} readonly {} volumeId {} attributes {:?} mountflags {:?}",
            target.display(),
            mount.fs_type,
            req.publish_context.get(DEVICE_ID_KEY),
            req.readonly,
            req.volume_id,
            req.volume_context,
            mount.mount_flags
        );

        let _guard = self.locks.lock(&req.volume_id).await;

        if self.mounts.is_mounted(target)? {
            info!(
                "Volume {} already published at {}",
                req.volume_id,
                target.display()
            );
            return Ok(());
        }

        let root = self.images.provision(&req.volume_id, image).await?;
        if let Err(err) = self
            .mounts
            .publish(target, &root, req.readonly, &mount.mount_flags)
        {
            warn!(
                "Volume {} provisioned at {} but not mounted: {}",
                req.volume_id,
                root.display(),
                err
            );
            return Err(err);
        }

        info!(
            "Volume {} published at {}",
            req.volume_id,
            target.display()
        );
        Ok(())
    }

    /// Unmounts the target path if needed and releases the provisioned root.
    ///
    /// The root is released even when the target was not mounted.
    pub async fn unpublish_volume(&self, req: &UnpublishVolumeRequest) -> VolumeResult<()> {
        if req.volume_id.is_empty() {
            return Err(VolumeError::invalid_argument("Volume ID missing in request"));
        }
        if req.target_path.is_empty() {
            return Err(VolumeError::invalid_argument("Target path missing in request"));
        }

        let target = Path::new(&req.target_path);
        let _guard = self.locks.lock(&req.volume_id).await;

        self.mounts.unpublish(target)?;
        debug!(
            "image: volume {}/{} has been unmounted",
            target.display(),
            req.volume_id
        );
        self.images.release(&req.volume_id).await?;

        info!(
            "Volume {} unpublished from {}",
            req.volume_id,
            target.display()
        );
        Ok(())
    }

    /// Staging is not distinguished from publishing.
    pub async fn stage_volume(&self, _req: &StageVolumeRequest) -> VolumeResult<()> {
        Ok(())
    }

    /// Unstaging is not distinguished from unpublishing.
    pub async fn unstage_volume(&self, _req: &UnstageVolumeRequest) -> VolumeResult<()> {
        Ok(())
    }

    /// Dispatches a boundary call and narrows any failure to a wire status.
    pub async fn handle(&self, request: &NodeRequest) -> NodeResponse {
        let result = match request {
            NodeRequest::Publish(req) => self.publish_volume(req).await,
            NodeRequest::Unpublish(req) => self.unpublish_volume(req).await,
            NodeRequest::Stage(req) => self.stage_volume(req).await,
            NodeRequest::Unstage(req) => self.unstage_volume(req).await,
        };
        if let Err(ref err) = result {
            warn!("{:?} failed: {}", err.kind(), err);
        }
        NodeResponse::from_result(result)
    }
}
