use super::constants::{BIND_OPTION, READ_ONLY_OPTION};
use super::error::{VolumeError, VolumeResult};
use log::{debug, info, warn};
use nix::mount::{mount, umount, MsFlags};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

/// Host mount table operations.
pub trait Mounter: Send + Sync {
    /// Returns `true` when `path` is probably not a mount point.
    ///
    /// Fails with [`io::ErrorKind::NotFound`] when `path` does not exist.
    fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool>;

    /// Mounts `source` on `target` with mount(8) style `options`.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> VolumeResult<()>;

    /// Unmounts `target`.
    fn unmount(&self, target: &Path) -> VolumeResult<()>;
}

/// [`Mounter`] that talks to the kernel directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMounter;

impl HostMounter {
    /// Creates a mounter for the host mount namespace.
    pub fn new() -> Self {
        Self
    }
}

impl Mounter for HostMounter {
    fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool> {
        let link = fs::symlink_metadata(path)?;
        if link.file_type().is_symlink() {
            return Ok(true);
        }
        let parent = match path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            // "/" is always a mount point
            None => return Ok(false),
        };
        let parent_meta = fs::metadata(parent)?;
        Ok(link.dev() == parent_meta.dev())
    }

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> VolumeResult<()> {
        let (flags, data) = parse_options(options);
        let data = (!data.is_empty()).then(|| data.join(","));
        debug!(
            "mount {:?} -> {:?} (type: {:?}, flags: {:?}, data: {:?})",
            source, target, fs_type, flags, data
        );

        if !flags.contains(MsFlags::MS_BIND) {
            mount(Some(source), target, fs_type, flags, data.as_deref())?;
            return Ok(());
        }

        if let Some(data) = &data {
            warn!("Ignoring mount data {:?} on bind mount of {:?}", data, target);
        }
        let (bind_flags, remount_flags) = split_bind_flags(flags);
        mount(Some(source), target, None::<&str>, bind_flags, None::<&str>)?;

        // The kernel ignores per-mount flags on the initial bind.
        if !remount_flags.is_empty() {
            let result = mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | remount_flags,
                None::<&str>,
            );
            if let Err(err) = result {
                if let Err(undo) = umount(target) {
                    warn!("Failed to undo bind mount on {:?}: {}", target, undo);
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> VolumeResult<()> {
        debug!("umount {:?}", target);
        umount(target)?;
        Ok(())
    }
}

/// Splits mount(8) style options into kernel flags and filesystem data.
pub fn parse_options(options: &[String]) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags -= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "defaults" => {}
            other => data.push(other.to_string()),
        }
    }
    (flags, data)
}

/// Splits bind mount flags into those applied by the bind itself and those
/// that need a follow-up remount.
pub fn split_bind_flags(flags: MsFlags) -> (MsFlags, MsFlags) {
    let bind_flags = MsFlags::MS_BIND | (flags & MsFlags::MS_REC);
    (bind_flags, flags - bind_flags)
}

/// Builds the option set for bind-mounting a provisioned root.
pub fn bind_options(read_only: bool, extra_flags: &[String]) -> Vec<String> {
    let mut options = vec![BIND_OPTION.to_string()];
    if read_only {
        options.push(READ_ONLY_OPTION.to_string());
    }
    options.extend(extra_flags.iter().cloned());
    options
}

/// Bind-mounts provisioned roots onto target paths and takes them down again.
///
/// The mount table is the only idempotency signal: a target that already
/// looks mounted is left alone on publish, and a target that does not is
/// left alone on unpublish.
#[derive(Clone)]
pub struct MountOrchestrator {
    mounter: Arc<dyn Mounter>,
    target_dir_mode: u32,
}

impl MountOrchestrator {
    /// Creates an orchestrator that creates missing targets with `target_dir_mode`.
    pub fn new(mounter: Arc<dyn Mounter>, target_dir_mode: u32) -> Self {
        Self {
            mounter,
            target_dir_mode,
        }
    }

    /// Reports whether `target` currently looks mounted. A missing target is not mounted.
    pub fn is_mounted(&self, target: &Path) -> VolumeResult<bool> {
        match self.mounter.is_likely_not_mount_point(target) {
            Ok(not_mounted) => Ok(!not_mounted),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(inspect_error(target, err)),
        }
    }

    /// Bind-mounts `root` onto `target`, creating `target` if it is missing.
    ///
    /// Succeeds without mounting when `target` is already a mount point.
    /// Errors from the mount itself are returned unchanged.
    pub fn publish(
        &self,
        target: &Path,
        root: &Path,
        read_only: bool,
        extra_flags: &[String],
    ) -> VolumeResult<()> {
        let not_mounted = match self.mounter.is_likely_not_mount_point(target) {
            Ok(not_mounted) => not_mounted,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.create_target(target).map_err(|err| {
                    VolumeError::internal(format!(
                        "failed to create target path {}: {}",
                        target.display(),
                        err
                    ))
                })?;
                true
            }
            Err(err) => return Err(inspect_error(target, err)),
        };

        if !not_mounted {
            debug!("{} is already mounted", target.display());
            return Ok(());
        }

        let options = bind_options(read_only, extra_flags);
        self.mounter.mount(root, target, None, &options)?;
        info!(
            "Mounted {} at {} ({})",
            root.display(),
            target.display(),
            options.join(",")
        );
        Ok(())
    }

    // The leaf gets exactly `target_dir_mode`, whatever the umask.
    fn create_target(&self, target: &Path) -> io::Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(self.target_dir_mode)
            .create(target)?;
        fs::set_permissions(target, fs::Permissions::from_mode(self.target_dir_mode))
    }

    /// Unmounts `target` if it is mounted.
    pub fn unpublish(&self, target: &Path) -> VolumeResult<()> {
        if !self.is_mounted(target)? {
            debug!("{} is not mounted", target.display());
            return Ok(());
        }

        self.mounter.unmount(target).map_err(|err| {
            VolumeError::internal(format!("failed to unmount {}: {}", target.display(), err))
        })?;
        info!("Unmounted {}", target.display());
        Ok(())
    }
}

fn inspect_error(target: &Path, err: io::Error) -> VolumeError {
    VolumeError::internal(format!(
        "failed to inspect mount point {}: {}",
        target.display(),
        err
    ))
}
