//! Process-wide driver configuration.

use super::constants::{DEFAULT_TARGET_DIR_MODE, DEFAULT_TOOL_PATH};
use std::path::PathBuf;
use std::time::Duration;

/// Settings fixed at startup and shared by every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Path to the image tool executable.
    pub tool_path: PathBuf,
    /// Bound on every external command; `None` is unbounded.
    pub timeout: Option<Duration>,
    /// Permission bits used when a missing target path is created.
    pub target_dir_mode: u32,
    /// Ask the image tool for the root path with a separate `mount` call
    /// instead of reading it from the create output.
    pub resolve_root_with_mount: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from(DEFAULT_TOOL_PATH),
            timeout: None,
            target_dir_mode: DEFAULT_TARGET_DIR_MODE,
            resolve_root_with_mount: false,
        }
    }
}

impl DriverConfig {
    /// Creates a configuration for the given image tool.
    pub fn new(tool_path: impl Into<PathBuf>) -> Self {
        Self {
            tool_path: tool_path.into(),
            ..Self::default()
        }
    }

    /// Sets the command timeout. A zero duration means unbounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = normalize_timeout(timeout);
        self
    }

    /// Sets the permission bits for created target directories.
    pub fn with_target_dir_mode(mut self, mode: u32) -> Self {
        self.target_dir_mode = mode;
        self
    }

    /// Enables root path resolution through the tool's `mount` command.
    pub fn with_root_resolution(mut self, enabled: bool) -> Self {
        self.resolve_root_with_mount = enabled;
        self
    }
}

/// Maps a zero duration to "no timeout".
pub fn normalize_timeout(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.tool_path, PathBuf::from("/bin/buildah"));
        assert_eq!(config.timeout, None);
        assert_eq!(config.target_dir_mode, 0o750);
        assert!(!config.resolve_root_with_mount);
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = DriverConfig::new("/usr/bin/buildah").with_timeout(Duration::ZERO);
        assert_eq!(config.timeout, None);

        let config = config.with_timeout(Duration::from_secs(30));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
    }
}
