//! Fixed names and defaults shared across the plugin.

use std::time::Duration;

// Image tool
/// Image tool used when none is configured.
pub const DEFAULT_TOOL_PATH: &str = "/bin/buildah";
/// Subcommand that creates an image instance.
pub const TOOL_CREATE: &str = "from";
/// Subcommand that prints an instance's root filesystem path.
pub const TOOL_MOUNT: &str = "mount";
/// Subcommand that removes an image instance.
pub const TOOL_DELETE: &str = "delete";

/// Lowercased fragments of image tool output that mean the instance is already gone.
pub const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "no such container",
    "not known",
    "does not exist",
];

// Target paths
/// Permission bits for target directories created on publish.
pub const DEFAULT_TARGET_DIR_MODE: u32 = 0o750;

// Request attribute keys
/// Volume attribute naming the image to provision.
pub const IMAGE_ATTRIBUTE: &str = "image";
/// Publish context key carrying the device id.
pub const DEVICE_ID_KEY: &str = "deviceID";

// Mount options
/// Mount option requesting a bind mount.
pub const BIND_OPTION: &str = "bind";
/// Mount option requesting a read-only mount.
pub const READ_ONLY_OPTION: &str = "ro";

// Serving
/// Unix socket the `serve` command listens on by default.
pub const DEFAULT_SOCKET_PATH: &str = "/run/imgvol/imgvol.sock";
/// How long a killed command may take to exit before it is abandoned.
pub const KILL_GRACE: Duration = Duration::from_secs(5);
