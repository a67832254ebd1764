//! Core plugin modules.
//!
//! - `constants`: Tool arguments, attribute keys and default paths
//! - `config`: Driver configuration fixed at startup
//! - `error`: Error taxonomy and wire status
//! - `exec`: Timeout-bounded external commands
//! - `image`: Image provisioning through the image tool
//! - `mount`: Bind mounts and mount point detection
//! - `node`: Volume lifecycle entry points
//! - `server`: JSON-lines transport

pub mod config;
pub mod constants;
pub mod error;
pub mod exec;
pub mod image;
/// Host mount operations and the publish/unpublish mount logic.
pub mod mount;
pub mod node;
pub mod server;
