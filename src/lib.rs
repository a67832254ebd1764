#![doc(html_root_url = "https://docs.rs/imagevol/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! imagevol: container images as node-local volumes
//!
//! A volume plugin that materializes a container image with an external
//! image tool and bind-mounts its root filesystem at a path chosen by the
//! orchestrator.
//!
//! ## Features
//!
//! - Idempotent publish and unpublish driven by the host mount table
//! - Every image tool call bounded by a timeout that kills the process group
//! - Read-only and flag-carrying bind mounts
//! - Idempotent release of instances that are already gone
//! - Per-volume serialization of lifecycle calls
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use imagevol::{DriverConfig, NodeServer, PublishVolumeRequest, VolumeCapability};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = DriverConfig::new("/usr/bin/buildah").with_timeout(Duration::from_secs(120));
//! let node = NodeServer::new(config);
//!
//! node.publish_volume(&PublishVolumeRequest {
//!     volume_id: "vol-1".to_string(),
//!     target_path: "/var/lib/kubelet/pods/p1/volumes/app".to_string(),
//!     volume_capability: Some(VolumeCapability::default()),
//!     volume_context: HashMap::from([("image".to_string(), "repo/app:latest".to_string())]),
//!     readonly: true,
//!     ..Default::default()
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error kinds
//!
//! - `InvalidArgument`: the request is incomplete
//! - `Timeout`: the image tool ran past its deadline
//! - `ProcessFailure`: the image tool rejected the operation
//! - `Internal`: host filesystem or mount failures
//!
//! At the wire boundary everything but `InvalidArgument` is reported as
//! `Internal`, with the original kind kept alongside.

pub mod modules;

pub use modules::config::DriverConfig;
pub use modules::error::{Code, ErrorKind, Status, VolumeError, VolumeResult};
pub use modules::node::{
    MountVolume, NodeRequest, NodeResponse, NodeServer, PublishVolumeRequest,
    StageVolumeRequest, UnpublishVolumeRequest, UnstageVolumeRequest, VolumeCapability,
};

// Re-export the collaborator seams
pub use modules::exec::{CommandRunner, ProcessRunner};
pub use modules::mount::{HostMounter, Mounter};
