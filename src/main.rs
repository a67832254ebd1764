use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use imagevol::modules::constants::{
    DEFAULT_SOCKET_PATH, DEFAULT_TARGET_DIR_MODE, DEFAULT_TOOL_PATH, DEVICE_ID_KEY,
    IMAGE_ATTRIBUTE,
};
use imagevol::modules::server::Server;
use imagevol::{
    DriverConfig, MountVolume, NodeRequest, NodeServer, PublishVolumeRequest,
    StageVolumeRequest, UnpublishVolumeRequest, UnstageVolumeRequest, VolumeCapability,
};
use log::{info, LevelFilter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Image tool executable
    #[arg(long, global = true, env = "IMGVOL_TOOL", default_value = DEFAULT_TOOL_PATH)]
    tool: PathBuf,

    /// Timeout for each image tool call, in seconds (0 = unbounded)
    #[arg(long, global = true, env = "IMGVOL_TIMEOUT_SECS", default_value_t = 0)]
    timeout_secs: u64,

    /// Octal permission bits for target directories that have to be created
    #[arg(long, global = true, value_parser = parse_mode, default_value = "750")]
    target_dir_mode: u32,

    /// Read the root path from `<tool> mount <volume>` instead of the create output
    #[arg(long, global = true)]
    resolve_root_with_mount: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve lifecycle requests on a Unix socket
    Serve {
        /// Socket path
        #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
    /// Provision an image and bind-mount it at a target path
    Publish {
        /// Volume identifier
        volume_id: String,
        /// Target path
        target_path: String,
        /// Image reference
        #[arg(short, long)]
        image: String,
        /// Mount read-only
        #[arg(short, long)]
        readonly: bool,
        /// Extra mount flag (repeatable)
        #[arg(short = 'o', long = "mount-flag")]
        mount_flags: Vec<String>,
        /// Filesystem type hint
        #[arg(long, default_value = "")]
        fs_type: String,
        /// Device ID from the publish context
        #[arg(long)]
        device_id: Option<String>,
    },
    /// Unmount a target path and release its image instance
    Unpublish {
        /// Volume identifier
        volume_id: String,
        /// Target path
        target_path: String,
    },
    /// Stage a volume (no-op)
    Stage {
        /// Volume identifier
        volume_id: String,
        /// Staging path
        staging_target_path: String,
    },
    /// Unstage a volume (no-op)
    Unstage {
        /// Volume identifier
        volume_id: String,
        /// Staging path
        staging_target_path: String,
    },
}

fn parse_mode(value: &str) -> Result<u32, String> {
    let digits = value.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode: {}", value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let config = DriverConfig::new(&cli.tool)
        .with_timeout(Duration::from_secs(cli.timeout_secs))
        .with_target_dir_mode(cli.target_dir_mode)
        .with_root_resolution(cli.resolve_root_with_mount);
    if config.target_dir_mode != DEFAULT_TARGET_DIR_MODE {
        info!("Target directories will be created with mode {:o}", config.target_dir_mode);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: DriverConfig) -> Result<()> {
    info!("Starting imgvol with {}", config.tool_path.display());
    let node = NodeServer::new(config);

    let request = match command {
        Commands::Serve { socket } => {
            return Server::new(node, socket).run().await;
        }
        Commands::Publish {
            volume_id,
            target_path,
            image,
            readonly,
            mount_flags,
            fs_type,
            device_id,
        } => NodeRequest::Publish(PublishVolumeRequest {
            volume_id,
            target_path,
            volume_capability: Some(VolumeCapability {
                mount: Some(MountVolume {
                    fs_type,
                    mount_flags,
                }),
            }),
            volume_context: HashMap::from([(IMAGE_ATTRIBUTE.to_string(), image)]),
            publish_context: device_id
                .map(|id| HashMap::from([(DEVICE_ID_KEY.to_string(), id)]))
                .unwrap_or_default(),
            readonly,
        }),
        Commands::Unpublish {
            volume_id,
            target_path,
        } => NodeRequest::Unpublish(UnpublishVolumeRequest {
            volume_id,
            target_path,
        }),
        Commands::Stage {
            volume_id,
            staging_target_path,
        } => NodeRequest::Stage(StageVolumeRequest {
            volume_id,
            staging_target_path,
        }),
        Commands::Unstage {
            volume_id,
            staging_target_path,
        } => NodeRequest::Unstage(UnstageVolumeRequest {
            volume_id,
            staging_target_path,
        }),
    };

    let response = node.handle(&request).await;
    println!("{}", serde_json::to_string(&response)?);
    if let Some(status) = response.error {
        bail!("{:?} ({:?}): {}", status.code, status.kind, status.message);
    }
    Ok(())
}
