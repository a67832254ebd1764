use async_trait::async_trait;
use imagevol::{CommandRunner, DriverConfig, Mounter, NodeServer, VolumeError, VolumeResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Fake image tool that keeps instances in memory, like the real tool does on disk.
#[derive(Default)]
pub struct FakeImageTool {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub events: Arc<Mutex<Vec<String>>>,
    pub instances: Mutex<HashMap<String, String>>,
    pub delay: Option<Duration>,
    pub time_out: bool,
}

#[async_trait]
impl CommandRunner for FakeImageTool {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> VolumeResult<Vec<u8>> {
        self.calls.lock().push(args.to_vec());
        self.events.lock().push(args.join(" "));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.time_out {
            return Err(VolumeError::Timeout {
                command: program.display().to_string(),
                timeout: timeout.unwrap_or_default(),
            });
        }

        match args.first().map(String::as_str) {
            Some("from") => {
                let name = args[2].clone();
                let mut instances = self.instances.lock();
                if instances.contains_key(&name) {
                    return Err(failure(&format!("the container name \"{}\" is already in use", name)));
                }
                instances.insert(name.clone(), args[4].clone());
                Ok(format!("  /var/lib/containers/storage/{}/merged\n", name).into_bytes())
            }
            Some("delete") => match self.instances.lock().remove(&args[1]) {
                Some(_) => Ok(Vec::new()),
                None => Err(failure(&format!("{}: container not known", args[1]))),
            },
            _ => Err(failure("unknown command")),
        }
    }
}

fn failure(output: &str) -> VolumeError {
    VolumeError::ProcessFailure {
        command: "buildah".to_string(),
        status: "exit status: 125".to_string(),
        output: format!("Error: {}\n", output),
    }
}

/// Fake mount table keyed by target path.
#[derive(Default)]
pub struct FakeMountTable {
    pub mounted: Mutex<HashMap<PathBuf, (PathBuf, Vec<String>)>>,
    pub mount_calls: Mutex<Vec<PathBuf>>,
    pub unmount_calls: Mutex<Vec<PathBuf>>,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl Mounter for FakeMountTable {
    fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool> {
        fs::metadata(path)?;
        Ok(!self.mounted.lock().contains_key(path))
    }

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        _fs_type: Option<&str>,
        options: &[String],
    ) -> VolumeResult<()> {
        self.mount_calls.lock().push(target.to_path_buf());
        self.events.lock().push(format!("mount {}", target.display()));
        self.mounted
            .lock()
            .insert(target.to_path_buf(), (source.to_path_buf(), options.to_vec()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> VolumeResult<()> {
        self.unmount_calls.lock().push(target.to_path_buf());
        self.events.lock().push(format!("unmount {}", target.display()));
        self.mounted.lock().remove(target);
        Ok(())
    }
}

pub struct Harness {
    pub tool: Arc<FakeImageTool>,
    pub mounts: Arc<FakeMountTable>,
    pub node: Arc<NodeServer>,
}

impl Harness {
    pub fn new(tool: FakeImageTool) -> Self {
        let tool = Arc::new(tool);
        let mounts = Arc::new(FakeMountTable {
            events: tool.events.clone(),
            ..FakeMountTable::default()
        });
        let config = DriverConfig::new("/usr/bin/buildah").with_timeout(Duration::from_secs(2));
        let node = NodeServer::with_collaborators(Arc::new(config), tool.clone(), mounts.clone());
        Self {
            tool,
            mounts,
            node: Arc::new(node),
        }
    }

    pub fn tool_commands(&self) -> Vec<String> {
        self.tool
            .calls
            .lock()
            .iter()
            .map(|args| args.join(" "))
            .collect()
    }

    pub fn events(&self) -> Vec<String> {
        self.tool.events.lock().clone()
    }

    pub fn mounted_targets(&self) -> HashSet<PathBuf> {
        self.mounts.mounted.lock().keys().cloned().collect()
    }
}
