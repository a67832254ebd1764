//! JSON-lines transport for the node boundary.
//!
//! Each connection carries one [`NodeRequest`] per line and receives one
//! [`NodeResponse`] per line, in order. Connections are served concurrently;
//! the [`NodeServer`] keeps calls for the same volume apart.

use super::error::VolumeError;
use super::node::{NodeRequest, NodeResponse, NodeServer};
use anyhow::{Context, Result};
use log::{debug, error, info};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};

/// Serves a [`NodeServer`] on a Unix socket.
pub struct Server {
    node: Arc<NodeServer>,
    socket_path: PathBuf,
}

impl Server {
    /// Creates a server that will listen on `socket_path`.
    pub fn new(node: NodeServer, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            node: Arc::new(node),
            socket_path: socket_path.into(),
        }
    }

    /// Runs until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        self.serve(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
                _ = terminate.recv() => info!("Received terminate signal"),
            }
        })
        .await
    }

    /// Runs until `shutdown` completes, then removes the socket.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind(&self.socket_path)?;
        info!("Listening on {}", self.socket_path.display());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let node = self.node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(node, stream).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        if let Err(e) = fs::remove_file(&self.socket_path) {
            error!("Failed to remove {}: {}", self.socket_path.display(), e);
        }
        info!("Server stopped");
        Ok(())
    }
}

fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if socket_path.exists() {
        debug!("Removing stale socket {}", socket_path.display());
        fs::remove_file(socket_path)?;
    }
    UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))
}

async fn serve_connection(node: Arc<NodeServer>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<NodeRequest>(&line) {
            Ok(request) => {
                debug!("Request: {:?}", request);
                node.handle(&request).await
            }
            Err(e) => NodeResponse::from_result(Err(VolumeError::invalid_argument(format!(
                "malformed request: {}",
                e
            )))),
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::config::DriverConfig;
    use crate::modules::error::Code;
    use tokio::sync::oneshot;

    async fn round_trip(lines: &[&str], socket_path: &Path) -> Vec<NodeResponse> {
        let stream = UnixStream::connect(socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        for line in lines {
            writer.write_all(line.as_bytes()).await.unwrap();
            writer.write_all(b"\n").await.unwrap();
        }
        writer.shutdown().await.unwrap();

        let mut responses = Vec::new();
        let mut replies = BufReader::new(reader).lines();
        while let Some(reply) = replies.next_line().await.unwrap() {
            responses.push(serde_json::from_str(&reply).unwrap());
        }
        responses
    }

    #[tokio::test]
    async fn test_serves_requests_until_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let socket_path = temp_dir.path().join("run/imgvol.sock");
        let node = NodeServer::new(DriverConfig::new("/nonexistent/imgvol-tool"));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = Server::new(node, &socket_path);
        let handle = tokio::spawn(server.serve(async move {
            let _ = stop_rx.await;
        }));

        while !socket_path.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let responses = round_trip(
            &[
                r#"{"method":"stage","volume_id":"vol-1"}"#,
                "not json",
                r#"{"method":"unpublish","volume_id":"vol-1"}"#,
            ],
            &socket_path,
        )
        .await;

        assert_eq!(responses.len(), 3);
        assert!(responses[0].ok);
        assert_eq!(
            responses[1].error.as_ref().unwrap().code,
            Code::InvalidArgument
        );
        assert_eq!(
            responses[2].error.as_ref().unwrap().message,
            "Target path missing in request"
        );

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
