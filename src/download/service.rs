// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Single-task driver for the lifecycle manager.
//!
//! UI commands and host notifications both arrive as channel messages and
//! are applied one at a time by the worker loop, which is the only owner of
//! the [`DownloadManager`]. No locking is needed around the registry.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::host::{EventSink, HostEvent};
use super::http::HttpHost;
use super::manager::{DownloadManager, RequestOutcome};
use super::types::{ReturnShape, StateCommand, StateReply};
use crate::error::BridgeError;

/// Commands accepted by the download worker.
#[derive(Debug)]
pub enum DownloadCommand {
    /// Request a download; answers with the outcome or a filesystem error.
    Request {
        url: String,
        destination: PathBuf,
        fingerprint: String,
        reply: oneshot::Sender<Result<RequestOutcome, BridgeError>>,
    },
    /// Pause, resume or cancel a live download.
    SetState {
        fingerprint: String,
        url: String,
        command: StateCommand,
    },
    /// Ask for the host-reported state.
    QueryState {
        fingerprint: String,
        url: String,
        shape: ReturnShape,
        reply: oneshot::Sender<StateReply>,
    },
    /// Ask where the live transfer is written.
    SavedPath {
        fingerprint: String,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    /// Stop the worker.
    Shutdown,
}

/// Cloneable handle to the download worker.
#[derive(Debug, Clone)]
pub struct DownloadService {
    command_tx: mpsc::Sender<DownloadCommand>,
}

impl DownloadService {
    /// Start the worker loop owning `manager`, fed by `host_events`.
    pub fn spawn(
        manager: DownloadManager,
        host_events: mpsc::UnboundedReceiver<HostEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(100);
        let worker = tokio::spawn(async move {
            Self::worker_loop(manager, command_rx, host_events).await;
        });
        (Self { command_tx }, worker)
    }

    /// Start a worker backed by the built-in HTTP host.
    pub fn spawn_http(
        client: reqwest::Client,
        sink: Arc<dyn EventSink>,
    ) -> (Self, JoinHandle<()>) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let host = Arc::new(HttpHost::new(client, host_tx));
        Self::spawn(DownloadManager::new(host, sink), host_rx)
    }

    pub async fn request_download(
        &self,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        fingerprint: impl Into<String>,
    ) -> Result<RequestOutcome, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(DownloadCommand::Request {
            url: url.into(),
            destination: destination.into(),
            fingerprint: fingerprint.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::ServiceClosed)?
    }

    /// Fire-and-forget state command.
    pub async fn set_state(&self, fingerprint: impl Into<String>, url: impl Into<String>, command: StateCommand) {
        let sent = self
            .send(DownloadCommand::SetState {
                fingerprint: fingerprint.into(),
                url: url.into(),
                command,
            })
            .await;
        if let Err(e) = sent {
            tracing::warn!("dropping {:?} command: {}", command, e);
        }
    }

    pub async fn query_state(
        &self,
        fingerprint: impl Into<String>,
        url: impl Into<String>,
        shape: ReturnShape,
    ) -> Result<StateReply, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(DownloadCommand::QueryState {
            fingerprint: fingerprint.into(),
            url: url.into(),
            shape,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::ServiceClosed)
    }

    pub async fn saved_path(&self, fingerprint: impl Into<String>) -> Result<Option<PathBuf>, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(DownloadCommand::SavedPath {
            fingerprint: fingerprint.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::ServiceClosed)
    }

    /// Ask the worker to stop. Pending host notifications are dropped.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.send(DownloadCommand::Shutdown).await
    }

    async fn send(&self, command: DownloadCommand) -> Result<(), BridgeError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| BridgeError::ServiceClosed)
    }

    async fn worker_loop(
        mut manager: DownloadManager,
        mut command_rx: mpsc::Receiver<DownloadCommand>,
        mut host_rx: mpsc::UnboundedReceiver<HostEvent>,
    ) {
        let mut host_open = true;

        loop {
            // Host notifications already delivered are applied before any
            // command that arrives alongside them.
            tokio::select! {
                biased;
                event = host_rx.recv(), if host_open => match event {
                    Some(event) => manager.handle_host_event(event),
                    None => {
                        tracing::debug!("host event channel closed");
                        host_open = false;
                    }
                },
                command = command_rx.recv() => match command {
                    Some(DownloadCommand::Shutdown) | None => break,
                    Some(command) => Self::apply(&mut manager, command),
                },
            }
        }

        tracing::debug!(
            tracked = manager.registry().len(),
            "download worker stopped"
        );
    }

    fn apply(manager: &mut DownloadManager, command: DownloadCommand) {
        match command {
            DownloadCommand::Request {
                url,
                destination,
                fingerprint,
                reply,
            } => {
                let result = manager.request_download(&url, &destination, &fingerprint);
                if let Err(e) = &result {
                    tracing::error!(fingerprint = %fingerprint, url = %url, "download request failed: {}", e);
                }
                let _ = reply.send(result);
            }
            DownloadCommand::SetState {
                fingerprint,
                url,
                command,
            } => manager.set_state(&fingerprint, &url, command),
            DownloadCommand::QueryState {
                fingerprint,
                url,
                shape,
                reply,
            } => {
                let _ = reply.send(manager.query_state_shaped(&fingerprint, &url, shape));
            }
            DownloadCommand::SavedPath { fingerprint, reply } => {
                let _ = reply.send(manager.saved_path(&fingerprint));
            }
            DownloadCommand::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::host::DownloadHost;
    use crate::download::types::DownloadEvent;

    struct NoopHost;

    impl DownloadHost for NoopHost {
        fn begin_transfer(&self, _url: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn service() -> (DownloadService, JoinHandle<()>, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_host_tx, host_rx) = mpsc::unbounded_channel();
        let manager = DownloadManager::new(Arc::new(NoopHost), Arc::new(event_tx));
        let (service, worker) = DownloadService::spawn(manager, host_rx);
        (service, worker, event_rx)
    }

    #[tokio::test]
    async fn test_request_and_query_through_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _worker, _events) = service();

        let outcome = service
            .request_download("https://x/a", dir.path().join("a.bin"), "fa")
            .await
            .unwrap();
        assert_eq!(outcome, RequestOutcome::Started);

        // Not attached to a host transfer yet.
        let reply = service.query_state("fa", "https://x/a", ReturnShape::Obj).await.unwrap();
        assert_eq!(reply, StateReply::Wrapped { state: None });
        assert_eq!(service.saved_path("fa").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_command_is_harmless() {
        let (service, _worker, mut events) = service();

        service.set_state("missing", "https://x/a", StateCommand::Pause).await;
        let reply = service.query_state("missing", "https://x/a", ReturnShape::Str).await.unwrap();

        assert_eq!(reply, StateReply::Bare(None));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_service() {
        let (service, worker, _events) = service();
        service.shutdown().await.unwrap();
        worker.await.unwrap();

        let result = service.saved_path("fa").await;
        assert!(matches!(result, Err(BridgeError::ServiceClosed)));
    }
}
