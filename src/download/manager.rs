// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle manager.
//!
//! Tracks downloads by fingerprint, coalesces duplicate requests for the same
//! logical file, relays host notifications to the UI and applies pause,
//! resume and cancel commands. The manager is plain synchronous state; the
//! [`DownloadService`](super::service::DownloadService) runs it on a single
//! task so commands and host notifications never interleave mid-operation.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::host::{DownloadHost, EventSink, HostEvent, Transfer};
use super::registry::{DuplicateQueue, Registry, Subscription, Subscriptions};
use super::types::{
    AttachedTransfer, DownloadEvent, DownloadRecord, DuplicateRequest, ReturnShape, StateCommand,
    StateReply, TransferState,
};
use crate::error::BridgeError;

/// What a download request resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new host transfer was requested.
    Started,
    /// The matching transfer was paused and has been resumed.
    Resumed,
    /// The matching transfer is already running or about to start.
    AlreadyActive,
    /// Queued for fan-out when the in-flight download completes.
    Queued,
    /// An identical duplicate was already queued.
    AlreadyQueued,
    /// The host refused to begin the transfer; the record was dropped.
    HostRefused,
}

/// Owns the registry, the duplicate queue and the transfer subscriptions.
pub struct DownloadManager {
    host: Arc<dyn DownloadHost>,
    sink: Arc<dyn EventSink>,
    registry: Registry,
    duplicates: DuplicateQueue,
    subscriptions: Subscriptions,
}

impl DownloadManager {
    pub fn new(host: Arc<dyn DownloadHost>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            host,
            sink,
            registry: Registry::new(),
            duplicates: DuplicateQueue::new(),
            subscriptions: Subscriptions::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn duplicates(&self) -> &DuplicateQueue {
        &self.duplicates
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Request `url` to be saved at `destination` under `fingerprint`.
    ///
    /// Only a failure to create the destination directory is reported back.
    pub fn request_download(
        &mut self,
        url: &str,
        destination: &Path,
        fingerprint: &str,
    ) -> Result<RequestOutcome, BridgeError> {
        let retired = match self.registry.get(fingerprint) {
            Some(record) if record.matches(url, destination) => match &record.handle {
                Some(handle) if handle.transfer.is_paused() => {
                    info!(fingerprint, url, "resuming paused download on repeated request");
                    handle.transfer.resume();
                    return Ok(RequestOutcome::Resumed);
                }
                // A dead interrupted transfer is replaced by a fresh one.
                Some(handle)
                    if handle.transfer.state() == TransferState::Interrupted
                        && !handle.transfer.can_resume() =>
                {
                    Some((handle.transfer.id(), handle.token))
                }
                _ => {
                    debug!(fingerprint, url, "download already in flight");
                    return Ok(RequestOutcome::AlreadyActive);
                }
            },
            Some(_) => return self.queue_duplicate(url, destination, fingerprint),
            None => None,
        };

        if let Some((transfer, token)) = retired {
            info!(fingerprint, url, "restarting interrupted download");
            self.subscriptions.unsubscribe(transfer, token);
            self.registry.remove(fingerprint);
        }

        ensure_parent_dir(destination)?;
        self.registry
            .insert(DownloadRecord::new(fingerprint, url, destination));

        if let Err(e) = self.host.begin_transfer(url) {
            warn!(fingerprint, url, "host refused to begin transfer: {}", e);
            self.registry.remove(fingerprint);
            self.duplicates.take(fingerprint);
            self.sink.emit(DownloadEvent::Interrupted {
                fingerprint: fingerprint.to_string(),
                url: url.to_string(),
            });
            return Ok(RequestOutcome::HostRefused);
        }

        info!(fingerprint, url, path = %destination.display(), "download requested");
        Ok(RequestOutcome::Started)
    }

    fn queue_duplicate(
        &mut self,
        url: &str,
        destination: &Path,
        fingerprint: &str,
    ) -> Result<RequestOutcome, BridgeError> {
        ensure_parent_dir(destination)?;
        let queued = self.duplicates.push(DuplicateRequest {
            fingerprint: fingerprint.to_string(),
            url: url.to_string(),
            destination_path: destination.to_path_buf(),
        });
        if !queued {
            return Ok(RequestOutcome::AlreadyQueued);
        }
        info!(
            fingerprint,
            url,
            path = %destination.display(),
            "queued duplicate request for in-flight fingerprint"
        );
        Ok(RequestOutcome::Queued)
    }

    /// Single dispatch point for host notifications.
    pub fn handle_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Started(transfer) => {
                self.on_transfer_started(transfer);
            }
            HostEvent::Updated { transfer, state } => self.on_progress(transfer.as_ref(), state),
            HostEvent::Done { transfer, state } => self.on_terminal(transfer.as_ref(), state),
        }
    }

    /// Attach a freshly started host transfer to the record waiting for its
    /// URL. Returns `false` for transfers this manager did not request.
    pub fn on_transfer_started(&mut self, transfer: Arc<dyn Transfer>) -> bool {
        let url = transfer.url();
        let Some(record) = self.registry.awaiting_start_mut(&url) else {
            debug!(url = %url, transfer = transfer.id(), "ignoring transfer not requested here");
            return false;
        };

        transfer.set_save_path(record.destination_path.clone());
        let token = self.subscriptions.subscribe(
            transfer.id(),
            &record.fingerprint,
            &url,
            record.destination_path.clone(),
        );
        debug!(
            fingerprint = %record.fingerprint,
            transfer = transfer.id(),
            "transfer attached"
        );
        record.handle = Some(AttachedTransfer { transfer, token });
        record.touch();
        true
    }

    /// Relay a non-terminal host notification.
    pub fn on_progress(&mut self, transfer: &dyn Transfer, state: TransferState) {
        let Some(sub) = self.subscriptions.get(transfer.id()).cloned() else {
            return;
        };
        if let Some(record) = self.registry.get_mut(&sub.fingerprint) {
            record.touch();
        }

        match state {
            TransferState::Interrupted => self.sink.emit(DownloadEvent::Interrupted {
                fingerprint: sub.fingerprint,
                url: sub.url,
            }),
            TransferState::Progressing if transfer.is_paused() => {
                self.sink.emit(DownloadEvent::Pause {
                    fingerprint: sub.fingerprint,
                    url: sub.url,
                })
            }
            TransferState::Progressing => {
                let received = transfer.received_bytes();
                let total = transfer.total_bytes();
                // Sizes unknown yet: skip the zero-progress tick.
                if received > 0 && total > 0 {
                    self.sink.emit(DownloadEvent::Progressing {
                        fingerprint: sub.fingerprint,
                        url: sub.url,
                        destination_path: sub.destination_path,
                        bytes_received: received,
                        bytes_total: total,
                    });
                }
            }
            other => debug!(state = other.as_str(), "terminal state on progress channel ignored"),
        }
    }

    /// Relay a terminal host notification and retire the fingerprint.
    pub fn on_terminal(&mut self, transfer: &dyn Transfer, state: TransferState) {
        let id = transfer.id();
        let Some(sub) = self.subscriptions.get(id).cloned() else {
            return;
        };

        match state {
            TransferState::Completed => {
                self.subscriptions.unsubscribe(id, sub.token);
                self.sink.emit(DownloadEvent::Completed {
                    fingerprint: sub.fingerprint.clone(),
                    url: sub.url.clone(),
                    destination_path: sub.destination_path.clone(),
                });
                info!(fingerprint = %sub.fingerprint, "download completed");

                if self.owns_record(&sub) {
                    let duplicates = self.duplicates.take(&sub.fingerprint);
                    self.fan_out(&sub, duplicates);
                    self.registry.remove(&sub.fingerprint);
                }
            }
            TransferState::Interrupted if !self.owns_record(&sub) => {
                // Cancelled by command while the host was failing it.
                self.subscriptions.unsubscribe(id, sub.token);
                self.sink.emit(DownloadEvent::Cancelled {
                    fingerprint: sub.fingerprint,
                    url: sub.url,
                });
            }
            TransferState::Interrupted => {
                // Record and subscription stay: the transfer may be resumed.
                self.sink.emit(DownloadEvent::Interrupted {
                    fingerprint: sub.fingerprint.clone(),
                    url: sub.url.clone(),
                });
                warn!(fingerprint = %sub.fingerprint, url = %sub.url, "download interrupted");
            }
            TransferState::Cancelled => {
                self.subscriptions.unsubscribe(id, sub.token);
                if self.owns_record(&sub) {
                    self.registry.remove(&sub.fingerprint);
                    let discarded = self.duplicates.take(&sub.fingerprint);
                    if !discarded.is_empty() {
                        debug!(
                            fingerprint = %sub.fingerprint,
                            count = discarded.len(),
                            "discarding duplicates of cancelled download"
                        );
                    }
                }
                self.sink.emit(DownloadEvent::Cancelled {
                    fingerprint: sub.fingerprint,
                    url: sub.url,
                });
            }
            TransferState::Progressing => {
                debug!(transfer = id, "progressing reported as terminal, ignored")
            }
        }
    }

    /// Apply a UI command. Unknown or stale targets are silently ignored.
    pub fn set_state(&mut self, fingerprint: &str, url: &str, command: StateCommand) {
        let Some(record) = self.registry.get(fingerprint) else {
            debug!(fingerprint, ?command, "command for untracked fingerprint ignored");
            return;
        };
        if record.url != url {
            debug!(fingerprint, url, ?command, "command for stale url ignored");
            return;
        }

        let token = record.handle.as_ref().map(|h| h.token);
        let transfer = record.handle.as_ref().map(|h| Arc::clone(&h.transfer));
        match (command, transfer) {
            (StateCommand::Pause, Some(transfer)) => {
                if !transfer.is_paused() {
                    transfer.pause();
                }
            }
            (StateCommand::Resume, Some(transfer)) => {
                if transfer.can_resume() {
                    transfer.resume();
                } else {
                    debug!(fingerprint, "resume ignored: host reports not resumable");
                }
            }
            (StateCommand::Cancel, transfer) => {
                let dead = transfer.as_ref().map_or(false, |t| {
                    t.state() == TransferState::Interrupted && !t.can_resume()
                });
                if let Some(transfer) = &transfer {
                    transfer.cancel();
                }
                self.registry.remove(fingerprint);
                self.duplicates.take(fingerprint);
                info!(fingerprint, url, "download cancelled by command");

                // A dead transfer may never report again; settle it here.
                if let (true, Some(transfer), Some(token)) = (dead, transfer, token) {
                    self.subscriptions.unsubscribe(transfer.id(), token);
                    self.sink.emit(DownloadEvent::Cancelled {
                        fingerprint: fingerprint.to_string(),
                        url: url.to_string(),
                    });
                }
            }
            (_, None) => debug!(fingerprint, ?command, "transfer not started yet, command ignored"),
        }
    }

    /// Host-reported state of the matching transfer. A paused transfer is
    /// reported as `interrupted`, never as `progressing`.
    pub fn query_state(&self, fingerprint: &str, url: &str) -> Option<TransferState> {
        let record = self.registry.get(fingerprint).filter(|r| r.url == url)?;
        let transfer = &record.handle.as_ref()?.transfer;
        let state = transfer.state();
        if state == TransferState::Progressing && transfer.is_paused() {
            return Some(TransferState::Interrupted);
        }
        Some(state)
    }

    pub fn query_state_shaped(&self, fingerprint: &str, url: &str, shape: ReturnShape) -> StateReply {
        StateReply::shaped(self.query_state(fingerprint, url), shape)
    }

    /// Where the live transfer for `fingerprint` is being written.
    pub fn saved_path(&self, fingerprint: &str) -> Option<std::path::PathBuf> {
        self.registry
            .get(fingerprint)?
            .handle
            .as_ref()?
            .transfer
            .save_path()
    }

    fn owns_record(&self, sub: &Subscription) -> bool {
        self.registry
            .get(&sub.fingerprint)
            .and_then(|r| r.handle.as_ref())
            .map_or(false, |h| h.token == sub.token)
    }

    fn fan_out(&self, sub: &Subscription, duplicates: Vec<DuplicateRequest>) {
        for dup in duplicates {
            let copied = if dup.destination_path == sub.destination_path {
                Ok(())
            } else {
                fs::copy(&sub.destination_path, &dup.destination_path).map(|_| ())
            };

            match copied {
                Ok(()) => self.sink.emit(DownloadEvent::Completed {
                    fingerprint: dup.fingerprint,
                    url: dup.url,
                    destination_path: dup.destination_path,
                }),
                Err(e) => {
                    warn!(
                        fingerprint = %dup.fingerprint,
                        path = %dup.destination_path.display(),
                        "failed to satisfy duplicate request: {}",
                        e
                    );
                    self.sink.emit(DownloadEvent::Interrupted {
                        fingerprint: dup.fingerprint,
                        url: dup.url,
                    });
                }
            }
        }
    }
}

/// Create the parent directory of `destination` if it does not exist.
pub fn ensure_parent_dir(destination: &Path) -> Result<(), BridgeError> {
    let Some(dir) = destination.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777);
    }
    builder
        .create(dir)
        .map_err(|e| BridgeError::filesystem(dir, e))
}
