// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collaborator contracts between the lifecycle manager and the host.
//!
//! The host owns the actual byte transfer. The manager only asks it to begin
//! a URL-addressed transfer and then reacts to the notifications the host
//! delivers through [`HostEvent`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use super::types::{DownloadEvent, TransferId, TransferState};

/// A single host-managed download.
///
/// Commands issued against a transfer that already reached a terminal state
/// must be harmless; the manager does not check before calling them.
pub trait Transfer: Send + Sync {
    fn id(&self) -> TransferId;
    fn url(&self) -> String;
    fn state(&self) -> TransferState;
    fn is_paused(&self) -> bool;
    fn can_resume(&self) -> bool;
    fn received_bytes(&self) -> u64;
    fn total_bytes(&self) -> u64;
    fn save_path(&self) -> Option<PathBuf>;
    fn set_save_path(&self, path: PathBuf);
    fn pause(&self);
    fn resume(&self);
    fn cancel(&self);
}

/// The host's download primitive.
pub trait DownloadHost: Send + Sync {
    /// Ask the host to begin downloading `url`. The host answers later
    /// with [`HostEvent::Started`] carrying the transfer object.
    fn begin_transfer(&self, url: &str) -> anyhow::Result<()>;
}

/// Notification delivered by the host, in the order the host observed it.
#[derive(Clone)]
pub enum HostEvent {
    /// A transfer began. Fires for every host download, ours or not.
    Started(Arc<dyn Transfer>),
    /// Non-terminal progress tick (`progressing` or `interrupted`).
    Updated {
        transfer: Arc<dyn Transfer>,
        state: TransferState,
    },
    /// The transfer finished (`completed`, `cancelled` or `interrupted`).
    Done {
        transfer: Arc<dyn Transfer>,
        state: TransferState,
    },
}

impl HostEvent {
    pub fn transfer(&self) -> &Arc<dyn Transfer> {
        match self {
            HostEvent::Started(transfer)
            | HostEvent::Updated { transfer, .. }
            | HostEvent::Done { transfer, .. } => transfer,
        }
    }
}

impl std::fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transfer = self.transfer();
        match self {
            HostEvent::Started(_) => write!(f, "Started(#{} {})", transfer.id(), transfer.url()),
            HostEvent::Updated { state, .. } => {
                write!(f, "Updated(#{} {:?})", transfer.id(), state)
            }
            HostEvent::Done { state, .. } => write!(f, "Done(#{} {:?})", transfer.id(), state),
        }
    }
}

/// Push channel towards the UI. Fire-and-forget.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DownloadEvent);
}

impl EventSink for mpsc::UnboundedSender<DownloadEvent> {
    fn emit(&self, event: DownloadEvent) {
        if self.send(event).is_err() {
            tracing::debug!("download event dropped: receiver closed");
        }
    }
}

impl EventSink for broadcast::Sender<DownloadEvent> {
    fn emit(&self, event: DownloadEvent) {
        // No subscribers simply means no UI is listening right now.
        let _ = self.send(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: DownloadEvent) {
        (**self).emit(event)
    }
}
