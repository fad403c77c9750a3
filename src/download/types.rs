// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download records, commands and UI event payloads.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::host::Transfer;

/// Caller-supplied identity of "this logical file".
pub type Fingerprint = String;

/// Host-assigned identity of a single transfer object.
pub type TransferId = u64;

/// State of a host transfer as the host reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Progressing,
    Completed,
    Cancelled,
    Interrupted,
}

impl TransferState {
    /// No further notifications follow a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Progressing => "progressing",
            TransferState::Completed => "completed",
            TransferState::Cancelled => "cancelled",
            TransferState::Interrupted => "interrupted",
        }
    }
}

/// UI command against a live download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StateCommand {
    Pause,
    Resume,
    Cancel,
}

impl std::str::FromStr for StateCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(StateCommand::Pause),
            "resume" => Ok(StateCommand::Resume),
            "cancel" => Ok(StateCommand::Cancel),
            other => Err(format!("unknown download command: {}", other)),
        }
    }
}

/// Live host transfer attached to a record.
#[derive(Clone)]
pub struct AttachedTransfer {
    pub transfer: Arc<dyn Transfer>,
    /// Subscription registered for this transfer's notifications.
    pub token: SubscriptionToken,
}

impl std::fmt::Debug for AttachedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedTransfer")
            .field("transfer", &self.transfer.id())
            .field("token", &self.token)
            .finish()
    }
}

/// Registry entry for one fingerprint.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub fingerprint: Fingerprint,
    /// Source URL most recently associated with the fingerprint.
    pub url: String,
    pub destination_path: PathBuf,
    /// Present only while the host has a live transfer for this record.
    pub handle: Option<AttachedTransfer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn new(fingerprint: impl Into<String>, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint.into(),
            url: url.into(),
            destination_path: path.into(),
            handle: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a request targets exactly this record.
    pub fn matches(&self, url: &str, path: &std::path::Path) -> bool {
        self.url == url && self.destination_path == path
    }

    /// Mark the record as touched by a host notification.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A request for an in-flight fingerprint via another URL or destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateRequest {
    pub fingerprint: Fingerprint,
    pub url: String,
    pub destination_path: PathBuf,
}

/// Token returned when the manager subscribes to a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub(crate) u64);

/// Notification pushed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DownloadEvent {
    Interrupted {
        fingerprint: Fingerprint,
        url: String,
    },
    Pause {
        fingerprint: Fingerprint,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Progressing {
        fingerprint: Fingerprint,
        url: String,
        destination_path: PathBuf,
        bytes_received: u64,
        bytes_total: u64,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        fingerprint: Fingerprint,
        url: String,
        destination_path: PathBuf,
    },
    Cancelled {
        fingerprint: Fingerprint,
        url: String,
    },
}

impl DownloadEvent {
    /// Event kind as sent on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadEvent::Interrupted { .. } => "interrupted",
            DownloadEvent::Pause { .. } => "pause",
            DownloadEvent::Progressing { .. } => "progressing",
            DownloadEvent::Completed { .. } => "completed",
            DownloadEvent::Cancelled { .. } => "cancelled",
        }
    }

    pub fn fingerprint(&self) -> &str {
        match self {
            DownloadEvent::Interrupted { fingerprint, .. }
            | DownloadEvent::Pause { fingerprint, .. }
            | DownloadEvent::Progressing { fingerprint, .. }
            | DownloadEvent::Completed { fingerprint, .. }
            | DownloadEvent::Cancelled { fingerprint, .. } => fingerprint,
        }
    }
}

/// Shape of a `queryState` answer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReturnShape {
    /// Bare state string (or null).
    #[default]
    Str,
    /// `{ "state": ... }` wrapper.
    Obj,
}

/// Answer to a `queryState` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StateReply {
    Bare(Option<TransferState>),
    Wrapped { state: Option<TransferState> },
}

impl StateReply {
    pub fn shaped(state: Option<TransferState>, shape: ReturnShape) -> Self {
        match shape {
            ReturnShape::Str => StateReply::Bare(state),
            ReturnShape::Obj => StateReply::Wrapped { state },
        }
    }

    pub fn state(&self) -> Option<TransferState> {
        match self {
            StateReply::Bare(state) | StateReply::Wrapped { state } => *state,
        }
    }
}
