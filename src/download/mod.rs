// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle management for deskbridge
//!
//! This module tracks UI-requested downloads by fingerprint on top of a
//! host download primitive:
//! - One live record per fingerprint, correlated to host transfers by URL
//! - Pause/resume/cancel commands addressed by fingerprint + URL
//! - Duplicate requests satisfied by copying the finished file
//! - Status events pushed to the UI through an [`EventSink`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadService │────▶│ Worker (tokio)  │
//! │ (UI commands)   │     │ DownloadManager │
//! └─────────────────┘     └────────┬────────┘
//!          ▲                       │
//!          │ HostEvent             ▼
//! ┌────────┴────────┐     ┌─────────────────┐
//! │ DownloadHost    │     │ EventSink       │
//! │ (HttpHost)      │     │ (UI channel)    │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use deskbridge::download::DownloadService;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let (service, _worker) = DownloadService::spawn_http(reqwest::Client::new(), Arc::new(events_tx));
//!
//! service
//!     .request_download("https://example.com/a.zip", "/tmp/a.zip", "a-zip")
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}: {}", event.fingerprint(), event.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod host;
pub mod http;
pub mod manager;
pub mod registry;
pub mod service;
pub mod types;

// Re-export commonly used items
pub use host::{DownloadHost, EventSink, HostEvent, Transfer};
pub use http::{HttpHost, HttpTransfer};
pub use manager::{ensure_parent_dir, DownloadManager, RequestOutcome};
pub use service::{DownloadCommand, DownloadService};
pub use types::{
    DownloadEvent, DownloadRecord, DuplicateRequest, ReturnShape, StateCommand, StateReply,
    TransferState,
};
