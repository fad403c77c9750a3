// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! deskbridge - native side of a desktop shell
//!
//! Tracks UI downloads by content fingerprint and keeps the local backend
//! server alive.
//!
//! **UI** -> **Bridge (HTTP/SSE)** -> **Download manager / Supervisor**
//!
//! # Core Modules
//!
//! - [`download`] - Fingerprinted download lifecycle, duplicate fan-out, HTTP host
//! - [`supervisor`] - Singleton server process, stdio forwarding, heartbeat restarts
//! - [`backend`] - Heartbeat probe and API passthrough to the managed server
//! - [`bridge`] - Local HTTP + server-sent events surface for the UI
//! - [`config`] - JSON configuration with project and user files
//! - [`logging`] - Size-capped file log plus optional console
//! - [`error`] - Error taxonomy and user-facing error formatting

pub mod backend;
pub mod bridge;
pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod logging;
pub mod supervisor;

pub use backend::BackendClient;
pub use bridge::{Bridge, BridgeState};
pub use config::{load_config, save_config, Config};
pub use download::{
    DownloadEvent, DownloadManager, DownloadService, RequestOutcome, ReturnShape, StateCommand,
    StateReply, TransferState,
};
pub use error::{format_error, BridgeError};
pub use supervisor::{HeartbeatMonitor, HeartbeatProbe, ServerSupervisor};
