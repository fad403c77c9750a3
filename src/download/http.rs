// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Built-in host download primitive over `reqwest`.
//!
//! Each transfer waits for its save path before writing anything, streams
//! the body to disk and reports through [`HostEvent`]s. Pausing stops
//! polling the body; the connection stays open until resume or cancel.
//! There is no byte-range resume, so `can_resume` only holds while paused.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::host::{DownloadHost, HostEvent, Transfer};
use super::types::{TransferId, TransferState};
use crate::error::BridgeError;
use crate::locks::resilient_lock;

/// Minimum spacing between progress notifications.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// How long a started transfer waits for someone to claim it.
const SAVE_PATH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

#[derive(Debug)]
struct Progress {
    state: TransferState,
    received: u64,
    total: u64,
    save_path: Option<PathBuf>,
    /// A partial file exists at `save_path`.
    partial: bool,
}

/// One HTTP download driven by [`HttpHost`].
#[derive(Debug)]
pub struct HttpTransfer {
    id: TransferId,
    url: String,
    progress: Mutex<Progress>,
    control: watch::Sender<Control>,
    save_path_tx: watch::Sender<Option<PathBuf>>,
    events: mpsc::UnboundedSender<HostEvent>,
    this: Weak<HttpTransfer>,
}

impl HttpTransfer {
    fn new(id: TransferId, url: &str, events: mpsc::UnboundedSender<HostEvent>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            url: url.to_string(),
            progress: Mutex::new(Progress {
                state: TransferState::Progressing,
                received: 0,
                total: 0,
                save_path: None,
                partial: false,
            }),
            control: watch::Sender::new(Control::Run),
            save_path_tx: watch::Sender::new(None),
            events,
            this: this.clone(),
        })
    }

    fn control(&self) -> Control {
        *self.control.borrow()
    }

    fn set_total(&self, total: u64) {
        resilient_lock(&self.progress).total = total;
    }

    fn add_received(&self, n: u64) {
        resilient_lock(&self.progress).received += n;
    }

    fn set_partial(&self, partial: bool) {
        resilient_lock(&self.progress).partial = partial;
    }

    fn finish(&self, state: TransferState) {
        let mut progress = resilient_lock(&self.progress);
        progress.state = state;
        if state == TransferState::Completed {
            progress.partial = false;
            if progress.total == 0 {
                progress.total = progress.received;
            }
        }
    }

    /// Settle an interrupted transfer as cancelled. No task is left to do
    /// it, so the leftover file is removed and `Done` is sent from here.
    fn cancel_interrupted(&self) {
        let leftover = {
            let mut progress = resilient_lock(&self.progress);
            if progress.state != TransferState::Interrupted {
                return;
            }
            progress.state = TransferState::Cancelled;
            if std::mem::take(&mut progress.partial) {
                progress.save_path.clone()
            } else {
                None
            }
        };

        if let Some(path) = leftover {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), "partial file not removed: {}", e);
            }
        }
        if let Some(transfer) = self.this.upgrade() {
            let _ = self.events.send(HostEvent::Done {
                transfer,
                state: TransferState::Cancelled,
            });
        }
    }
}

impl Transfer for HttpTransfer {
    fn id(&self) -> TransferId {
        self.id
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn state(&self) -> TransferState {
        resilient_lock(&self.progress).state
    }

    fn is_paused(&self) -> bool {
        self.state() == TransferState::Progressing && self.control() == Control::Pause
    }

    fn can_resume(&self) -> bool {
        self.is_paused()
    }

    fn received_bytes(&self) -> u64 {
        resilient_lock(&self.progress).received
    }

    fn total_bytes(&self) -> u64 {
        resilient_lock(&self.progress).total
    }

    fn save_path(&self) -> Option<PathBuf> {
        resilient_lock(&self.progress).save_path.clone()
    }

    fn set_save_path(&self, path: PathBuf) {
        resilient_lock(&self.progress).save_path = Some(path.clone());
        self.save_path_tx.send_replace(Some(path));
    }

    fn pause(&self) {
        if self.state() == TransferState::Progressing && self.control() == Control::Run {
            self.control.send_replace(Control::Pause);
        }
    }

    fn resume(&self) {
        if self.is_paused() {
            self.control.send_replace(Control::Run);
        }
    }

    fn cancel(&self) {
        match self.state() {
            TransferState::Progressing => {
                self.control.send_replace(Control::Cancel);
            }
            TransferState::Interrupted => self.cancel_interrupted(),
            _ => {}
        }
    }
}

/// Host that performs downloads itself.
pub struct HttpHost {
    client: reqwest::Client,
    events: mpsc::UnboundedSender<HostEvent>,
    next_id: AtomicU64,
}

impl HttpHost {
    pub fn new(client: reqwest::Client, events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self {
            client,
            events,
            next_id: AtomicU64::new(0),
        }
    }
}

impl DownloadHost for HttpHost {
    fn begin_transfer(&self, url: &str) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("HTTP host needs a running tokio runtime")?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let transfer = HttpTransfer::new(id, url, self.events.clone());

        // Started goes out before the task can emit anything else.
        self.events
            .send(HostEvent::Started(transfer.clone()))
            .map_err(|_| BridgeError::Host("download manager is gone".to_string()))?;

        runtime.spawn(run_transfer(self.client.clone(), transfer, self.events.clone()));
        Ok(())
    }
}

fn notify(events: &mpsc::UnboundedSender<HostEvent>, transfer: &Arc<HttpTransfer>, state: TransferState) {
    let event = HostEvent::Updated {
        transfer: transfer.clone(),
        state,
    };
    let _ = events.send(event);
}

fn finish(events: &mpsc::UnboundedSender<HostEvent>, transfer: &Arc<HttpTransfer>, state: TransferState) {
    transfer.finish(state);
    let _ = events.send(HostEvent::Done {
        transfer: transfer.clone(),
        state,
    });
}

async fn wait_for_save_path(transfer: &HttpTransfer) -> Option<PathBuf> {
    let mut path_rx = transfer.save_path_tx.subscribe();
    let mut control_rx = transfer.control.subscribe();

    tokio::select! {
        claimed = tokio::time::timeout(SAVE_PATH_TIMEOUT, path_rx.wait_for(Option::is_some)) => {
            match claimed {
                Ok(Ok(path)) => path.clone(),
                _ => None,
            }
        }
        _ = control_rx.wait_for(|c| *c == Control::Cancel) => None,
    }
}

async fn run_transfer(
    client: reqwest::Client,
    transfer: Arc<HttpTransfer>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let Some(path) = wait_for_save_path(&transfer).await else {
        let state = if transfer.control() == Control::Cancel {
            TransferState::Cancelled
        } else {
            debug!(transfer = transfer.id, url = %transfer.url, "no save path assigned, giving up");
            TransferState::Interrupted
        };
        finish(&events, &transfer, state);
        return;
    };

    let response = match client
        .get(&transfer.url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %transfer.url, "download request failed: {}", e);
            finish(&events, &transfer, TransferState::Interrupted);
            return;
        }
    };
    transfer.set_total(response.content_length().unwrap_or(0));

    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => {
            transfer.set_partial(true);
            file
        }
        Err(e) => {
            warn!(path = %path.display(), "cannot create download file: {}", e);
            finish(&events, &transfer, TransferState::Interrupted);
            return;
        }
    };

    let mut control_rx = transfer.control.subscribe();
    let mut stream = response.bytes_stream();
    let mut last_tick: Option<Instant> = None;

    loop {
        let control = *control_rx.borrow_and_update();
        match control {
            Control::Cancel => {
                drop(file);
                transfer.set_partial(false);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), "partial file not removed: {}", e);
                }
                finish(&events, &transfer, TransferState::Cancelled);
                return;
            }
            Control::Pause => {
                notify(&events, &transfer, TransferState::Progressing);
                if control_rx.changed().await.is_err() {
                    finish(&events, &transfer, TransferState::Interrupted);
                    return;
                }
                continue;
            }
            Control::Run => {}
        }

        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        warn!(path = %path.display(), "write failed: {}", e);
                        finish(&events, &transfer, TransferState::Interrupted);
                        return;
                    }
                    transfer.add_received(bytes.len() as u64);
                    if last_tick.map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL) {
                        notify(&events, &transfer, TransferState::Progressing);
                        last_tick = Some(Instant::now());
                    }
                }
                Some(Err(e)) => {
                    warn!(url = %transfer.url, "download stream failed: {}", e);
                    finish(&events, &transfer, TransferState::Interrupted);
                    return;
                }
                None => break,
            },
            _ = control_rx.changed() => {}
        }
    }

    if let Err(e) = file.flush().await {
        warn!(path = %path.display(), "flush failed: {}", e);
        finish(&events, &transfer, TransferState::Interrupted);
        return;
    }
    drop(file);

    // Final tick so the UI sees the full byte count before completion.
    transfer.finish(TransferState::Progressing);
    notify(&events, &transfer, TransferState::Progressing);
    finish(&events, &transfer, TransferState::Completed);
}
