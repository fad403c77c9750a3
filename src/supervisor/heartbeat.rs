// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Heartbeat failure counting and threshold restarts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::ServerSupervisor;
use crate::backend::BackendClient;
use crate::locks::resilient_lock;

/// Result of recording one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Healthy,
    Failed { consecutive: u32 },
    /// The threshold was reached; the counter is already back at zero.
    RestartRequired,
}

/// Consecutive heartbeat failure counter.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    failures: AtomicU32,
    threshold: u32,
}

impl HeartbeatMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn record(&self, ok: bool) -> HeartbeatOutcome {
        if ok {
            self.failures.store(0, Ordering::SeqCst);
            return HeartbeatOutcome::Healthy;
        }

        // Increment and reset in one step so only one caller sees the threshold.
        let threshold = self.threshold;
        let previous = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                let next = n.saturating_add(1);
                Some(if next >= threshold { 0 } else { next })
            })
            .unwrap_or_else(|n| n);
        let consecutive = previous.saturating_add(1);
        if consecutive >= threshold {
            HeartbeatOutcome::RestartRequired
        } else {
            HeartbeatOutcome::Failed { consecutive }
        }
    }
}

/// Heartbeat probe wired to the supervisor.
#[derive(Debug)]
pub struct HeartbeatProbe {
    backend: BackendClient,
    monitor: HeartbeatMonitor,
    supervisor: Arc<ServerSupervisor>,
    development: bool,
    last_check: Mutex<Option<Instant>>,
    restarting: AtomicBool,
}

impl HeartbeatProbe {
    pub fn new(
        backend: BackendClient,
        supervisor: Arc<ServerSupervisor>,
        threshold: u32,
        development: bool,
    ) -> Self {
        Self {
            backend,
            monitor: HeartbeatMonitor::new(threshold),
            supervisor,
            development,
            last_check: Mutex::new(None),
            restarting: AtomicBool::new(false),
        }
    }

    pub fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    /// Probe once. Restarts the server when the failure threshold is hit,
    /// except in development where the server is run by hand.
    pub async fn check(&self) -> bool {
        *resilient_lock(&self.last_check) = Some(Instant::now());
        let ok = self.backend.heartbeat().await;

        match self.monitor.record(ok) {
            HeartbeatOutcome::Healthy => {}
            HeartbeatOutcome::Failed { consecutive } => {
                debug!(consecutive, threshold = self.monitor.threshold, "heartbeat failed");
            }
            HeartbeatOutcome::RestartRequired if self.development => {
                debug!("heartbeat threshold reached, restart skipped in development");
            }
            HeartbeatOutcome::RestartRequired if self.restarting.swap(true, Ordering::SeqCst) => {
                debug!("heartbeat threshold reached, restart already in progress");
            }
            HeartbeatOutcome::RestartRequired => {
                warn!(
                    threshold = self.monitor.threshold,
                    "server unresponsive, restarting"
                );
                let supervisor = self.supervisor.clone();
                let restarted = tokio::task::spawn_blocking(move || {
                    supervisor.stop();
                    supervisor
                })
                .await;
                match restarted {
                    Ok(supervisor) => supervisor.start(),
                    Err(e) => warn!("server stop task failed: {}", e),
                }
                self.restarting.store(false, Ordering::SeqCst);
            }
        }

        ok
    }

    /// Probe only if nothing else has within `interval`. The periodic loop
    /// uses this so UI-driven checks are not counted twice.
    pub async fn check_if_idle(&self, interval: Duration) -> Option<bool> {
        let last = *resilient_lock(&self.last_check);
        let recent = last.map_or(false, |at| at.elapsed() < interval);
        if recent {
            return None;
        }
        Some(self.check().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_at_threshold_then_reset() {
        let monitor = HeartbeatMonitor::new(3);
        assert_eq!(monitor.record(false), HeartbeatOutcome::Failed { consecutive: 1 });
        assert_eq!(monitor.record(false), HeartbeatOutcome::Failed { consecutive: 2 });
        assert_eq!(monitor.record(false), HeartbeatOutcome::RestartRequired);
        assert_eq!(monitor.failures(), 0);
        assert_eq!(monitor.record(false), HeartbeatOutcome::Failed { consecutive: 1 });
    }

    #[test]
    fn test_success_resets_counter() {
        let monitor = HeartbeatMonitor::new(2);
        monitor.record(false);
        assert_eq!(monitor.record(true), HeartbeatOutcome::Healthy);
        assert_eq!(monitor.failures(), 0);
        assert_eq!(monitor.record(false), HeartbeatOutcome::Failed { consecutive: 1 });
    }

    #[test]
    fn test_concurrent_failures_restart_once_per_threshold() {
        let monitor = Arc::new(HeartbeatMonitor::new(4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| monitor.record(false) == HeartbeatOutcome::RestartRequired)
                        .count()
                })
            })
            .collect();

        let restarts: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(restarts, 200);
        assert_eq!(monitor.failures(), 0);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let monitor = HeartbeatMonitor::new(0);
        assert_eq!(monitor.threshold(), 1);
        assert_eq!(monitor.record(false), HeartbeatOutcome::RestartRequired);
    }
}
