// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor behaviour with a fake process collaborator. The fake spawns
//! real short-lived children, so these run on Unix only.

#![cfg(unix)]

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deskbridge::backend::BackendClient;
use deskbridge::config::ServerConfig;
use deskbridge::supervisor::{
    Alert, HeartbeatProbe, ProcessControl, ServerLaunch, ServerSupervisor,
};

const LONG_RUNNING: (&str, &[&str]) = ("sleep", &["30"]);
const EXITS_AT_ONCE: (&str, &[&str]) = ("sh", &["-c", "echo booting; exit 3"]);

/// Runs `first` for the first spawn and `rest` afterwards.
struct FakeProcesses {
    first: (&'static str, &'static [&'static str]),
    rest: (&'static str, &'static [&'static str]),
    kill_delay: Duration,
    spawns: AtomicUsize,
    name_kills: AtomicUsize,
    /// Spawn count seen as each by-name kill finished.
    spawns_at_kill: Mutex<Vec<usize>>,
}

impl FakeProcesses {
    fn with(
        first: (&'static str, &'static [&'static str]),
        rest: (&'static str, &'static [&'static str]),
        kill_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            first,
            rest,
            kill_delay,
            spawns: AtomicUsize::new(0),
            name_kills: AtomicUsize::new(0),
            spawns_at_kill: Mutex::new(Vec::new()),
        })
    }

    fn long_running() -> Arc<Self> {
        Self::with(LONG_RUNNING, LONG_RUNNING, Duration::ZERO)
    }

    fn exits_immediately() -> Arc<Self> {
        Self::with(EXITS_AT_ONCE, EXITS_AT_ONCE, Duration::ZERO)
    }

    /// Crashes on first launch, and by-name cleanup is slow.
    fn crashes_once_with_slow_cleanup() -> Arc<Self> {
        Self::with(EXITS_AT_ONCE, LONG_RUNNING, Duration::from_millis(300))
    }

    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    fn name_kills(&self) -> usize {
        self.name_kills.load(Ordering::SeqCst)
    }
}

impl ProcessControl for FakeProcesses {
    fn spawn(&self, _launch: &ServerLaunch) -> anyhow::Result<tokio::process::Child> {
        let (program, args) = if self.spawns.fetch_add(1, Ordering::SeqCst) == 0 {
            self.first
        } else {
            self.rest
        };
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    fn find_by_name(&self, _name: &str) -> Vec<u32> {
        Vec::new()
    }

    fn kill_by_name(&self, _name: &str) -> usize {
        self.name_kills.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.kill_delay);
        self.spawns_at_kill.lock().unwrap().push(self.spawns());
        0
    }
}

#[derive(Default)]
struct QuietAlert(AtomicUsize);

impl Alert for QuietAlert {
    fn missing_executable(&self, _path: &Path) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn supervisor(processes: Arc<FakeProcesses>) -> Arc<ServerSupervisor> {
    Arc::new(ServerSupervisor::new(
        ServerLaunch::new("/nonexistent/resources/server", "/nonexistent/resources"),
        processes,
        Arc::new(QuietAlert::default()),
    ))
}

async fn closed_port_backend() -> BackendClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    BackendClient::from_config(&ServerConfig::default())
        .unwrap()
        .with_base_url(format!("http://{}", addr))
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn test_start_twice_spawns_once() {
    let processes = FakeProcesses::long_running();
    let sup = supervisor(processes.clone());

    sup.start();
    let pid = sup.pid();
    sup.start();

    assert_eq!(processes.spawns(), 1);
    assert!(sup.is_running());
    assert!(pid.is_some());
    assert_eq!(sup.pid(), pid);
    // Stale same-named processes are cleared once, before the only spawn.
    assert_eq!(processes.name_kills(), 1);

    sup.close();
}

#[tokio::test]
async fn test_stop_and_close_in_any_order() {
    let processes = FakeProcesses::long_running();
    let sup = supervisor(processes.clone());

    sup.stop();
    sup.close();
    sup.start();
    assert!(sup.is_running());

    sup.stop();
    assert!(!sup.is_running());
    sup.stop();
    sup.close();
    assert!(!sup.is_running());

    // one by-name kill for the start and one per stop/close call
    assert_eq!(processes.name_kills(), 6);

    sup.start();
    assert_eq!(processes.spawns(), 2);
    sup.close();
}

#[tokio::test]
async fn test_unexpected_exit_clears_handle_and_cleans_up() {
    let processes = FakeProcesses::exits_immediately();
    let sup = supervisor(processes.clone());

    sup.start();
    assert_eq!(processes.spawns(), 1);

    assert!(wait_until(|| !sup.is_running()).await);
    assert!(wait_until(|| processes.name_kills() == 2).await);

    // Not restarted on exit alone.
    assert_eq!(processes.spawns(), 1);
}

#[tokio::test]
async fn test_heartbeat_threshold_restarts_once() {
    let processes = FakeProcesses::long_running();
    let sup = supervisor(processes.clone());
    sup.start();

    let probe = HeartbeatProbe::new(closed_port_backend().await, sup.clone(), 3, false);

    assert!(!probe.check().await);
    assert!(!probe.check().await);
    assert_eq!(processes.spawns(), 1);
    assert_eq!(probe.monitor().failures(), 2);

    assert!(!probe.check().await);
    assert_eq!(processes.spawns(), 2);
    assert_eq!(probe.monitor().failures(), 0);
    assert!(sup.is_running());

    sup.close();
}

#[tokio::test]
async fn test_heartbeat_never_restarts_in_development() {
    let processes = FakeProcesses::long_running();
    let sup = supervisor(processes.clone());

    let probe = HeartbeatProbe::new(closed_port_backend().await, sup.clone(), 2, true);
    for _ in 0..4 {
        probe.check().await;
    }

    assert_eq!(processes.spawns(), 0);
    assert_eq!(processes.name_kills(), 0);
}

#[tokio::test]
async fn test_idle_check_skips_after_recent_probe() {
    let processes = FakeProcesses::long_running();
    let sup = supervisor(processes.clone());
    let probe = HeartbeatProbe::new(closed_port_backend().await, sup.clone(), 10, false);

    assert_eq!(probe.check_if_idle(Duration::from_secs(60)).await, Some(false));
    assert_eq!(probe.monitor().failures(), 1);

    // A probe just ran, so the periodic one does not count again.
    assert_eq!(probe.check_if_idle(Duration::from_secs(60)).await, None);
    assert!(!probe.check().await);
    assert_eq!(probe.monitor().failures(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_during_exit_cleanup_keeps_new_server() {
    let processes = FakeProcesses::crashes_once_with_slow_cleanup();
    let sup = supervisor(processes.clone());

    sup.start();
    // Keep starting while the crash cleanup is still running.
    for _ in 0..100 {
        if processes.spawns() == 2 {
            break;
        }
        sup.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(processes.spawns(), 2);

    // No by-name kill finished after the replacement was spawned.
    let at_kill = processes.spawns_at_kill.lock().unwrap().clone();
    assert!(at_kill.iter().all(|&spawns| spawns < 2), "{:?}", at_kill);
    assert!(sup.is_running());

    sup.close();
}
