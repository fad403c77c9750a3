// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process supervisor for the managed backend server.
//!
//! Keeps at most one server process alive. Starting clears out stale
//! same-named processes first, stdout/stderr are forwarded to the log, and
//! an exit watcher cleans up after unexpected exits. Restarting is left to
//! the caller (see [`heartbeat`]).
//!
//! ```text
//! Stopped ──start()──▶ Running ──stop()/close()/exit──▶ Stopped
//! ```
//!
//! `start`, `stop` and `close` never fail and may be called in any order.
//! They need a tokio runtime for the exit watcher and output pipes.

pub mod heartbeat;
pub mod process;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::format_error;
use crate::locks::resilient_lock;

pub use heartbeat::{HeartbeatMonitor, HeartbeatOutcome, HeartbeatProbe};
pub use process::{ProcessControl, ServerLaunch, SystemProcesses};

/// Log target for lines printed by the managed server.
pub const SERVER_LOG_TARGET: &str = "deskbridge::server";

/// User-visible notifications raised by the supervisor.
pub trait Alert: Send + Sync {
    /// The server executable is not where it should be. Start continues.
    fn missing_executable(&self, path: &Path);
}

/// Reports alerts to the log and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlert;

impl Alert for LogAlert {
    fn missing_executable(&self, path: &Path) {
        error!(path = %path.display(), "server executable not found");
        eprintln!(
            "{}",
            format_error(
                &format!("Server executable not found: {}", path.display()),
                &[
                    "The application was not installed completely",
                    "server.executable or server.resources_dir points somewhere else",
                ],
                &[
                    "Reinstall the application",
                    "Check the server section of deskbridge.json",
                ],
            )
        );
    }
}

/// Which reactions of a running process are still wanted.
#[derive(Debug)]
struct Listeners {
    exit: AtomicBool,
    output: AtomicBool,
}

impl Default for Listeners {
    fn default() -> Self {
        Self {
            exit: AtomicBool::new(true),
            output: AtomicBool::new(true),
        }
    }
}

#[derive(Debug)]
struct TrackedServer {
    pid: Option<u32>,
    generation: u64,
    listeners: Arc<Listeners>,
    kill_tx: Option<oneshot::Sender<()>>,
}

type Tracked = Arc<Mutex<Option<TrackedServer>>>;

/// Owner of the singleton server process.
pub struct ServerSupervisor {
    launch: ServerLaunch,
    processes: Arc<dyn ProcessControl>,
    alert: Arc<dyn Alert>,
    tracked: Tracked,
    generation: AtomicU64,
}

impl std::fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("launch", &self.launch)
            .field("pid", &self.pid())
            .finish()
    }
}

impl ServerSupervisor {
    pub fn new(launch: ServerLaunch, processes: Arc<dyn ProcessControl>, alert: Arc<dyn Alert>) -> Self {
        Self {
            launch,
            processes,
            alert,
            tracked: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Supervisor for the configured server using the real OS.
    pub fn from_config(config: &ServerConfig) -> Self {
        let launch = ServerLaunch::new(config.executable_path(), config.resources_dir());
        Self::new(launch, Arc::new(SystemProcesses), Arc::new(LogAlert))
    }

    pub fn launch(&self) -> &ServerLaunch {
        &self.launch
    }

    pub fn is_running(&self) -> bool {
        resilient_lock(&self.tracked).is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        resilient_lock(&self.tracked).as_ref().and_then(|s| s.pid)
    }

    /// Start the server unless one is already tracked.
    pub fn start(&self) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("cannot start server outside a tokio runtime: {}", e);
                return;
            }
        };

        let mut tracked = resilient_lock(&self.tracked);
        if let Some(server) = tracked.as_ref() {
            debug!(pid = ?server.pid, "server already running");
            return;
        }

        let executable = &self.launch.executable;
        if !executable.exists() {
            self.alert.missing_executable(executable);
        }

        let name = self.launch.process_name();
        let stale = self.processes.kill_by_name(&name);
        if stale > 0 {
            info!(name = %name, count = stale, "killed stale server processes");
        }

        let mut child = match self.processes.spawn(&self.launch) {
            Ok(child) => child,
            Err(e) => {
                error!("failed to start server: {:#}", e);
                return;
            }
        };

        let pid = child.id();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let listeners = Arc::new(Listeners::default());

        if let Some(stdout) = child.stdout.take() {
            runtime.spawn(forward_lines(stdout, listeners.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            runtime.spawn(forward_lines(stderr, listeners.clone(), true));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *tracked = Some(TrackedServer {
            pid,
            generation,
            listeners: listeners.clone(),
            kill_tx: Some(kill_tx),
        });
        drop(tracked);

        runtime.spawn(watch_exit(
            child,
            kill_rx,
            generation,
            listeners,
            self.tracked.clone(),
            self.processes.clone(),
            name,
        ));
        info!(pid = ?pid, executable = %executable.display(), "server started");
    }

    /// Stop the tracked server and kill anything else with its name.
    pub fn stop(&self) {
        self.shutdown(false);
    }

    /// Like [`stop`](Self::stop) but also silences the output forwarding.
    pub fn close(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, detach_all: bool) {
        let taken = resilient_lock(&self.tracked).take();

        if let Some(mut server) = taken {
            server.listeners.exit.store(false, Ordering::SeqCst);
            if detach_all {
                server.listeners.output.store(false, Ordering::SeqCst);
            }
            let signalled = server
                .kill_tx
                .take()
                .map_or(false, |kill| kill.send(()).is_ok());
            if signalled {
                info!(pid = ?server.pid, "server stopped");
            } else {
                debug!(pid = ?server.pid, "server had already exited");
            }
        }

        let killed = self.processes.kill_by_name(&self.launch.process_name());
        if killed > 0 {
            debug!(count = killed, "killed server processes by name");
        }
    }
}

async fn forward_lines<R>(reader: R, listeners: Arc<Listeners>, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !listeners.output.load(Ordering::SeqCst) {
                    continue;
                }
                if is_stderr {
                    error!(target: SERVER_LOG_TARGET, "{}", line);
                } else {
                    info!(target: SERVER_LOG_TARGET, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("server output closed: {}", e);
                break;
            }
        }
    }
}

async fn watch_exit(
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
    generation: u64,
    listeners: Arc<Listeners>,
    tracked: Tracked,
    processes: Arc<dyn ProcessControl>,
    name: String,
) {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            if !listeners.exit.load(Ordering::SeqCst) {
                return;
            }
            match status {
                Ok(status) => warn!(pid = ?pid, "server exited unexpectedly: {}", status),
                Err(e) => warn!(pid = ?pid, "server wait failed: {}", e),
            }

            // Slot stays locked until the by-name cleanup is done; start() waits.
            let cleanup = tokio::task::spawn_blocking(move || {
                let mut tracked = resilient_lock(&tracked);
                if tracked.as_ref().map(|s| s.generation) != Some(generation) {
                    return 0;
                }
                let killed = processes.kill_by_name(&name);
                *tracked = None;
                killed
            })
            .await;
            match cleanup {
                Ok(killed) if killed > 0 => debug!(count = killed, "cleaned up after server exit"),
                Ok(_) => {}
                Err(e) => warn!("server cleanup task failed: {}", e),
            }
        }
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                debug!(pid = ?pid, "kill after stop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FailingSpawn {
        spawns: AtomicUsize,
        kills: AtomicUsize,
    }

    impl ProcessControl for FailingSpawn {
        fn spawn(&self, _launch: &ServerLaunch) -> anyhow::Result<tokio::process::Child> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("no such file")
        }

        fn find_by_name(&self, _name: &str) -> Vec<u32> {
            Vec::new()
        }

        fn kill_by_name(&self, _name: &str) -> usize {
            self.kills.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[derive(Default)]
    struct CountingAlert(AtomicUsize);

    impl Alert for CountingAlert {
        fn missing_executable(&self, _path: &Path) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_missing_executable_alerts_and_still_tries() {
        let dir = tempfile::tempdir().unwrap();
        let processes = Arc::new(FailingSpawn::default());
        let alert = Arc::new(CountingAlert::default());
        let supervisor = ServerSupervisor::new(
            ServerLaunch::new(dir.path().join("server"), dir.path()),
            processes.clone(),
            alert.clone(),
        );

        supervisor.start();

        assert_eq!(alert.0.load(Ordering::SeqCst), 1);
        assert_eq!(processes.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(processes.kills.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_process_still_kills_by_name() {
        let processes = Arc::new(FailingSpawn::default());
        let supervisor = ServerSupervisor::new(
            ServerLaunch::new("/nowhere/server", "/nowhere"),
            processes.clone(),
            Arc::new(CountingAlert::default()),
        );

        supervisor.stop();
        supervisor.close();
        supervisor.stop();

        assert_eq!(processes.kills.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.pid(), None);
    }

    /// Records `(target, level, message)` for every event.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<(String, tracing::Level, String)>>>);

    impl Captured {
        fn server_lines(&self) -> Vec<(tracing::Level, String)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(target, _, _)| target == SERVER_LOG_TARGET)
                .map(|(_, level, message)| (*level, message.clone()))
                .collect()
        }
    }

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Captured {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            let meta = event.metadata();
            self.0
                .lock()
                .unwrap()
                .push((meta.target().to_string(), *meta.level(), visitor.0));
        }
    }

    fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
        use tracing_subscriber::layer::SubscriberExt;
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        (captured, tracing::subscriber::set_default(subscriber))
    }

    #[tokio::test]
    async fn test_stdout_logs_info_and_stderr_logs_error() {
        let (captured, _guard) = capture();
        let listeners = Arc::new(Listeners::default());

        forward_lines(&b"listening on 19020\nready\n"[..], listeners.clone(), false).await;
        forward_lines(&b"traceback: boom\n"[..], listeners, true).await;

        assert_eq!(
            captured.server_lines(),
            vec![
                (tracing::Level::INFO, "listening on 19020".to_string()),
                (tracing::Level::INFO, "ready".to_string()),
                (tracing::Level::ERROR, "traceback: boom".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_detached_output_is_dropped() {
        let (captured, _guard) = capture();
        let listeners = Arc::new(Listeners::default());
        listeners.output.store(false, Ordering::SeqCst);

        forward_lines(&b"ignored\n"[..], listeners.clone(), false).await;
        forward_lines(&b"ignored too\n"[..], listeners, true).await;

        assert!(captured.server_lines().is_empty());
    }

    struct SleepSpawn;

    impl ProcessControl for SleepSpawn {
        fn spawn(&self, _launch: &ServerLaunch) -> anyhow::Result<tokio::process::Child> {
            let mut command = tokio::process::Command::new(if cfg!(windows) { "ping" } else { "sleep" });
            if cfg!(windows) {
                command.args(["-n", "30", "127.0.0.1"]);
            } else {
                command.arg("30");
            }
            Ok(command
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()?)
        }

        fn find_by_name(&self, _name: &str) -> Vec<u32> {
            Vec::new()
        }

        fn kill_by_name(&self, _name: &str) -> usize {
            0
        }
    }

    fn started_listeners(supervisor: &ServerSupervisor) -> Arc<Listeners> {
        supervisor.start();
        let tracked = resilient_lock(&supervisor.tracked);
        let listeners = tracked.as_ref().unwrap().listeners.clone();
        listeners
    }

    #[tokio::test]
    async fn test_close_silences_output_but_stop_does_not() {
        let supervisor = ServerSupervisor::new(
            ServerLaunch::new("/nowhere/server", "/nowhere"),
            Arc::new(SleepSpawn),
            Arc::new(CountingAlert::default()),
        );

        let listeners = started_listeners(&supervisor);
        supervisor.stop();
        assert!(!listeners.exit.load(Ordering::SeqCst));
        assert!(listeners.output.load(Ordering::SeqCst));

        let listeners = started_listeners(&supervisor);
        supervisor.close();
        assert!(!listeners.exit.load(Ordering::SeqCst));
        assert!(!listeners.output.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_outside_runtime_is_harmless() {
        let processes = Arc::new(FailingSpawn::default());
        let supervisor = ServerSupervisor::new(
            ServerLaunch::new("/nowhere/server", "/nowhere"),
            processes.clone(),
            Arc::new(CountingAlert::default()),
        );

        supervisor.start();
        assert_eq!(processes.spawns.load(Ordering::SeqCst), 0);
    }
}
