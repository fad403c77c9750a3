// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OS process collaborator: spawn, list by name, force-kill by name.
//!
//! Listing and killing shell out to `pgrep`/`kill` on Unix and
//! `tasklist`/`taskkill` on Windows. These are short blocking calls.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Everything needed to launch the managed server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLaunch {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
}

impl ServerLaunch {
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
            args: Vec::new(),
        }
    }

    /// OS-level process name used for list/kill by name.
    pub fn process_name(&self) -> String {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Process operations the supervisor depends on.
pub trait ProcessControl: Send + Sync {
    /// Spawn the server with inherited environment and piped stdout/stderr.
    fn spawn(&self, launch: &ServerLaunch) -> Result<tokio::process::Child>;

    /// PIDs of running processes named `name`, excluding this process.
    fn find_by_name(&self, name: &str) -> Vec<u32>;

    /// Force-kill every process named `name`. Returns how many were killed.
    fn kill_by_name(&self, name: &str) -> usize {
        let mut killed = 0;
        for pid in self.find_by_name(name) {
            match kill_process(pid) {
                Ok(()) => {
                    debug!(pid, name, "killed process");
                    killed += 1;
                }
                Err(e) => warn!(pid, name, "failed to kill process: {}", e),
            }
        }
        killed
    }
}

/// The real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn spawn(&self, launch: &ServerLaunch) -> Result<tokio::process::Child> {
        let mut command = tokio::process::Command::new(&launch.executable);
        command
            .args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if launch.working_dir.is_dir() {
            command.current_dir(&launch.working_dir);
        }

        command.spawn().map_err(|e| {
            BridgeError::Process(format!(
                "failed to spawn {}: {}",
                launch.executable.display(),
                e
            ))
            .into()
        })
    }

    fn find_by_name(&self, name: &str) -> Vec<u32> {
        if name.is_empty() {
            return Vec::new();
        }
        let current_pid = std::process::id();
        list_processes(name)
            .into_iter()
            .filter(|&pid| pid != current_pid)
            .collect()
    }
}

#[cfg(target_os = "windows")]
fn list_processes(name: &str) -> Vec<u32> {
    let mut pids = Vec::new();

    if let Ok(output) = std::process::Command::new("tasklist")
        .args(["/FO", "CSV", "/NH", "/FI", &format!("IMAGENAME eq {}", name)])
        .output()
    {
        let output_str = String::from_utf8_lossy(&output.stdout);
        for line in output_str.lines() {
            // CSV format: "name","PID","Session","Mem Usage"
            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() >= 2 && parts[0].trim_matches('"').eq_ignore_ascii_case(name) {
                if let Ok(pid) = parts[1].trim_matches('"').trim().parse::<u32>() {
                    pids.push(pid);
                }
            }
        }
    }

    pids
}

#[cfg(not(target_os = "windows"))]
fn list_processes(name: &str) -> Vec<u32> {
    // pgrep matches against the 15-char kernel comm name
    let pattern: String = name.chars().take(15).collect();
    let mut pids = Vec::new();

    if let Ok(output) = std::process::Command::new("pgrep")
        .args(["-x", &pattern])
        .output()
    {
        let output_str = String::from_utf8_lossy(&output.stdout);
        for line in output_str.lines() {
            if let Ok(pid) = line.trim().parse::<u32>() {
                pids.push(pid);
            }
        }
    }

    pids
}

#[cfg(target_os = "windows")]
fn kill_process(pid: u32) -> Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        anyhow::bail!("taskkill exited with {}", status)
    }
}

#[cfg(not(target_os = "windows"))]
fn kill_process(pid: u32) -> Result<()> {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        anyhow::bail!("kill exited with {}", status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_name_from_path() {
        let launch = ServerLaunch::new("/opt/app/resources/server", "/opt/app/resources");
        assert_eq!(launch.process_name(), "server");
        assert!(launch.args.is_empty());
    }

    #[test]
    fn test_unknown_name_finds_nothing() {
        let processes = SystemProcesses;
        assert!(processes.find_by_name("deskbridge-no-such-proc").is_empty());
        assert_eq!(processes.kill_by_name("deskbridge-no-such-proc"), 0);
        assert!(processes.find_by_name("").is_empty());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let launch = ServerLaunch::new(dir.path().join("missing"), dir.path());
        assert!(SystemProcesses.spawn(&launch).is_err());
    }
}
