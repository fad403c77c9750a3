// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types and user-facing error formatting for deskbridge.
//!
//! Only two kinds of failure ever cross back to a caller: a destination
//! directory that could not be created, and the answer to an explicit query.
//! Everything else (stale handles, host command failures, process crashes)
//! is logged and absorbed where it happens.

use std::fmt;
use std::path::PathBuf;

/// Errors surfaced by the bridge.
#[derive(Debug)]
pub enum BridgeError {
    /// Invalid or unreadable configuration.
    Config(String),
    /// A filesystem operation required by a download failed.
    Filesystem {
        /// Path that was being created or written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The host download primitive refused an operation.
    Host(String),
    /// Spawning or killing the managed server failed.
    Process(String),
    /// The managed server answered badly or not at all.
    Backend(String),
    /// The download service task is no longer running.
    ServiceClosed,
}

impl BridgeError {
    /// Wrap an I/O error that happened while preparing `path`.
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Filesystem { path, source } => {
                write!(f, "Filesystem error at {}: {}", path.display(), source)
            }
            Self::Host(msg) => write!(f, "Host download error: {}", msg),
            Self::Process(msg) => write!(f, "Server process error: {}", msg),
            Self::Backend(msg) => write!(f, "Backend error: {}", msg),
            Self::ServiceClosed => write!(f, "Download service is not running"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Filesystem { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Formats an error message with title, causes and suggested fixes.
///
/// Used for the blocking notifications shown to the user, e.g. when the
/// server executable is missing.
///
/// ```
/// use deskbridge::error::format_error;
///
/// let msg = format_error(
///     "Server executable not found",
///     &["The application was not fully installed"],
///     &["Reinstall the application"],
/// );
/// assert!(msg.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = String::new();

    output.push_str(&format!("[✗] {}\n", title));

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_format_error_full() {
        let error = format_error("Title", &["Cause 1", "Cause 2"], &["Fix 1"]);
        assert!(error.contains("[✗] Title"));
        assert!(error.contains("  - Cause 1"));
        assert!(error.contains("  - Cause 2"));
        assert!(error.contains("  1. Fix 1"));
    }

    #[test]
    fn test_format_error_title_only() {
        let error = format_error("Just a title", &[], &[]);
        assert_eq!(error, "[✗] Just a title\n");
    }

    #[test]
    fn test_filesystem_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = BridgeError::filesystem("/tmp/x", io);
        assert!(err.to_string().contains("/tmp/x"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_display() {
        assert!(BridgeError::ServiceClosed.to_string().contains("not running"));
        assert!(BridgeError::Config("bad port".into()).to_string().contains("bad port"));
    }
}
