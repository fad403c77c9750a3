// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Log sink setup.
//!
//! Writes `main.log` in the configured log directory with lines shaped like
//! `[2025-01-31 12:00:00.123] [info] message`. The file is capped at
//! `max_file_size`; on overflow it is moved to `main.old.log` and a fresh
//! file is started. Console output is added in development mode.

use std::fmt as stdfmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::Config;
use crate::locks::resilient_lock;

/// Current log file name.
pub const LOG_FILE: &str = "main.log";

/// Name the current file is moved to when it reaches the size cap.
pub const OLD_LOG_FILE: &str = "main.old.log";

struct RotatingFileInner {
    dir: PathBuf,
    file: Option<File>,
    size: u64,
    max_size: u64,
}

impl RotatingFileInner {
    fn open(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut inner = Self {
            dir,
            file: None,
            size: 0,
            max_size,
        };
        inner.reopen()?;
        Ok(inner)
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let path = self.current_path();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let old = self.dir.join(OLD_LOG_FILE);
        if old.exists() {
            fs::remove_file(&old)?;
        }
        fs::rename(self.current_path(), old)?;
        self.reopen()
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        match &mut self.file {
            Some(file) => {
                let written = file.write(buf)?;
                self.size += written as u64;
                Ok(written)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "log file is not open")),
        }
    }

    fn flush_file(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `main.log` writer with a single-backup size cap.
#[derive(Clone)]
pub struct RotatingFile {
    inner: Arc<Mutex<RotatingFileInner>>,
}

impl RotatingFile {
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFileInner::open(dir.into(), max_size)?)),
        })
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        resilient_lock(&self.inner).write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        resilient_lock(&self.inner).flush_file()
    }
}

/// `[timestamp] [level] message` line format.
pub struct ShellFormat;

impl<S, N> FormatEvent<S, N> for ShellFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let level = event.metadata().level().to_string().to_lowercase();
        write!(
            writer,
            "[{}] [{}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Keeps the non-blocking file writer alive. Drop it last.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &Config) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let console = config.console_logging();
    let log_dir = config.log_dir();

    let console_layer = console.then(|| fmt::layer().event_format(ShellFormat).with_ansi(true));

    let (file_layer, file_guard) = match RotatingFile::new(&log_dir, config.log.max_file_size) {
        Ok(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = fmt::layer()
                .event_format(ShellFormat)
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Failed to open log file in {}: {}. Falling back to console.",
                log_dir.display(),
                e
            );
            (None, None)
        }
    };

    // Without a file the console is the only sink left.
    let console_layer = match (&file_layer, console_layer) {
        (None, None) => Some(fmt::layer().event_format(ShellFormat).with_ansi(true)),
        (_, layer) => layer,
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Logging already initialized: {}", e);
    }

    tracing::info!(
        "log initialized: dir={}, level={}, max_size={:.1}MB",
        log_dir.display(),
        config.log.level,
        config.log.max_file_size as f64 / 1024.0 / 1024.0
    );

    LogGuard {
        _file_guard: file_guard,
    }
}

/// Path of the current log file for `dir`.
pub fn log_file_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotating_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RotatingFile::new(dir.path(), 1024).unwrap();
        writer.write_all(b"first\n").unwrap();
        writer.write_all(b"second\n").unwrap();
        writer.flush().unwrap();

        let content = fs::read_to_string(log_file_path(dir.path())).unwrap();
        assert_eq!(content, "first\nsecond\n");
        assert!(!dir.path().join(OLD_LOG_FILE).exists());
    }

    #[test]
    fn test_rotating_file_moves_full_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RotatingFile::new(dir.path(), 10).unwrap();
        writer.write_all(b"12345678\n").unwrap();
        writer.write_all(b"abcdef\n").unwrap();
        writer.flush().unwrap();

        let old = fs::read_to_string(dir.path().join(OLD_LOG_FILE)).unwrap();
        let current = fs::read_to_string(log_file_path(dir.path())).unwrap();
        assert_eq!(old, "12345678\n");
        assert_eq!(current, "abcdef\n");
    }

    #[test]
    fn test_rotating_file_keeps_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RotatingFile::new(dir.path(), 4).unwrap();
        writer.write_all(b"aaa\n").unwrap();
        writer.write_all(b"bbb\n").unwrap();
        writer.write_all(b"ccc\n").unwrap();
        writer.flush().unwrap();

        let old = fs::read_to_string(dir.path().join(OLD_LOG_FILE)).unwrap();
        assert_eq!(old, "bbb\n");
    }

    #[test]
    fn test_rotating_file_resumes_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(log_file_path(dir.path()), b"0123456789").unwrap();

        let mut writer = RotatingFile::new(dir.path(), 12).unwrap();
        writer.write_all(b"xyz").unwrap();
        writer.flush().unwrap();

        assert!(dir.path().join(OLD_LOG_FILE).exists());
    }
}
