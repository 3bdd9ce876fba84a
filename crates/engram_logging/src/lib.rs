//! Shared logging utilities for Engram binaries.
//!
//! Every binary logs to a size-capped file under the Engram home plus a
//! filtered stderr layer. When the active file fills up it is archived
//! under a timestamped name and the oldest archives are pruned, so a
//! long-lived backend and a once-per-event hook process share the same
//! policy. File logs keep full detail so a misbehaving hook or worker can
//! be diagnosed after the fact.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "engram_backend=info,engram_worker=info,engram_hook=info,engram_db=info";
/// Archives kept per binary, beyond the active file.
const MAX_ARCHIVES: usize = 4;
const DEFAULT_MAX_LOG_MB: u64 = 10;

/// Logging configuration shared by Engram binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Hook mode keeps stderr quiet; the editor captures hook stderr and
    /// surfaces it to the user.
    pub quiet_stderr: bool,
}

/// Initialize tracing with a size-capped file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = FileWriter::open(log_dir, config.app_name, log_size_cap())
        .context("Failed to open log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.quiet_stderr {
        EnvFilter::new("error")
    } else if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Per-file size cap, overridable via `ENGRAM_LOG_MAX_MB`.
fn log_size_cap() -> u64 {
    let megabytes = std::env::var("ENGRAM_LOG_MAX_MB")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|mb| *mb > 0)
        .unwrap_or(DEFAULT_MAX_LOG_MB);
    megabytes * 1024 * 1024
}

/// Get the Engram home directory: ~/.engram
pub fn engram_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("ENGRAM_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|h| h.join(".engram"))
        .unwrap_or_else(|| PathBuf::from(".").join(".engram"))
}

/// Logs directory: ~/.engram/logs
pub fn logs_dir() -> PathBuf {
    engram_home().join("logs")
}

/// Default SQLite database path: ~/.engram/engram.db
pub fn default_db_path() -> PathBuf {
    engram_home().join("engram.db")
}

/// Per-process offline hook queue file: ~/.engram/queue/offline-<pid>.jsonl
pub fn offline_queue_path() -> PathBuf {
    engram_home()
        .join("queue")
        .join(format!("offline-{}.jsonl", std::process::id()))
}

/// Host-wide in-process worker lock: ~/.engram/worker.lock
pub fn worker_lock_path() -> PathBuf {
    engram_home().join("worker.lock")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// The active log file plus its archive policy. The active file is always
/// `<app>.log`; a full file is archived as `<app>-<epoch_ms>.log` and the
/// oldest archives beyond the keep count are deleted.
struct LogSink {
    dir: PathBuf,
    app: String,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl LogSink {
    fn open(dir: PathBuf, app: &str, max_bytes: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{app}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        let mut sink = Self {
            dir,
            app: app.to_string(),
            max_bytes,
            file,
            written,
        };
        if sink.written >= sink.max_bytes {
            sink.roll()?;
        }
        Ok(sink)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.app))
    }

    /// Archive the active file under a timestamped name and start fresh.
    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let archive = self.dir.join(format!("{}-{stamp}.log", self.app));
        fs::rename(self.active_path(), &archive)?;
        self.prune_archives()?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = 0;
        Ok(())
    }

    /// Delete the oldest archives beyond the keep count. Archive names
    /// embed a millisecond timestamp, so lexicographic order within an
    /// app prefix is chronological enough for pruning.
    fn prune_archives(&self) -> io::Result<()> {
        let prefix = format!("{}-", self.app);
        let mut archives: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();

        if archives.len() <= MAX_ARCHIVES {
            return Ok(());
        }
        archives.sort();
        for stale in &archives[..archives.len() - MAX_ARCHIVES] {
            if let Err(e) = fs::remove_file(stale) {
                eprintln!("engram: failed to prune log archive {}: {}", stale.display(), e);
            }
        }
        Ok(())
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Writer handed to tracing. One type serves as both the factory and the
/// writer: `make_writer` clones the handle and every write locks the
/// shared sink, so all layers of one process append through a single
/// size-accounted file handle.
#[derive(Clone)]
struct FileWriter {
    sink: Arc<Mutex<LogSink>>,
}

impl FileWriter {
    fn open(dir: PathBuf, app: &str, max_bytes: u64) -> io::Result<Self> {
        Ok(Self {
            sink: Arc::new(Mutex::new(LogSink::open(dir, app, max_bytes)?)),
        })
    }

    fn with_sink<T>(&self, op: impl FnOnce(&mut LogSink) -> io::Result<T>) -> io::Result<T> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
        op(&mut sink)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FileWriter {
    type Writer = FileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_sink(|sink| sink.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_sink(|sink| sink.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_roll_archives_under_timestamped_name() {
        let dir = TempDir::new().unwrap();
        let mut sink = LogSink::open(dir.path().to_path_buf(), "backend", 64).unwrap();

        sink.write_all(&[b'x'; 48]).unwrap();
        // Second write crosses the cap: the first 48 bytes get archived.
        sink.write_all(&[b'y'; 48]).unwrap();
        sink.flush().unwrap();

        let names = log_files(&dir);
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n == "backend.log"));
        assert!(names
            .iter()
            .any(|n| n.starts_with("backend-") && n.ends_with(".log")));

        let active = fs::read(dir.path().join("backend.log")).unwrap();
        assert_eq!(active, vec![b'y'; 48]);
    }

    #[test]
    fn test_prune_keeps_bounded_archive_count() {
        let dir = TempDir::new().unwrap();
        let mut sink = LogSink::open(dir.path().to_path_buf(), "worker", 16).unwrap();

        for _ in 0..20 {
            sink.write_all(&[b'x'; 12]).unwrap();
        }
        sink.flush().unwrap();

        // Active file plus at most MAX_ARCHIVES archives.
        let names = log_files(&dir);
        assert!(
            names.len() <= MAX_ARCHIVES + 1,
            "expected at most {} log files, found {:?}",
            MAX_ARCHIVES + 1,
            names
        );
    }

    #[test]
    fn test_prune_ignores_other_apps() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hook-1.log"), b"other app").unwrap();

        let mut sink = LogSink::open(dir.path().to_path_buf(), "worker", 8).unwrap();
        for _ in 0..12 {
            sink.write_all(&[b'x'; 6]).unwrap();
        }

        assert!(dir.path().join("hook-1.log").exists());
    }

    #[test]
    fn test_oversized_existing_file_is_rolled_on_open() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hook.log"), vec![b'x'; 128]).unwrap();

        let sink = LogSink::open(dir.path().to_path_buf(), "hook", 64).unwrap();
        assert_eq!(sink.written, 0);
        assert_eq!(log_files(&dir).len(), 2);
    }
}
