//! Logging initialization for the bootstrap.
//!
//! Events go to a size-capped JSON boot log, so a failed sandbox start can be
//! diagnosed afterwards, and in compact form to stderr.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Maximum boot log size (1 MiB).
pub const MAX_LOG_BYTES: usize = 1024 * 1024;

/// File writer that silently drops everything past `max_bytes`.
struct CappedLog {
    file: File,
    written: usize,
    max_bytes: usize,
}

impl CappedLog {
    fn create(path: &Path, max_bytes: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            written: 0,
            max_bytes,
        })
    }
}

impl Write for CappedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.max_bytes.saturating_sub(self.written);
        if remaining > 0 {
            let n = self.file.write(&buf[..buf.len().min(remaining)])?;
            self.written += n;
        }
        // Report everything as written so the subscriber never retries
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

struct SharedLog(Mutex<CappedLog>);

impl Write for &SharedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedLog {
    type Writer = &'static SharedLog;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to the boot log at `path` and to stderr.
///
/// Fails if the boot log cannot be created; the caller can then fall back
/// to [`init_stderr`].
pub fn init(path: &Path) -> io::Result<()> {
    let log = CappedLog::create(path, MAX_LOG_BYTES)?;

    // Lives for the whole process
    let shared: &'static SharedLog = Box::leak(Box::new(SharedLog(Mutex::new(log))));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(shared)
        .with_filter(env_filter());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

/// Log to stderr only.
pub fn init_stderr() {
    tracing_subscriber::fmt()
        .compact()
        .with_writer(io::stderr)
        .with_env_filter(env_filter())
        .init();
}
