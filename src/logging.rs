//! Tracing setup
//!
//! Installs one `tracing-subscriber` registry with:
//! - an [`EnvFilter`] taken from `RUST_LOG`, or from the configured level
//! - a console layer
//! - an optional file layer whose file can be reopened after rotation
//! - a line tap that copies every formatted line to in-process subscribers
//!   (the diagnostic log server)
//!
//! # Example
//! ```no_run
//! use unet_exchange::{config::LoggingConfig, logging};
//!
//! let handle = logging::init(&LoggingConfig::default())?;
//! tracing::info!("exchange starting");
//! handle.rotate()?;
//! # Ok::<(), unet_exchange::UNetError>(())
//! ```
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::errors::{Result, UNetError};

/// Lines buffered per tap subscriber before the slowest one starts losing lines
const TAP_CAPACITY: usize = 1024;

/// Append-mode log file that can be reopened at the same path
struct LogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogFile {
    fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(open_append(path)?),
        })
    }

    fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        let mut file = self.file.lock();
        let _ = file.flush();
        *file = fresh;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[derive(Clone)]
struct FileMakeWriter(Arc<LogFile>);

struct FileWriter<'a>(&'a LogFile);

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.file.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriter(&self.0)
    }
}

#[derive(Clone)]
struct TapMakeWriter(broadcast::Sender<String>);

struct TapWriter<'a>(&'a broadcast::Sender<String>);

impl Write for TapWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0.receiver_count() > 0 {
            let _ = self.0.send(String::from_utf8_lossy(buf).into_owned());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for TapMakeWriter {
    type Writer = TapWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        TapWriter(&self.0)
    }
}

/// Handle kept by the host after [`init`]
#[derive(Clone)]
pub struct LogHandle {
    file: Option<Arc<LogFile>>,
    tap: broadcast::Sender<String>,
}

impl LogHandle {
    /// Reopen the log file (after an external rotation moved it away)
    pub fn rotate(&self) -> Result<()> {
        match &self.file {
            Some(file) => file
                .reopen()
                .map_err(|e| UNetError::Logging(format!("reopen {}: {e}", file.path.display()))),
            None => Ok(()),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Receive every formatted log line from now on
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tap.subscribe()
    }

    /// Push a line to tap subscribers without going through tracing
    pub fn publish(&self, line: impl Into<String>) {
        let _ = self.tap.send(line.into());
    }

    /// Handle that logs nowhere, for hosts that set up tracing themselves
    pub fn detached() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self { file: None, tap }
    }
}

/// Initialize tracing from the logging section
///
/// Idempotent: when a global subscriber already exists the returned handle
/// still rotates the file, but the existing subscriber keeps receiving events.
pub fn init(config: &LoggingConfig) -> Result<LogHandle> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| UNetError::Logging(format!("bad log level '{}': {e}", config.level)))?,
    };

    let file = config
        .file
        .as_deref()
        .map(LogFile::open)
        .transpose()
        .map_err(|e| UNetError::Logging(format!("open log file: {e}")))?
        .map(Arc::new);
    let (tap, _) = broadcast::channel(TAP_CAPACITY);

    let console = fmt::layer().with_target(true);
    let file_layer = file.clone().map(|f| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(FileMakeWriter(f))
    });
    let tap_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(TapMakeWriter(tap.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .with(tap_layer)
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("already been set") {
                Ok(())
            } else {
                Err(UNetError::Logging(format!("failed to initialize tracing: {e}")))
            }
        })?;

    Ok(LogHandle { file, tap })
}
