//! Console logging plus a debug-level `pipeline.log` inside the active run
//! directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const RUN_LOG_FILE: &str = "pipeline.log";
const RUN_LOG_FILTER: &str = "info,product_insights=debug";

/// Installs the console layer (RUST_LOG, else `info` or `debug`) and a file
/// layer that stays silent until a run directory is attached.
pub fn init(verbose: bool) -> RunLog {
    let default = if verbose { "debug" } else { "info" };
    let console = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let run_log = RunLog::default();
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console))
        .with(run_log.layer())
        .try_init();
    run_log
}

/// Shared handle to the current run's log file.
#[derive(Clone, Default)]
pub struct RunLog {
    file: Arc<Mutex<Option<File>>>,
}

impl RunLog {
    pub fn layer<S>(&self) -> impl Layer<S> + use<S>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fmt::layer()
            .with_ansi(false)
            .with_writer(self.clone())
            .with_filter(EnvFilter::new(RUN_LOG_FILTER))
    }

    /// Starts appending to `<run_dir>/pipeline.log`.
    pub fn attach(&self, run_dir: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(RUN_LOG_FILE))?;
        *self.lock() = Some(file);
        Ok(())
    }

    pub fn detach(&self) {
        if let Some(mut file) = self.lock().take() {
            let _ = file.flush();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = RunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter(self.clone())
    }
}

pub struct RunLogWriter(RunLog);

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.0.lock().as_mut() {
            Some(file) => file.write_all(buf),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
