//! Process logging: `tracing` events go to stdout and, when a log directory
//! is configured, to a file named after the listen address so that several
//! gateways can share one directory.

use crate::config::GatewayConfig;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_PREFIX: &str = "esl-gateway";

/// `0.0.0.0:7001` becomes `esl-gateway-0.0.0.0_7001.log`.
pub fn log_file_name(listen_addr: &str) -> String {
    let suffix = listen_addr
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let suffix = suffix.trim_matches('_');
    if suffix.is_empty() {
        format!("{LOG_PREFIX}.log")
    } else {
        format!("{LOG_PREFIX}-{suffix}.log")
    }
}

/// `RUST_LOG` wins; otherwise debug mode, then `ESL_LOG_LEVEL`, then info.
fn default_directive(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    match std::env::var("ESL_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    }
}

/// Installs the global subscriber. Returns `None` when one is already set.
pub fn init_logging(config: &GatewayConfig) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.debug)));
    let mirror = match config.log_dir.as_deref().map(str::trim) {
        Some(dir) if !dir.is_empty() => {
            match LogMirror::open(Path::new(dir), &config.listen_addr) {
                Ok(mirror) => Some(mirror),
                Err(err) => {
                    eprintln!("esl_log_file_error: dir={dir} error={err}");
                    None
                }
            }
        }
        _ => None,
    };

    let writer_mirror = mirror.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        mirror: writer_mirror.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    if let Some(mirror) = &mirror {
        info!(event = "esl_log_file", path = %mirror.path.display());
    }
    Some(LogGuard { mirror })
}

#[derive(Clone)]
struct LogMirror {
    path: Arc<PathBuf>,
    file: Arc<Mutex<File>>,
}

impl LogMirror {
    fn open(dir: &Path, listen_addr: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(log_file_name(listen_addr));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Flushes the log file to disk when the process lets go of it.
pub struct LogGuard {
    mirror: Option<LogMirror>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.mirror.as_ref().map(|mirror| mirror.path.as_path())
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(mirror) = &self.mirror {
            let mut file = mirror.lock();
            let _ = file.flush();
            let _ = file.sync_all();
        }
    }
}

/// A failing mirror never stops stdout logging.
struct TeeWriter {
    stdout: io::Stdout,
    mirror: Option<LogMirror>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(mirror) = &self.mirror {
            let _ = mirror.lock().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(mirror) = &self.mirror {
            let _ = mirror.lock().flush();
        }
        Ok(())
    }
}
