//! Log output for the agent.
//!
//! Everything in the crate emits `tracing` events; this module only decides
//! where they go. A [`LogConfig`] comes from the `[logging]` table of
//! `conquer.toml` and is installed once with [`init_logging`]:
//!
//! ```ignore
//! use conquer_core::logging::{LogConfig, init_logging};
//!
//! init_logging(&LogConfig::default().with_debug(true))?;
//! ```
//!
//! `RUST_LOG`, when set, replaces the configured level entirely.
//!
//! Field names used across the crate: `connection_id`, `attempt`, `url`,
//! `num`, `message_type`, `schedule_id`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INSTALLED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// How events are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines on stderr.
    #[default]
    Pretty,
    /// One JSON object per event, for CI log collectors.
    Json,
}

impl LogFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Pretty, Self::Json]
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown log format '{s}', expected pretty or json"))
    }
}

/// The `[logging]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `warn,conquer_core::client=debug`.
    pub level: String,
    pub format: LogFormat,
    /// Also append events to this file, without colors.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Raise this crate's events to `debug` when `debug` is set.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        if debug {
            self.level = format!("{},conquer_core=debug,conquer=debug", self.level);
        }
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging is already set up")]
    AlreadyInitialized,

    #[error("cannot open log file: {0}")]
    File(#[from] io::Error),

    #[error("cannot install subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn append_to(path: &Path) -> io::Result<File> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
        _ => {}
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(writer)
            .with_target(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber. Only the first call succeeds.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let mut layers = vec![layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        layers.push(layer(config.format, Mutex::new(append_to(path)?), false));
    }
    let subscriber = tracing_subscriber::registry()
        .with(layers)
        .with(config.filter());
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(());

    tracing::debug!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging ready"
    );
    Ok(())
}
