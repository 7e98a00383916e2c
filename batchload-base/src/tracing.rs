// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Tracing setup for native hosts of the batch processors.
//!
//! Output is controlled through the environment:
//! * `RUST_LOG` sets the filter (`info` by default),
//! * `RUST_LOG_SPAN_EVENTS` lists span events to log, e.g. `new,close`,
//! * `RUST_LOG_FORMAT` picks `plain`, `json` or `pretty`,
//! * `BATCHLOAD_LOG_DIR` additionally writes `<log_name>.log` into that directory.

use std::{
    env, fmt,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use is_terminal::IsTerminal as _;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{
        format::{FmtSpan, Format, Full},
        time::FormatTime,
        FormatFields, MakeWriter,
    },
    layer::{Layer, SubscriberExt as _},
    registry::LookupSpan,
    util::{SubscriberInitExt as _, TryInitError},
    EnvFilter,
};

pub const LOG_DIR_VAR: &str = "BATCHLOAD_LOG_DIR";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid RUST_LOG_FORMAT `{0}`, expected `plain`, `json` or `pretty`")]
    InvalidFormat(String),
    #[error("failed to open log file {path}: {error}")]
    LogFile { path: PathBuf, error: io::Error },
    #[error(transparent)]
    Init(#[from] TryInitError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = TracingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(TracingError::InvalidFormat(other.to_owned())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Plain => "plain",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        })
    }
}

/// How a host process logs, as read from its environment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub span_events: FmtSpan,
    pub log_dir: Option<PathBuf>,
    pub color: bool,
}

impl LogConfig {
    pub fn from_env() -> Result<Self, TracingError> {
        let mut config = Self::from_vars(|name| env::var(name).ok())?;
        config.color &= io::stderr().is_terminal();
        Ok(config)
    }

    /// Reads the configuration through `var`, which looks up one variable by name.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, TracingError> {
        let format = var("RUST_LOG_FORMAT")
            .filter(|format| !format.is_empty())
            .map(|format| format.parse::<LogFormat>())
            .transpose()?
            .unwrap_or_default();
        let span_events = var("RUST_LOG_SPAN_EVENTS")
            .map_or(FmtSpan::NONE, |events| fmt_span_from_str(&events));
        Ok(Self {
            format,
            span_events,
            log_dir: var(LOG_DIR_VAR)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            color: var("NO_COLOR").map_or(true, |value| value.is_empty()),
        })
    }

    /// The file `log_name` is written to, if a log directory is configured.
    pub fn log_file_path(&self, log_name: &str) -> Option<PathBuf> {
        let mut path = self.log_dir.as_deref()?.join(log_name);
        path.set_extension("log");
        Some(path)
    }

    fn layer<S, W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        formatted(
            self.format,
            tracing_subscriber::fmt::layer()
                .with_span_events(self.span_events.clone())
                .with_writer(writer)
                .with_ansi(ansi),
        )
    }
}

/// Installs the global subscriber for the process named `log_name`.
pub fn init(log_name: &str) -> Result<(), TracingError> {
    init_with(&LogConfig::from_env()?, log_name)
}

pub fn init_with(config: &LogConfig, log_name: &str) -> Result<(), TracingError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let file_layer = config
        .log_file_path(log_name)
        .map(|path| open_log_file(&path))
        .transpose()?
        .map(|file| config.layer(Arc::new(file), false));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(config.layer(io::stderr, config.color))
        .try_init()?;
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, TracingError> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|error| TracingError::LogFile {
            path: path.to_owned(),
            error,
        })
}

fn formatted<S, N, W, T>(
    format: LogFormat,
    layer: tracing_subscriber::fmt::Layer<S, N, Format<Full, T>, W>,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + Send + Sync + 'static,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    T: FormatTime + Send + Sync + 'static,
{
    match format {
        LogFormat::Plain => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    }
}

fn fmt_span_from_str(events: &str) -> FmtSpan {
    events
        .split(',')
        .map(|event| match event.trim() {
            "new" => FmtSpan::NEW,
            "enter" => FmtSpan::ENTER,
            "exit" => FmtSpan::EXIT,
            "close" => FmtSpan::CLOSE,
            "active" => FmtSpan::ACTIVE,
            "full" => FmtSpan::FULL,
            _ => FmtSpan::NONE,
        })
        .fold(FmtSpan::NONE, |all, event| all | event)
}
