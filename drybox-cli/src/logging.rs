//! Structured, operator-facing logging for a simulation run's lifecycle.
//! Distinct from `drybox_core::logging::SignalLogger`, which collects
//! engine-internal diagnostics: this logger reports run start/stop,
//! per-scenario handshake provenance, and capability mismatches to the
//! operator in whichever format they asked for.

use crate::config::{LogFormat, LogLevel, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// A scenario clone (sweep member or the sole run) is about to start.
    RunStarted { scenario_path: String, out_dir: String },

    /// A run completed and produced an exit code.
    RunFinished { out_dir: String, exit_code: i32 },

    /// Per-side key derivation/provenance, recorded once per run.
    Handshake { side: String, key_id: String, provenance: String },

    Info { message: String },
    Warn { message: String },
    Error { message: String, details: Option<String> },
}

impl LogEvent {
    /// Implicit severity of this event, used to filter against the
    /// configured minimum level. Lifecycle/handshake events are always
    /// informational.
    fn level(&self) -> LogLevel {
        match self {
            LogEvent::Warn { .. } => LogLevel::Warn,
            LogEvent::Error { .. } => LogLevel::Error,
            LogEvent::RunStarted { .. }
            | LogEvent::RunFinished { .. }
            | LogEvent::Handshake { .. }
            | LogEvent::Info { .. } => LogLevel::Info,
        }
    }
}

pub struct StructuredLogger {
    config: LoggingConfig,
    writer: Box<dyn Write + Send>,
    start_time: DateTime<Utc>,
}

impl StructuredLogger {
    pub fn new(config: LoggingConfig) -> Result<Self> {
        let writer: Box<dyn Write + Send> = match &config.target {
            LogTarget::Stdout => Box::new(io::stdout()),
            LogTarget::Stderr => Box::new(io::stderr()),
            LogTarget::File => {
                let path = config
                    .file_path
                    .as_ref()
                    .ok_or_else(|| color_eyre::eyre::eyre!("file path required for file logging"))?;
                Box::new(BufWriter::new(File::create(path)?))
            }
        };

        Ok(Self {
            config,
            writer,
            start_time: Utc::now(),
        })
    }

    pub fn log(&mut self, event: LogEvent) -> Result<()> {
        if event.level() < self.config.level {
            return Ok(());
        }

        let output = match self.config.format {
            LogFormat::Json => self.format_json(&event)?,
            LogFormat::Logfmt => self.format_logfmt(&event),
            LogFormat::Pretty => self.format_pretty(&event),
        };

        writeln!(self.writer, "{output}")?;
        self.writer.flush()?;
        Ok(())
    }

    fn format_json(&self, event: &LogEvent) -> Result<String> {
        Ok(serde_json::to_string(event)?)
    }

    fn format_logfmt(&self, event: &LogEvent) -> String {
        let ts = Utc::now().to_rfc3339();
        match event {
            LogEvent::RunStarted { scenario_path, out_dir } => format!(
                "ts=\"{ts}\" type=run_started scenario=\"{scenario_path}\" out=\"{out_dir}\""
            ),
            LogEvent::RunFinished { out_dir, exit_code } => {
                format!("ts=\"{ts}\" type=run_finished out=\"{out_dir}\" exit_code={exit_code}")
            }
            LogEvent::Handshake { side, key_id, provenance } => format!(
                "ts=\"{ts}\" type=handshake side={side} key_id={key_id} provenance={provenance}"
            ),
            LogEvent::Info { message } => format!("ts=\"{ts}\" level=info msg=\"{message}\""),
            LogEvent::Warn { message } => format!("ts=\"{ts}\" level=warn msg=\"{message}\""),
            LogEvent::Error { message, details } => match details {
                Some(d) => format!("ts=\"{ts}\" level=error msg=\"{message}\" details=\"{d}\""),
                None => format!("ts=\"{ts}\" level=error msg=\"{message}\""),
            },
        }
    }

    fn format_pretty(&self, event: &LogEvent) -> String {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        match event {
            LogEvent::RunStarted { scenario_path, out_dir } => {
                format!("[{ts}] RUN START: {scenario_path} -> {out_dir}")
            }
            LogEvent::RunFinished { out_dir, exit_code } => {
                format!("[{ts}] RUN DONE ({out_dir}): exit {exit_code}")
            }
            LogEvent::Handshake { side, key_id, provenance } => {
                format!("[{ts}] HANDSHAKE {side}: key={key_id} ({provenance})")
            }
            LogEvent::Info { message } => format!("[{ts}] INFO: {message}"),
            LogEvent::Warn { message } => format!("[{ts}] WARN: {message}"),
            LogEvent::Error { message, details } => match details {
                Some(d) => format!("[{ts}] ERROR: {message} | {d}"),
                None => format!("[{ts}] ERROR: {message}"),
            },
        }
    }

    pub fn elapsed(&self) -> f64 {
        (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}
