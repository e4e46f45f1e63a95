use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::json;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::panic::Location;
use std::sync::{Arc, Mutex};

/// Handle through which components emit log records.
///
/// Each component receives its own handle at construction; there is no
/// process-wide logger. Cloning is cheap.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn Log>,
    target: &'static str,
}

impl Logger {
    pub fn new(sink: Arc<dyn Log>) -> Self {
        Self {
            sink,
            target: "anyproxy",
        }
    }

    pub fn discard() -> Self {
        Self::new(Arc::new(DiscardSink))
    }

    /// Same sink, different record target.
    pub fn named(&self, target: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            target,
        }
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    #[track_caller]
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Error, args, Location::caller());
    }

    #[track_caller]
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Warn, args, Location::caller());
    }

    #[track_caller]
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Info, args, Location::caller());
    }

    #[track_caller]
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args, Location::caller());
    }

    pub fn flush(&self) {
        self.sink.flush();
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>, location: &'static Location<'static>) {
        let record = Record::builder()
            .level(level)
            .target(self.target)
            .file(Some(location.file()))
            .line(Some(location.line()))
            .args(args)
            .build();
        if self.sink.enabled(record.metadata()) {
            self.sink.log(&record);
        }
    }
}

struct DiscardSink;

impl Log for DiscardSink {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        false
    }

    fn log(&self, _record: &Record) {}

    fn flush(&self) {}
}

/// Sink writing text or JSON lines to stdout and/or files, each target with
/// its own level threshold.
pub struct CustomLogger {
    level: LevelFilter,
    format: LogFormat,
    targets: Vec<(LevelFilter, Mutex<BufWriter<Box<dyn Write + Send>>>)>,
}

impl CustomLogger {
    pub fn new(config: &LoggingConfig) -> Result<Self, ProxyError> {
        let level = config.level.to_filter();
        let mut targets = Vec::new();

        for target in &config.targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or_else(|| {
                        ProxyError::Config("File output type requires path".to_string())
                    })?;
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Box::new(file)
                }
            };
            let threshold = target.level.map(LogLevel::to_filter).unwrap_or(level);
            targets.push((threshold, Mutex::new(BufWriter::new(writer))));
        }

        Ok(Self {
            level,
            format: config.format,
            targets,
        })
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] [{}:{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().to_string().to_uppercase(),
            record.target(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        let log_entry = json!({
            "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "level": record.level().to_string().to_lowercase(),
            "target": record.target(),
            "file": record.file().unwrap_or("unknown"),
            "line": record.line().unwrap_or(0),
            "message": record.args().to_string(),
        });
        log_entry.to_string()
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
            || self
                .targets
                .iter()
                .any(|(threshold, _)| metadata.level() <= *threshold)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (threshold, writer) in &self.targets {
            if record.level() <= *threshold {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for (_, writer) in &self.targets {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// Reads a `LOG_LEVEL`-style override. Invalid values fall back to info.
pub fn level_override(value: Option<&str>) -> Option<LogLevel> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match value.parse::<LogLevel>() {
        Ok(level) => Some(level),
        Err(_) => {
            eprintln!(
                "Warning: Env LOG_LEVEL={} is an invalid level, use info as default level",
                value
            );
            Some(LogLevel::Info)
        }
    }
}

/// Builds the sink described by the config, or an env_logger sink when the
/// config has no `log` section.
pub fn build_sink(
    config: Option<&LoggingConfig>,
    level: Option<LogLevel>,
) -> Result<Arc<dyn Log>, ProxyError> {
    match config {
        Some(config) => {
            let mut config = config.clone();
            if let Some(level) = level {
                config.level = level;
            }
            Ok(Arc::new(CustomLogger::new(&config)?))
        }
        None => {
            let mut builder =
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
            if let Some(level) = level {
                builder.filter_level(level.to_filter());
            }
            Ok(Arc::new(builder.build()))
        }
    }
}
