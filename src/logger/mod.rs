use log::{Level, Record, SetLoggerError};
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => LogLevel::ERROR,
            Level::Warn => LogLevel::WARN,
            Level::Info => LogLevel::INFO,
            Level::Debug => LogLevel::DEBUG,
            Level::Trace => LogLevel::TRACE,
        }
    }
}

/// One log record rendered as a JSON object.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry<'a> {
    timestamp: String,
    level: LogLevel,
    target: &'a str,
    thread: Option<String>,
    file: Option<&'a str>,
    line: Option<u32>,
    message: String,
}

impl<'a> LogEntry<'a> {
    pub fn from_record(record: &'a Record<'_>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: record.level().into(),
            target: record.target(),
            thread: std::thread::current().name().map(str::to_string),
            file: record.file(),
            line: record.line(),
            message: record.args().to_string(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or(String::from("Error serializing log entry"))
    }
}

fn builder() -> env_logger::Builder {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
}

/// Installs `env_logger` filtered by `RUST_LOG` (default `info`). Does nothing when a logger
/// is already installed.
pub fn init() {
    let _ = try_init();
}

pub fn try_init() -> Result<(), SetLoggerError> {
    builder().try_init()
}

/// Like [`try_init`], writing every record as one [`LogEntry`] JSON line.
pub fn try_init_json() -> Result<(), SetLoggerError> {
    builder()
        .format(|buf, record| writeln!(buf, "{}", LogEntry::from_record(record).to_json()))
        .try_init()
}
