//! Log sink for the UI layer
//! Every record goes to stderr and is forwarded to the UI as a
//! [`LogMessage`] over an unbounded channel.

use std::sync::OnceLock;

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::mpsc;

static LOGGER: OnceLock<UiLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

impl LogMessage {
    fn from_record(record: &Record) -> Self {
        Self {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }
}

pub struct UiLogger {
    sink: Option<mpsc::UnboundedSender<LogMessage>>,
    level: Level,
}

impl UiLogger {
    pub fn new(sink: Option<mpsc::UnboundedSender<LogMessage>>, level: Level) -> Self {
        Self { sink, level }
    }

    /// Installs the logger process-wide. Fails if a logger is already set.
    pub fn init(
        sink: Option<mpsc::UnboundedSender<LogMessage>>,
        level: Level,
    ) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| UiLogger::new(sink, level));
        log::set_logger(logger).map(|()| log::set_max_level(logger.level.to_level_filter()))
    }

    fn emit_log(&self, record: &Record) {
        if let Some(sink) = &self.sink {
            // A closed UI channel just means nobody is watching.
            let _ = sink.send(LogMessage::from_record(record));
        }
    }
}

impl log::Log for UiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{} [{}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            );
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}
