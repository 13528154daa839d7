//! Diagnostics for the RA engine
//!
//! Every diagnostic carries one of four severities, from once-per-process
//! events down to full PDU dumps. Debug and error streams have independent
//! thresholds; an event is emitted when its level is at or below the
//! stream's threshold.
//!
//! Sinks receive already-filtered events. `TracingSink` forwards to
//! `tracing`; `FileSink` appends to a buffered log file flushed by a
//! background task.

pub mod file;
pub mod tracing_sink;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{RaError, Result};

pub use file::{spawn_flush_task, BufferedLogFile, FileSink, FlushTaskHandle};
pub use tracing_sink::TracingSink;

/// Diagnostic severity tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    /// Once per process: startup, shutdown, configuration, backend failover
    PerServer = 4,
    /// Once per token connection; most events live here
    PerConnection = 6,
    /// Once per PDU / backend exchange
    PerPdu = 8,
    /// Full data dumps of every PDU
    AllDataInPdu = 9,
}

impl LogLevel {
    pub fn from_number(value: u8) -> Result<Self> {
        match value {
            4 => Ok(Self::PerServer),
            6 => Ok(Self::PerConnection),
            8 => Ok(Self::PerPdu),
            9 => Ok(Self::AllDataInPdu),
            other => Err(RaError::Configuration(format!(
                "Log level {} is not one of 4, 6, 8, 9",
                other
            ))),
        }
    }

    pub fn as_number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PerServer => "per-server",
            Self::PerConnection => "per-connection",
            Self::PerPdu => "per-pdu",
            Self::AllDataInPdu => "all-data-in-pdu",
        })
    }
}

/// One structured diagnostic event.
#[derive(Clone, Copy)]
pub struct DiagEvent<'a> {
    pub level: LogLevel,
    /// Originating operation, e.g. `SessionKeyDeriver::derive`
    pub func: &'a str,
    pub message: &'a str,
    pub fields: &'a [(&'a str, &'a dyn fmt::Display)],
}

impl DiagEvent<'_> {
    /// `key=value` rendering of the field set
    pub fn render_fields(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Destination for diagnostics. Writes are fire-and-forget.
pub trait DiagnosticsSink: Send + Sync {
    fn debug(&self, event: &DiagEvent<'_>);

    fn error(&self, event: &DiagEvent<'_>);

    /// Dump a byte buffer (challenges, cryptograms, PDUs).
    fn debug_buffer(&self, level: LogLevel, func: &str, prefix: &str, buf: &[u8]);
}

/// Threshold-filtering front end over one or more sinks.
#[derive(Clone)]
pub struct Diagnostics {
    sinks: Vec<Arc<dyn DiagnosticsSink>>,
    debug_level: LogLevel,
    error_level: LogLevel,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink), LogLevel::AllDataInPdu, LogLevel::AllDataInPdu)
    }
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticsSink>, debug_level: LogLevel, error_level: LogLevel) -> Self {
        Self {
            sinks: vec![sink],
            debug_level,
            error_level,
        }
    }

    /// Add another sink receiving the same events.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn debug_enabled(&self, level: LogLevel) -> bool {
        level <= self.debug_level
    }

    pub fn error_enabled(&self, level: LogLevel) -> bool {
        level <= self.error_level
    }

    pub fn debug(
        &self,
        level: LogLevel,
        func: &str,
        message: &str,
        fields: &[(&str, &dyn fmt::Display)],
    ) {
        if !self.debug_enabled(level) {
            return;
        }
        let event = DiagEvent {
            level,
            func,
            message,
            fields,
        };
        for sink in &self.sinks {
            sink.debug(&event);
        }
    }

    pub fn error(
        &self,
        level: LogLevel,
        func: &str,
        message: &str,
        fields: &[(&str, &dyn fmt::Display)],
    ) {
        if !self.error_enabled(level) {
            return;
        }
        let event = DiagEvent {
            level,
            func,
            message,
            fields,
        };
        for sink in &self.sinks {
            sink.error(&event);
        }
    }

    pub fn debug_buffer(&self, level: LogLevel, func: &str, prefix: &str, buf: &[u8]) {
        if !self.debug_enabled(level) {
            return;
        }
        for sink in &self.sinks {
            sink.debug_buffer(level, func, prefix, buf);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records rendered events, for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub lines: Mutex<Vec<String>>,
    }

    impl DiagnosticsSink for RecordingSink {
        fn debug(&self, event: &DiagEvent<'_>) {
            self.lines
                .lock()
                .unwrap()
                .push(format!("D{} {} {}", event.level.as_number(), event.func, event.message));
        }

        fn error(&self, event: &DiagEvent<'_>) {
            self.lines
                .lock()
                .unwrap()
                .push(format!("E{} {} {}", event.level.as_number(), event.func, event.message));
        }

        fn debug_buffer(&self, level: LogLevel, func: &str, prefix: &str, buf: &[u8]) {
            self.lines.lock().unwrap().push(format!(
                "B{} {} {}{}",
                level.as_number(),
                func,
                prefix,
                hex::encode(buf)
            ));
        }
    }

    #[test]
    fn test_level_ordering_and_numbers() {
        assert!(LogLevel::PerServer < LogLevel::PerConnection);
        assert!(LogLevel::PerPdu < LogLevel::AllDataInPdu);
        assert_eq!(LogLevel::from_number(6).unwrap(), LogLevel::PerConnection);
        assert!(LogLevel::from_number(5).is_err());
    }

    #[test]
    fn test_thresholds_filter_events() {
        let sink = Arc::new(RecordingSink::default());
        let diag = Diagnostics::new(sink.clone(), LogLevel::PerConnection, LogLevel::PerServer);

        diag.debug(LogLevel::PerServer, "f", "startup", &[]);
        diag.debug(LogLevel::PerPdu, "f", "pdu", &[]);
        diag.error(LogLevel::PerConnection, "f", "conn error", &[]);
        diag.error(LogLevel::PerServer, "f", "fatal", &[]);
        diag.debug_buffer(LogLevel::AllDataInPdu, "f", "apdu: ", &[1, 2]);

        let lines = sink.lines.lock().unwrap();
        assert_eq!(*lines, vec!["D4 f startup".to_string(), "E4 f fatal".to_string()]);
    }

    #[test]
    fn test_render_fields() {
        let idx = 3usize;
        let event = DiagEvent {
            level: LogLevel::PerPdu,
            func: "f",
            message: "m",
            fields: &[("slot", &idx), ("kind", &"TKS")],
        };
        assert_eq!(event.render_fields(), "slot=3 kind=TKS");
    }
}
