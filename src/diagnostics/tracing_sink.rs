//! `tracing` backed diagnostics sink.

use tracing::{debug, error, info, trace, warn};

use super::{DiagEvent, DiagnosticsSink, LogLevel};

/// Forwards diagnostics to the process-wide `tracing` subscriber.
///
/// Severity tiers map to tracing levels: per-server -> info, per-connection
/// -> debug, per-PDU and data dumps -> trace. Errors map to warn except at
/// per-server level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn debug(&self, event: &DiagEvent<'_>) {
        let fields = event.render_fields();
        match event.level {
            LogLevel::PerServer => {
                info!(func = event.func, tier = %event.level, fields = %fields, "{}", event.message)
            }
            LogLevel::PerConnection => {
                debug!(func = event.func, tier = %event.level, fields = %fields, "{}", event.message)
            }
            LogLevel::PerPdu | LogLevel::AllDataInPdu => {
                trace!(func = event.func, tier = %event.level, fields = %fields, "{}", event.message)
            }
        }
    }

    fn error(&self, event: &DiagEvent<'_>) {
        let fields = event.render_fields();
        match event.level {
            LogLevel::PerServer => {
                error!(func = event.func, tier = %event.level, fields = %fields, "{}", event.message)
            }
            _ => warn!(func = event.func, tier = %event.level, fields = %fields, "{}", event.message),
        }
    }

    fn debug_buffer(&self, level: LogLevel, func: &str, prefix: &str, buf: &[u8]) {
        // Contents only at the data-dump tier; lengths otherwise
        if level == LogLevel::AllDataInPdu {
            trace!(func = func, len = buf.len(), "{}{}", prefix, hex::encode_upper(buf));
        } else {
            trace!(func = func, len = buf.len(), "{}<{} bytes>", prefix, buf.len());
        }
    }
}
