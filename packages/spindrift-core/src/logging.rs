//! Log streaming onto the push channel.
//!
//! [`TeeLogger`] wraps another `log::Log` implementation (the binary's
//! `env_logger`) and mirrors each accepted record into the event bridge as
//! a `log_entry`, so WebSocket clients can stream logs without file access.

use std::sync::Arc;

use log::{Log, Metadata, Record};

use crate::events::{EventEmitter, LogEvent};
use crate::utils::now_millis;

/// Logger wrapper mirroring records into the event bridge.
pub struct TeeLogger {
    inner: Box<dyn Log>,
    emitter: Arc<dyn EventEmitter>,
}

impl TeeLogger {
    /// Wraps `inner`, mirroring accepted records into `emitter`.
    #[must_use]
    pub fn new(inner: Box<dyn Log>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self { inner, emitter }
    }
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        self.inner.log(record);
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        // The WS relay never logs from its own send path, so no feedback
        // loop forms here.
        self.emitter.emit_log(LogEvent {
            level: record.level().to_string().to_lowercase(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: now_millis(),
        });
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceEvent, PlayerEvent, StreamEvent};
    use parking_lot::Mutex;

    struct CollectingEmitter {
        entries: Mutex<Vec<LogEvent>>,
    }

    impl EventEmitter for CollectingEmitter {
        fn emit_player(&self, _event: PlayerEvent) {}
        fn emit_stream(&self, _event: StreamEvent) {}
        fn emit_device(&self, _event: DeviceEvent) {}
        fn emit_log(&self, event: LogEvent) {
            self.entries.lock().push(event);
        }
    }

    struct AcceptAll;
    impl Log for AcceptAll {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }
        fn log(&self, _record: &Record<'_>) {}
        fn flush(&self) {}
    }

    #[test]
    fn mirrors_records_into_emitter() {
        let emitter = Arc::new(CollectingEmitter {
            entries: Mutex::new(Vec::new()),
        });
        let tee = TeeLogger::new(Box::new(AcceptAll), emitter.clone());

        tee.log(
            &Record::builder()
                .level(log::Level::Warn)
                .target("spindrift_core::player")
                .args(format_args!("xrun recovered"))
                .build(),
        );

        let entries = emitter.entries.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "warn");
        assert_eq!(entries[0].message, "xrun recovered");
    }
}
