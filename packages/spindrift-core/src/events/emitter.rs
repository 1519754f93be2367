//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than concrete
//! broadcast channels, enabling testing and alternative transports.

use tokio::sync::broadcast;

use super::{BroadcastEvent, DeviceEvent, LogEvent, PlayerEvent, StreamEvent};

/// Trait for emitting domain events without knowledge of transport.
///
/// # Example
///
/// ```ignore
/// struct MyService {
///     emitter: Arc<dyn EventEmitter>,
/// }
///
/// impl MyService {
///     fn do_something(&self) {
///         self.emitter.emit_player(PlayerEvent::StateChanged { ... });
///     }
/// }
/// ```
pub trait EventEmitter: Send + Sync {
    /// Emits a player lifecycle or callback event.
    fn emit_player(&self, event: PlayerEvent);

    /// Emits a stream-session event.
    fn emit_stream(&self, event: StreamEvent);

    /// Emits a device enumeration event.
    fn emit_device(&self, event: DeviceEvent);

    /// Emits a mirrored log record.
    fn emit_log(&self, event: LogEvent);
}

/// No-op emitter for tests and embedded use.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_player(&self, _event: PlayerEvent) {
        // No-op
    }

    fn emit_stream(&self, _event: StreamEvent) {
        // No-op
    }

    fn emit_device(&self, _event: DeviceEvent) {
        // No-op
    }

    fn emit_log(&self, _event: LogEvent) {
        // No-op
    }
}

/// Logging emitter for debugging event flow in development.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_player(&self, event: PlayerEvent) {
        log::debug!("[Events] player: {event:?}");
    }

    fn emit_stream(&self, event: StreamEvent) {
        log::debug!("[Events] stream: {event:?}");
    }

    fn emit_device(&self, event: DeviceEvent) {
        log::debug!("[Events] device: {event:?}");
    }

    fn emit_log(&self, _event: LogEvent) {
        // Already a log record; re-logging would loop.
    }
}

/// Fans events out to WebSocket subscribers through a broadcast channel.
///
/// Slow subscribers lag and drop; the channel never applies backpressure to
/// the emitting service.
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl BroadcastEventBridge {
    /// Creates a bridge with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes a new receiver to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, event: BroadcastEvent) {
        // Err means no subscribers, which is fine for a headless endpoint.
        let _ = self.tx.send(event);
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit_player(&self, event: PlayerEvent) {
        self.send(BroadcastEvent::Player(event));
    }

    fn emit_stream(&self, event: StreamEvent) {
        self.send(BroadcastEvent::Stream(event));
    }

    fn emit_device(&self, event: DeviceEvent) {
        self.send(BroadcastEvent::Device(event));
    }

    fn emit_log(&self, event: LogEvent) {
        self.send(BroadcastEvent::Log(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events per domain.
    struct CountingEventEmitter {
        player_count: AtomicUsize,
        stream_count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                player_count: AtomicUsize::new(0),
                stream_count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_player(&self, _event: PlayerEvent) {
            self.player_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_stream(&self, _event: StreamEvent) {
            self.stream_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_device(&self, _event: DeviceEvent) {}
        fn emit_log(&self, _event: LogEvent) {}
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit_player(PlayerEvent::StateChanged {
            player: "kitchen".into(),
            state: "playing".into(),
            timestamp: 0,
        });
        emitter.emit_stream(StreamEvent::Started {
            player: "kitchen".into(),
            timestamp: 0,
        });
        emitter.emit_stream(StreamEvent::Ended {
            player: "kitchen".into(),
            timestamp: 0,
        });

        assert_eq!(emitter.player_count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.stream_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bridge_fans_out_to_subscribers() {
        let bridge = BroadcastEventBridge::new(16);
        let mut rx = bridge.subscribe();

        bridge.emit_device(DeviceEvent::ListChanged { timestamp: 7 });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            BroadcastEvent::Device(DeviceEvent::ListChanged { timestamp: 7 })
        ));
    }
}
