// # Built-in Event Sinks
//
// - `LogSink`: one structured log line per event
// - `ChannelSink`: forwards events into an mpsc channel owned by the embedder

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{MonitorEvent, Severity};
use crate::traits::EventSink;
use crate::Error;

/// Sink that writes every event to the tracing log as JSON
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl LogSink {
    /// Create a new log sink
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &MonitorEvent) -> Result<(), Error> {
        let payload = serde_json::to_string(event)?;
        match event.severity {
            Severity::High | Severity::Warning => {
                warn!(identity = %event.identity, severity = ?event.severity, "{}", payload)
            }
            Severity::Info => {
                info!(identity = %event.identity, severity = ?event.severity, "{}", payload)
            }
        }
        Ok(())
    }

    fn sink_name(&self) -> &'static str {
        "log"
    }
}

/// Sink that forwards events into a channel
///
/// Waits for channel capacity; the dispatcher's publish timeout bounds how
/// long a full channel can hold it up.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<MonitorEvent>,
}

impl ChannelSink {
    /// Create a sink writing into `tx`
    pub fn new(tx: mpsc::Sender<MonitorEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: &MonitorEvent) -> Result<(), Error> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| Error::sink("event channel closed"))
    }

    fn sink_name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::EventKind;
    use crate::device::DeviceIdentity;

    fn removed() -> MonitorEvent {
        MonitorEvent::new(
            DeviceIdentity::ip("10.0.0.1".parse().unwrap()),
            EventKind::DeviceRemoved,
        )
    }

    #[tokio::test]
    async fn test_log_sink_accepts_events() {
        let sink = LogSink::new();
        assert!(sink.publish(&removed()).await.is_ok());
        assert_eq!(sink.sink_name(), "log");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ChannelSink::new(tx);

        let event = removed();
        sink.publish(&event).await.unwrap();
        assert_eq!(rx.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_channel_sink_closed_is_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = ChannelSink::new(tx);

        assert!(matches!(sink.publish(&removed()).await, Err(Error::Sink(_))));
    }
}
