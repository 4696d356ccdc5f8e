//! Alert/Event emitter
//!
//! Turns findings from the merge step into normalized [`MonitorEvent`]s and
//! fans them out two ways:
//!
//! - a broadcast channel, exposed to subscribers as a stream
//! - a bounded queue drained by [`EventDispatcher`], which hands each event to
//!   the configured [`EventSink`]
//!
//! Emission never blocks: a full queue drops the event with a warning, and a
//! failing or slow sink only affects the dispatcher task, never a poll cycle.

pub mod sinks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::config::EventConfig;
use crate::device::{DeviceIdentity, HealthStatus, Protocol};
use crate::traits::EventSink;

pub use sinks::{ChannelSink, LogSink};

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
}

/// A change in a device's derived health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub identity: DeviceIdentity,
    pub previous: HealthStatus,
    pub new: HealthStatus,
    /// Protocol whose result triggered the change
    pub cause: Protocol,
    pub timestamp: DateTime<Utc>,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Derived health status changed
    HealthTransition(HealthTransition),
    /// Discovery found a device that was not cached yet
    DeviceDiscovered {
        address: IpAddr,
        vendor_hint: Option<String>,
    },
    /// A port opened that was not open before (or is not expected)
    OpenPortDetected { port: u16 },
    /// The device rejected our credentials
    AuthenticationFailure { protocol: Protocol, detail: String },
    /// The record was evicted on external request
    DeviceRemoved,
}

/// Normalized event handed to subscribers and the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub identity: DeviceIdentity,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl MonitorEvent {
    /// Build an event, classifying its severity
    pub fn new(identity: DeviceIdentity, kind: EventKind) -> Self {
        let timestamp = match &kind {
            EventKind::HealthTransition(t) => t.timestamp,
            _ => Utc::now(),
        };
        Self {
            severity: classify(&kind),
            identity,
            timestamp,
            kind,
        }
    }

    /// The transition carried by this event, if any
    pub fn transition(&self) -> Option<&HealthTransition> {
        match &self.kind {
            EventKind::HealthTransition(t) => Some(t),
            _ => None,
        }
    }
}

impl From<HealthTransition> for MonitorEvent {
    fn from(transition: HealthTransition) -> Self {
        MonitorEvent::new(
            transition.identity.clone(),
            EventKind::HealthTransition(transition),
        )
    }
}

/// Severity of an event kind
pub fn classify(kind: &EventKind) -> Severity {
    match kind {
        EventKind::HealthTransition(t) => match t.new {
            HealthStatus::Offline | HealthStatus::Degraded => Severity::Warning,
            HealthStatus::Online | HealthStatus::Unknown => Severity::Info,
        },
        EventKind::DeviceDiscovered { .. } | EventKind::DeviceRemoved => Severity::Info,
        EventKind::OpenPortDetected { .. } | EventKind::AuthenticationFailure { .. } => {
            Severity::High
        }
    }
}

/// Stream of events for one subscriber
pub type EventStream = Pin<Box<dyn Stream<Item = MonitorEvent> + Send>>;

/// Fans events out to subscribers and the sink queue
pub struct AlertEmitter {
    broadcast_tx: broadcast::Sender<MonitorEvent>,
    queue_tx: mpsc::Sender<MonitorEvent>,
    queue_rx: Mutex<Option<mpsc::Receiver<MonitorEvent>>>,
}

impl AlertEmitter {
    /// Create an emitter with the configured queue capacity
    pub fn new(config: &EventConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.channel_capacity);
        let (queue_tx, queue_rx) = mpsc::channel(config.channel_capacity);
        Self {
            broadcast_tx,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    /// Emit an event
    ///
    /// Never blocks. When the sink queue is full the event is dropped for the
    /// sink (with a warning log); subscribers still receive it.
    pub fn emit(&self, event: MonitorEvent) {
        debug!(
            "Emitting {:?} event for {}",
            event.severity, event.identity
        );

        // No subscribers is not an error
        let _ = self.broadcast_tx.send(event.clone());

        if self.queue_tx.try_send(event).is_err() {
            warn!(
                "Event queue full, dropping event. Consider increasing events.channel_capacity or using a faster sink."
            );
        }
    }

    /// Subscribe to all future events
    ///
    /// A subscriber that falls behind by more than the channel capacity skips
    /// the events it missed.
    pub fn subscribe(&self) -> EventStream {
        let stream = BroadcastStream::new(self.broadcast_tx.subscribe()).filter_map(|item| {
            match item {
                Ok(event) => Some(event),
                Err(lagged) => {
                    warn!("Event subscriber lagged: {}", lagged);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    /// Take the sink queue for the dispatcher
    ///
    /// Returns `None` once a dispatcher already owns the queue.
    pub async fn take_dispatcher(
        &self,
        sink: std::sync::Arc<dyn EventSink>,
        publish_timeout: Duration,
    ) -> Option<EventDispatcher> {
        let rx = self.queue_rx.lock().await.take()?;
        Some(EventDispatcher {
            rx,
            sink,
            publish_timeout,
        })
    }
}

/// Drains the sink queue into an [`EventSink`]
pub struct EventDispatcher {
    rx: mpsc::Receiver<MonitorEvent>,
    sink: std::sync::Arc<dyn EventSink>,
    publish_timeout: Duration,
}

impl EventDispatcher {
    /// Publish queued events until every sender is gone
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.publish(&event).await;
        }
        debug!("Event dispatcher for {} stopped", self.sink.sink_name());
    }

    /// Publish whatever is already queued, then return
    pub async fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.publish(&event).await;
        }
    }

    async fn publish(&self, event: &MonitorEvent) {
        match tokio::time::timeout(self.publish_timeout, self.sink.publish(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "Sink {} failed to publish event for {}: {}",
                    self.sink.sink_name(),
                    event.identity,
                    e
                );
            }
            Err(_) => {
                warn!(
                    "Sink {} timed out publishing event for {}, dropping it",
                    self.sink.sink_name(),
                    event.identity
                );
            }
        }
    }
}
