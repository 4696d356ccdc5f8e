// # Event Sink Trait
//
// The publish side of the alert emitter. Delivery semantics (queue, socket
// broadcast, webhook) belong to the implementation; the engine only calls
// `publish` and treats any failure as "logged and dropped".

use async_trait::async_trait;

use crate::alerts::MonitorEvent;

/// Destination for normalized monitor events
///
/// # Contract
///
/// - `publish` is called from a single dispatcher task, in emission order
/// - A slow sink is cut off by the dispatcher's publish timeout
/// - Returning an error drops the event; the engine never retries delivery
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event
    async fn publish(&self, event: &MonitorEvent) -> Result<(), crate::Error>;

    /// Sink name (for logging/debugging)
    fn sink_name(&self) -> &'static str;
}
