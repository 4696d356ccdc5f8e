// # Inventory Provider Trait
//
// The inventory is an external collaborator: it owns the long-term list of
// managed devices and the credentials needed for authenticated probes. The
// engine only ever reads from it.

use async_trait::async_trait;

use crate::device::{Credentials, DeviceIdentity, DeviceTarget};

/// Read-only source of known devices and their credentials
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// All devices that should be polled
    async fn devices(&self) -> Result<Vec<DeviceTarget>, crate::Error>;

    /// Credentials for a device, if it has any
    ///
    /// Called only when a probe needs them (remote command sessions).
    async fn credentials(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Option<Credentials>, crate::Error>;
}
