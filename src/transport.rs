//! Boundary with the platform BLE stack
//!
//! The engine never touches platform types. A transport exposes scanning, connecting,
//! and a raw byte write on the band's write characteristic; the platform pushes
//! notification bytes and involuntary disconnects into [`crate::link::BandLink`].

use crate::types::Result;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Primary service of the band (command + notify characteristics)
pub const SERVICE_UUID: &str = "6E40FFF0-B5A3-F393-E0A9-E50E24DCCA9E";

/// Secondary service used by the file and firmware protocols
pub const DFU_SERVICE_UUID: &str = "DE5BF728-D711-4E47-AF26-65E3012A5DC7";

/// Characteristic the engine writes chunks to
pub const WRITE_CHARACTERISTIC_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

/// Characteristic the band notifies chunks on
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

/// Stable identity of a peripheral (MAC address or platform UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scan result
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Trait for BLE operations that must be implemented by the platform
#[async_trait::async_trait]
pub trait BleTransport: Send + Sync {
    /// Start scanning for peripherals advertising any of `service_filters`
    ///
    /// The stream may yield the same peripheral more than once; de-duplication is
    /// the supervisor's job.
    async fn scan(
        &self,
        service_filters: &[String],
    ) -> Result<BoxStream<'static, DiscoveredPeripheral>>;

    async fn stop_scan(&self) -> Result<()>;

    /// Connect and resolve the band's characteristics within `timeout`
    async fn connect(&self, peripheral: &PeripheralId, timeout: Duration) -> Result<()>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Write one chunk to the write characteristic
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Negotiated ATT MTU, if the platform exposes it
    fn mtu(&self) -> Option<usize> {
        None
    }
}
