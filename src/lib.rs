//! QC-family Wearable BLE Protocol Engine
//!
//! This library implements the host side of the vendor protocol spoken by QC-family
//! rings and bands over a single GATT write/notify characteristic pair: packet
//! framing with checksums and chunk reassembly, request/response correlation,
//! connection supervision with reconnect policies, chunked uploads and measurement
//! sessions.
//!
//! # Modules
//!
//! - `codec`: frame encoding, chunking and reassembly
//! - `checksum`: pluggable frame checksums
//! - `channel`: single-flight request/response correlation
//! - `commands`: typed request builders and response parsers
//! - `events`: device-initiated events and their dispatcher
//! - `supervisor`: link lifecycle, reconnect and RX health
//! - `transfer`: firmware, dial, resource, image and contact uploads
//! - `sessions`: measurement and wear calibration sessions
//! - `link`: one supervised band link wiring the above together
//! - `transport`: the boundary with the platform BLE stack
//! - `mock`: in-memory transport for tests and demos
//! - `types`: errors and device status codes

pub mod channel;
pub mod checksum;
pub mod codec;
pub mod commands;
pub mod config;
pub mod events;
pub mod link;
pub mod mock;
pub mod opcodes;
pub mod sessions;
pub mod supervisor;
pub mod transfer;
pub mod transport;
pub mod types;

pub use channel::{CommandChannel, Request, Routed, StatusMode};
pub use checksum::{Checksum, ChecksumKind, Crc16Arc, NoChecksum, Sum8};
pub use codec::{Decoded, Frame, FrameCodec};
pub use commands::{
    ActivateFirmware, BatteryInfo, CameraMode, CheckDfuStatus, Command, DeleteDialFile,
    DeleteResource, FindDevice, GetBattery, RealTimeHeartRate, SetTime,
};
pub use config::{
    ChannelConfig, CodecConfig, LinkConfig, ReconnectConfig, ReconnectMode, SessionConfig,
    TransferConfig,
};
pub use events::{DeviceEvent, EventDispatcher, EventObserver, EventTopic, SubscriptionId};
pub use link::BandLink;
pub use sessions::{
    MeasurementKind, MeasurementObserver, MeasurementSample, MeasurementValue, SessionManager,
    SessionState,
};
pub use supervisor::{
    ConnectionSupervisor, HealthStatus, LinkInfo, LinkObserver, LinkState, ReconnectReason,
    SupervisorMetrics,
};
pub use transfer::{
    AckMode, TransferEngine, TransferHandle, TransferJob, TransferKind, TransferObserver,
    TransferReport, TransferSnapshot, TransferState,
};
pub use transport::{BleTransport, DiscoveredPeripheral, PeripheralId};
pub use types::{BandError, ErrorCategory, MeasurementError, OperationStatus, Result};
