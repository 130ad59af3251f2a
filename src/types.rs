//! Common types, status taxonomies, and error definitions for the band protocol

use std::fmt;
use thiserror::Error;

/// Result type alias for band operations
pub type Result<T> = std::result::Result<T, BandError>;

/// Coarse classification of a [`BandError`], used by callers to pick a recovery path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The link is not usable (not ready, lost, or refused by the single-link policy)
    Transport,
    /// Bytes on the wire did not form a valid frame
    Protocol,
    /// The command channel refused or gave up on a request
    ChannelPolicy,
    /// The device answered with a non-success status byte
    Device,
    /// The device cannot perform the operation in its current physical state
    Precondition,
    /// Errors raised locally (cancellation, bad arguments, configuration)
    Local,
}

/// Error types for band communication
#[derive(Error, Debug)]
pub enum BandError {
    #[error("Link is not ready")]
    NotConnected,

    #[error("Link lost")]
    LinkLost,

    #[error("Another link is already active ({0})")]
    LinkBusy(String),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Reconnection gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Wrong data length: declared {declared}, got {actual}")]
    WrongDataLength { declared: usize, actual: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unexpected opcode: expected {expected:#04x}, got {got:#04x}")]
    UnexpectedOpcode { expected: u8, got: u8 },

    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("Payload too large for a single frame: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unknown status code: {0:#04x}")]
    UnknownStatus(u8),

    #[error("Channel busy: request {pending:#04x} is still in flight")]
    ChannelBusy { pending: u8 },

    #[error("No response to {opcode:#04x} before timeout")]
    NotifyTimeOut { opcode: u8 },

    #[error("Device reported {0}")]
    Device(OperationStatus),

    #[error("Device file error: {0}")]
    File(FileStatus),

    #[error("Measurement failed: {0}")]
    Measurement(MeasurementError),

    #[error("A {0} session is already running")]
    SessionActive(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BandError {
    /// Which part of the error taxonomy this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            BandError::NotConnected
            | BandError::LinkLost
            | BandError::LinkBusy(_)
            | BandError::ConnectTimeout(_)
            | BandError::ReconnectExhausted { .. }
            | BandError::Bluetooth(_) => ErrorCategory::Transport,
            BandError::ChecksumMismatch { .. }
            | BandError::WrongDataLength { .. }
            | BandError::InvalidData(_)
            | BandError::UnexpectedOpcode { .. }
            | BandError::PacketTooShort(_)
            | BandError::PayloadTooLarge(_)
            | BandError::UnknownStatus(_) => ErrorCategory::Protocol,
            BandError::ChannelBusy { .. } | BandError::NotifyTimeOut { .. } => {
                ErrorCategory::ChannelPolicy
            }
            BandError::Device(_) => ErrorCategory::Device,
            BandError::File(FileStatus::LowPower)
            | BandError::File(FileStatus::MemoryFull)
            | BandError::File(FileStatus::FlashOperation) => ErrorCategory::Precondition,
            BandError::File(_) => ErrorCategory::Device,
            BandError::Measurement(_) | BandError::SessionActive(_) => ErrorCategory::Precondition,
            BandError::Aborted
            | BandError::InvalidParameter(_)
            | BandError::Config(_)
            | BandError::Io(_)
            | BandError::Json(_) => ErrorCategory::Local,
        }
    }

    /// Numeric code used by the vendor SDK callbacks, where one exists
    ///
    /// DFU failures use the 1001..1004 family, measurement failures use -1..-4.
    pub fn legacy_code(&self) -> Option<i32> {
        match self {
            BandError::ChannelBusy { .. } => Some(1001),
            BandError::NotifyTimeOut { .. } => Some(1002),
            BandError::InvalidParameter(_) => Some(1003),
            BandError::UnexpectedOpcode { .. } => Some(1004),
            BandError::Measurement(m) => Some(m.code()),
            _ => None,
        }
    }

    /// True for the errors raised when the link goes away under a request
    pub fn is_link_lost(&self) -> bool {
        matches!(self, BandError::LinkLost)
    }
}

/// Status byte carried in responses of the DFU, resource and dial protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationStatus {
    Success = 0,
    WrongDataLength = 1,
    InvalidData = 2,
    WrongCommandStage = 3,
    InvalidCommandParameter = 4,
    DeviceInternalError = 5,
    NotEnoughPower = 6,
    DialFileOverwhelming = 7,
}

impl OperationStatus {
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0 => Ok(OperationStatus::Success),
            1 => Ok(OperationStatus::WrongDataLength),
            2 => Ok(OperationStatus::InvalidData),
            3 => Ok(OperationStatus::WrongCommandStage),
            4 => Ok(OperationStatus::InvalidCommandParameter),
            5 => Ok(OperationStatus::DeviceInternalError),
            6 => Ok(OperationStatus::NotEnoughPower),
            7 => Ok(OperationStatus::DialFileOverwhelming),
            _ => Err(BandError::UnknownStatus(code)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == OperationStatus::Success
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationStatus::Success => "SUCCESS",
            OperationStatus::WrongDataLength => "WRONG_DATA_LENGTH",
            OperationStatus::InvalidData => "INVALID_DATA",
            OperationStatus::WrongCommandStage => "WRONG_COMMAND_STAGE",
            OperationStatus::InvalidCommandParameter => "INVALID_COMMAND_PARAMETER",
            OperationStatus::DeviceInternalError => "DEVICE_INTERNAL_ERROR",
            OperationStatus::NotEnoughPower => "NOT_ENOUGH_POWER",
            OperationStatus::DialFileOverwhelming => "DIAL_FILE_OVERWHELMING",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Status byte of the missing-file (image, music, ebook) protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileStatus {
    Success = 0,
    Size = 1,
    Data = 2,
    State = 3,
    Format = 4,
    FlashOperation = 5,
    LowPower = 6,
    MemoryFull = 7,
}

impl FileStatus {
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0 => Ok(FileStatus::Success),
            1 => Ok(FileStatus::Size),
            2 => Ok(FileStatus::Data),
            3 => Ok(FileStatus::State),
            4 => Ok(FileStatus::Format),
            5 => Ok(FileStatus::FlashOperation),
            6 => Ok(FileStatus::LowPower),
            7 => Ok(FileStatus::MemoryFull),
            _ => Err(BandError::UnknownStatus(code)),
        }
    }

    pub fn is_success(self) -> bool {
        self == FileStatus::Success
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Success => write!(f, "success"),
            FileStatus::Size => write!(f, "wrong size"),
            FileStatus::Data => write!(f, "bad data"),
            FileStatus::State => write!(f, "wrong state"),
            FileStatus::Format => write!(f, "wrong format"),
            FileStatus::FlashOperation => write!(f, "flash operation failed"),
            FileStatus::LowPower => write!(f, "battery too low"),
            FileStatus::MemoryFull => write!(f, "memory full"),
        }
    }
}

/// Measurement failures reported through the session callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementError {
    StartFailed,
    EndFailed,
    NotWorn,
    NotCalibrated,
}

impl MeasurementError {
    /// Vendor error code (-1..-4)
    pub fn code(self) -> i32 {
        match self {
            MeasurementError::StartFailed => -1,
            MeasurementError::EndFailed => -2,
            MeasurementError::NotWorn => -3,
            MeasurementError::NotCalibrated => -4,
        }
    }

    /// Map a measurement status byte from the device; 0 means accepted
    pub fn from_status(status: u8) -> Option<Self> {
        match status {
            0 => None,
            3 => Some(MeasurementError::NotWorn),
            4 => Some(MeasurementError::NotCalibrated),
            _ => Some(MeasurementError::StartFailed),
        }
    }
}

impl fmt::Display for MeasurementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementError::StartFailed => write!(f, "start command failed"),
            MeasurementError::EndFailed => write!(f, "end command failed"),
            MeasurementError::NotWorn => write!(f, "not worn"),
            MeasurementError::NotCalibrated => write!(f, "not calibrated"),
        }
    }
}

/// Firmware update progress as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceProcessStatus {
    Free = 0,
    ReadyToUpdate = 1,
    ParameterInited = 2,
    FirmwareReceiving = 3,
    FirmwareValidated = 4,
    NotKnown = 5,
}

impl DeviceProcessStatus {
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0 => Ok(DeviceProcessStatus::Free),
            1 => Ok(DeviceProcessStatus::ReadyToUpdate),
            2 => Ok(DeviceProcessStatus::ParameterInited),
            3 => Ok(DeviceProcessStatus::FirmwareReceiving),
            4 => Ok(DeviceProcessStatus::FirmwareValidated),
            5 => Ok(DeviceProcessStatus::NotKnown),
            _ => Err(BandError::UnknownStatus(code)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FirmwareType {
    Application = 1,
    Bootloader = 2,
    Softdevice = 3,
}

/// Flash layout used while updating: dual bank keeps the old image until validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BandType {
    TwoBand = 0,
    OneBand = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceType {
    Default = 0,
    Image = 1,
    Text = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UiType {
    StandBy = 1,
    Boot = 2,
    ShutDown = 3,
    All = 0xFF,
}

/// Sub-operation of the missing-file init request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileInitOp {
    Add = 1,
    Delete = 2,
    Music = 3,
    Ebook = 4,
}
