//! Typed request/response builders
//!
//! Every command is an opcode, a payload and a parser for the matching response.
//! They all run through [`execute`], which reuses the channel's correlation,
//! timeout and status handling.

use crate::channel::{CommandChannel, Request, StatusMode};
use crate::codec::Frame;
use crate::opcodes::{command, dfu};
use crate::types::{BandError, DeviceProcessStatus, Result, UiType};
use chrono::{Datelike, NaiveDateTime, Timelike};
use log::debug;
use std::time::Duration;

/// A command with a typed response
pub trait Command {
    type Output;

    fn opcode(&self) -> u8;

    fn payload(&self) -> Vec<u8>;

    fn status_mode(&self) -> StatusMode {
        StatusMode::None
    }

    /// Per-command timeout; `None` uses the channel default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn parse(&self, frame: Frame) -> Result<Self::Output>;

    fn request(&self) -> Request {
        let mut request =
            Request::new(self.opcode(), self.payload()).with_status(self.status_mode());
        request.timeout = self.timeout();
        request
    }
}

/// Submit a command and parse its response
pub async fn execute<C: Command>(channel: &CommandChannel, cmd: &C) -> Result<C::Output> {
    debug!("Executing {}", crate::opcodes::name(cmd.opcode()));
    let frame = channel.submit(cmd.request()).await?;
    if frame.opcode() != cmd.opcode() {
        return Err(BandError::UnexpectedOpcode {
            expected: cmd.opcode(),
            got: frame.opcode(),
        });
    }
    cmd.parse(frame)
}

fn require_len(frame: &Frame, len: usize) -> Result<()> {
    if frame.payload().len() < len {
        return Err(BandError::WrongDataLength {
            declared: len,
            actual: frame.payload().len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryInfo {
    pub level: u8,
    pub charging: bool,
}

/// Read battery level and charging state
#[derive(Debug, Clone, Copy, Default)]
pub struct GetBattery {
    pub timeout: Option<Duration>,
}

impl Command for GetBattery {
    type Output = BatteryInfo;

    fn opcode(&self) -> u8 {
        command::BATTERY
    }

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn parse(&self, frame: Frame) -> Result<BatteryInfo> {
        require_len(&frame, 2)?;
        let p = frame.payload();
        if p[0] > 100 {
            return Err(BandError::InvalidData(format!("battery level {}", p[0])));
        }
        Ok(BatteryInfo {
            level: p[0],
            charging: p[1] != 0,
        })
    }
}

/// Set the band's clock
///
/// The year is sent as an offset from 2000.
#[derive(Debug, Clone, Copy)]
pub struct SetTime(pub NaiveDateTime);

impl Command for SetTime {
    type Output = ();

    fn opcode(&self) -> u8 {
        command::SET_TIME
    }

    fn payload(&self) -> Vec<u8> {
        let t = self.0;
        let year = (t.year() - 2000).clamp(0, 255) as u8;
        vec![
            year,
            t.month() as u8,
            t.day() as u8,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
        ]
    }

    fn parse(&self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

/// Make the band vibrate
#[derive(Debug, Clone, Copy, Default)]
pub struct FindDevice;

impl Command for FindDevice {
    type Output = ();

    fn opcode(&self) -> u8 {
        command::FIND_DEVICE
    }

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }

    fn parse(&self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RealTimeHeartRate {
    Start = 1,
    End = 2,
    /// Keep-alive for continuous measurement
    Hold = 3,
}

impl Command for RealTimeHeartRate {
    type Output = ();

    fn opcode(&self) -> u8 {
        command::REALTIME_HEART_RATE
    }

    fn payload(&self) -> Vec<u8> {
        vec![*self as u8]
    }

    fn parse(&self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

/// Camera remote control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CameraMode {
    SwitchToPhoto = 1,
    Hold = 2,
    Stop = 3,
}

impl Command for CameraMode {
    type Output = ();

    fn opcode(&self) -> u8 {
        command::CAMERA
    }

    fn payload(&self) -> Vec<u8> {
        vec![*self as u8]
    }

    fn parse(&self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

/// Query firmware update progress
///
/// Shares opcode 0x06 with the battery query; the pending request decides which
/// one a response answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckDfuStatus;

impl Command for CheckDfuStatus {
    type Output = DeviceProcessStatus;

    fn opcode(&self) -> u8 {
        dfu::CHECK_STATUS
    }

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }

    fn parse(&self, frame: Frame) -> Result<DeviceProcessStatus> {
        require_len(&frame, 1)?;
        DeviceProcessStatus::from_u8(frame.payload()[0])
    }
}

/// Switch to a validated firmware image and reboot
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivateFirmware;

impl Command for ActivateFirmware {
    type Output = ();

    fn opcode(&self) -> u8 {
        dfu::ACTIVATE_AND_RESET
    }

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }

    fn status_mode(&self) -> StatusMode {
        StatusMode::Operation
    }

    fn parse(&self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

/// Remove an uploaded watch face by slot index
#[derive(Debug, Clone, Copy)]
pub struct DeleteDialFile(pub u8);

impl Command for DeleteDialFile {
    type Output = ();

    fn opcode(&self) -> u8 {
        dfu::DIAL_FILE_DELETE
    }

    fn payload(&self) -> Vec<u8> {
        vec![self.0]
    }

    fn status_mode(&self) -> StatusMode {
        StatusMode::Operation
    }

    fn parse(&self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

/// Remove custom UI resources
#[derive(Debug, Clone, Copy)]
pub struct DeleteResource(pub UiType);

impl Command for DeleteResource {
    type Output = ();

    fn opcode(&self) -> u8 {
        dfu::DELETE_RESOURCE
    }

    fn payload(&self) -> Vec<u8> {
        vec![self.0 as u8]
    }

    fn status_mode(&self) -> StatusMode {
        StatusMode::Operation
    }

    fn parse(&self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}
