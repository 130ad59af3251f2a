//! Device-initiated events and their dispatcher
//!
//! Frames that do not answer the pending request are parsed into a [`DeviceEvent`]
//! and fanned out to every observer subscribed to the event's [`EventTopic`].
//! Frames with an unknown opcode are dropped.

use crate::codec::{hex_dump, Frame};
use crate::opcodes::command;
use crate::types::{BandError, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Subscription key of the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    FindPhone,
    Camera,
    Battery,
    SportState,
    Steps,
    DialIndex,
    LowPower,
    GestureTouch,
    FlipWrist,
    TouchSleep,
    DataUpdate,
    RealTimeHeartRate,
    Measurement,
    WearCalibration,
}

impl EventTopic {
    pub const ALL: [EventTopic; 14] = [
        EventTopic::FindPhone,
        EventTopic::Camera,
        EventTopic::Battery,
        EventTopic::SportState,
        EventTopic::Steps,
        EventTopic::DialIndex,
        EventTopic::LowPower,
        EventTopic::GestureTouch,
        EventTopic::FlipWrist,
        EventTopic::TouchSleep,
        EventTopic::DataUpdate,
        EventTopic::RealTimeHeartRate,
        EventTopic::Measurement,
        EventTopic::WearCalibration,
    ];
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventTopic::FindPhone => "find-phone",
            EventTopic::Camera => "camera",
            EventTopic::Battery => "battery",
            EventTopic::SportState => "sport-state",
            EventTopic::Steps => "steps",
            EventTopic::DialIndex => "dial-index",
            EventTopic::LowPower => "low-power",
            EventTopic::GestureTouch => "gesture-touch",
            EventTopic::FlipWrist => "flip-wrist",
            EventTopic::TouchSleep => "touch-sleep",
            EventTopic::DataUpdate => "data-update",
            EventTopic::RealTimeHeartRate => "real-time-heart-rate",
            EventTopic::Measurement => "measurement",
            EventTopic::WearCalibration => "wear-calibration",
        };
        write!(f, "{}", name)
    }
}

/// Camera remote actions sent by the band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraAction {
    SwitchToPicture,
    TakePicture,
    StopTakePicture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SportState {
    Start = 1,
    Pause = 2,
    Continue = 3,
    Stop = 4,
    Running = 5,
    GetTime = 6,
}

impl SportState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SportState::Start),
            2 => Some(SportState::Pause),
            3 => Some(SportState::Continue),
            4 => Some(SportState::Stop),
            5 => Some(SportState::Running),
            6 => Some(SportState::GetTime),
            _ => None,
        }
    }
}

/// Function bound to the ring's touch or gesture control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TouchControl {
    Off = 0,
    Music = 1,
    Video = 2,
    Praise = 3,
    EBook = 4,
    TakePhoto = 5,
    PhoneCall = 6,
    Game = 7,
    HeartRateMeasure = 8,
    TouchEvent = 9,
}

impl TouchControl {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TouchControl::Off),
            1 => Some(TouchControl::Music),
            2 => Some(TouchControl::Video),
            3 => Some(TouchControl::Praise),
            4 => Some(TouchControl::EBook),
            5 => Some(TouchControl::TakePhoto),
            6 => Some(TouchControl::PhoneCall),
            7 => Some(TouchControl::Game),
            8 => Some(TouchControl::HeartRateMeasure),
            9 => Some(TouchControl::TouchEvent),
            _ => None,
        }
    }
}

/// Which kind of stored data changed on the band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataUpdateKind {
    HeartRate,
    BloodPressure,
    BloodOxygen,
    Step,
    Temperature,
    Sleep,
    SportRecord,
    Alarm,
    DoNotDisturb,
    AudioRecord,
    Hourly,
    Power,
    LowBloodSugar,
    DialIndex,
    LowPower,
    Goal,
    RaiseToWake,
    StepInfo,
    Prayer,
    TouchControl,
    Game,
    TouchSleep,
    Hrv,
    Stress,
}

impl DataUpdateKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use DataUpdateKind::*;
        let kind = match value {
            0x01 => HeartRate,
            0x02 => BloodPressure,
            0x03 => BloodOxygen,
            0x04 => Step,
            0x05 => Temperature,
            0x06 => Sleep,
            0x07 => SportRecord,
            0x08 => Alarm,
            0x09 => DoNotDisturb,
            0x0A => AudioRecord,
            0x0B => Hourly,
            0x0C => Power,
            0x0D => LowBloodSugar,
            0x0E => DialIndex,
            0x0F => LowPower,
            0x10 => Goal,
            0x11 => RaiseToWake,
            0x12 => StepInfo,
            0x25 => Prayer,
            0x28 => TouchControl,
            0x29 => Game,
            0x2A => TouchSleep,
            0x2B => Hrv,
            0x2C => Stress,
            _ => return None,
        };
        Some(kind)
    }
}

/// Raw measurement frame as reported by the band; interpreted by the session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementReport {
    pub kind: u8,
    pub status: u8,
    pub values: Vec<u8>,
}

/// A parsed device-initiated frame
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    FindPhone { active: bool },
    Camera(CameraAction),
    Battery { level: u8, charging: bool },
    SportState { state: SportState, sport_type: Option<u8> },
    Steps { steps: u32, calories: u32, distance: u32 },
    DialIndex(u8),
    LowPower(bool),
    GestureTouch { mode: u8, control: TouchControl },
    FlipWrist { enabled: bool, left_hand: bool },
    TouchSleep(bool),
    DataUpdate(DataUpdateKind),
    RealTimeHeartRate(u8),
    Measurement(MeasurementReport),
    WearCalibration { stage: u8, status: u8 },
}

impl DeviceEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            DeviceEvent::FindPhone { .. } => EventTopic::FindPhone,
            DeviceEvent::Camera(_) => EventTopic::Camera,
            DeviceEvent::Battery { .. } => EventTopic::Battery,
            DeviceEvent::SportState { .. } => EventTopic::SportState,
            DeviceEvent::Steps { .. } => EventTopic::Steps,
            DeviceEvent::DialIndex(_) => EventTopic::DialIndex,
            DeviceEvent::LowPower(_) => EventTopic::LowPower,
            DeviceEvent::GestureTouch { .. } => EventTopic::GestureTouch,
            DeviceEvent::FlipWrist { .. } => EventTopic::FlipWrist,
            DeviceEvent::TouchSleep(_) => EventTopic::TouchSleep,
            DeviceEvent::DataUpdate(_) => EventTopic::DataUpdate,
            DeviceEvent::RealTimeHeartRate(_) => EventTopic::RealTimeHeartRate,
            DeviceEvent::Measurement(_) => EventTopic::Measurement,
            DeviceEvent::WearCalibration { .. } => EventTopic::WearCalibration,
        }
    }

    /// Parse an unsolicited frame
    ///
    /// Returns `Ok(None)` for opcodes that carry no known event.
    pub fn from_frame(frame: &Frame) -> Result<Option<DeviceEvent>> {
        let p = frame.payload();
        let byte = |i: usize| -> Result<u8> {
            p.get(i).copied().ok_or(BandError::WrongDataLength {
                declared: i + 1,
                actual: p.len(),
            })
        };

        let event = match frame.opcode() {
            command::FIND_PHONE => match byte(0)? {
                1 => DeviceEvent::FindPhone { active: true },
                2 => DeviceEvent::FindPhone { active: false },
                other => {
                    return Err(BandError::InvalidData(format!(
                        "find-phone status {}",
                        other
                    )))
                }
            },
            command::CAMERA => match byte(0)? {
                1 => DeviceEvent::Camera(CameraAction::SwitchToPicture),
                2 => DeviceEvent::Camera(CameraAction::TakePicture),
                3 => DeviceEvent::Camera(CameraAction::StopTakePicture),
                other => {
                    return Err(BandError::InvalidData(format!("camera action {}", other)))
                }
            },
            command::BATTERY => DeviceEvent::Battery {
                level: byte(0)?,
                charging: byte(1)? != 0,
            },
            command::SPORT_STATE => {
                let raw = byte(0)?;
                let state = SportState::from_u8(raw)
                    .ok_or_else(|| BandError::InvalidData(format!("sport state {}", raw)))?;
                DeviceEvent::SportState {
                    state,
                    sport_type: p.get(1).copied(),
                }
            }
            command::STEP_UPDATE => {
                let field = |offset: usize| {
                    frame.u32_at(offset).ok_or(BandError::WrongDataLength {
                        declared: 12,
                        actual: p.len(),
                    })
                };
                DeviceEvent::Steps {
                    steps: field(0)?,
                    calories: field(4)?,
                    distance: field(8)?,
                }
            }
            command::DIAL_INDEX => DeviceEvent::DialIndex(byte(0)?),
            command::LOW_POWER => DeviceEvent::LowPower(byte(0)? != 0),
            command::GESTURE_TOUCH => {
                let mode = byte(0)?;
                let raw = byte(1)?;
                let control = TouchControl::from_u8(raw)
                    .ok_or_else(|| BandError::InvalidData(format!("touch control {}", raw)))?;
                DeviceEvent::GestureTouch { mode, control }
            }
            command::FLIP_WRIST => DeviceEvent::FlipWrist {
                enabled: byte(0)? != 0,
                left_hand: byte(1)? == 0,
            },
            command::TOUCH_SLEEP => DeviceEvent::TouchSleep(byte(0)? != 0),
            command::DATA_UPDATE => {
                let raw = byte(0)?;
                match DataUpdateKind::from_u8(raw) {
                    Some(kind) => DeviceEvent::DataUpdate(kind),
                    None => {
                        debug!("Ignoring unknown data update report {:#04x}", raw);
                        return Ok(None);
                    }
                }
            }
            command::REALTIME_HEART_RATE => DeviceEvent::RealTimeHeartRate(byte(0)?),
            command::MEASUREMENT => DeviceEvent::Measurement(MeasurementReport {
                kind: byte(0)?,
                status: byte(1)?,
                values: p[2..].to_vec(),
            }),
            command::WEAR_CALIBRATION => DeviceEvent::WearCalibration {
                stage: byte(0)?,
                status: p.get(1).copied().unwrap_or(0),
            },
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

/// Receiver of device events
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &DeviceEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&DeviceEvent) + Send + Sync,
{
    fn on_event(&self, event: &DeviceEvent) {
        self(event)
    }
}

/// Handle returned by [`EventDispatcher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Topic to observer-list table
#[derive(Clone)]
pub struct EventDispatcher {
    observers: Arc<Mutex<HashMap<EventTopic, Vec<(SubscriptionId, Arc<dyn EventObserver>)>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register an observer for one topic
    pub async fn subscribe(
        &self,
        topic: EventTopic,
        observer: Arc<dyn EventObserver>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut observers = self.observers.lock().await;
        observers.entry(topic).or_default().push((id, observer));
        debug!("Subscribed {:?} to {}", id, topic);
        id
    }

    /// Returns false if the subscription was already gone
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().await;
        let mut removed = false;
        for list in observers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub async fn observer_count(&self, topic: EventTopic) -> usize {
        let observers = self.observers.lock().await;
        observers.get(&topic).map(|l| l.len()).unwrap_or(0)
    }

    /// Parse and deliver an unsolicited frame; returns how many observers saw it
    pub async fn dispatch(&self, frame: &Frame) -> usize {
        let event = match DeviceEvent::from_frame(frame) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(
                    "Dropping unsolicited frame {:#04x} with no topic: {}",
                    frame.opcode(),
                    hex_dump(frame.payload(), 16)
                );
                return 0;
            }
            Err(e) => {
                warn!(
                    "Dropping malformed {} frame: {}",
                    crate::opcodes::name(frame.opcode()),
                    e
                );
                return 0;
            }
        };
        self.publish(&event).await
    }

    /// Deliver an already-parsed event
    pub async fn publish(&self, event: &DeviceEvent) -> usize {
        let topic = event.topic();
        // Clone the list so observers may (un)subscribe from inside a callback
        let targets: Vec<Arc<dyn EventObserver>> = {
            let observers = self.observers.lock().await;
            observers
                .get(&topic)
                .map(|l| l.iter().map(|(_, o)| Arc::clone(o)).collect())
                .unwrap_or_default()
        };

        if targets.is_empty() {
            debug!("No observers for {} event", topic);
        }
        for observer in &targets {
            observer.on_event(event);
        }
        targets.len()
    }
}
