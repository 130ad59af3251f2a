//! Measurement sessions
//!
//! Each measurement kind runs `Idle -> Starting -> Active -> Stopping -> Idle`, at
//! most one session per kind. Samples reach the session through the event
//! dispatcher as unsolicited measurement frames:
//!
//! ```text
//! start request   [kind, 1]
//! stop request    [kind, 2, final value...]
//! response        [kind, status]
//! sample          [kind, 0, value...]
//! ```
//!
//! Wear calibration is a separate long-running session on its own opcode.

use crate::channel::{CommandChannel, Request};
use crate::codec::Frame;
use crate::config::SessionConfig;
use crate::events::{DeviceEvent, EventObserver, EventTopic, MeasurementReport, SubscriptionId};
use crate::opcodes::command;
use crate::types::{BandError, MeasurementError, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

const ACTION_START: u8 = 1;
const ACTION_STOP: u8 = 2;

/// Stage byte of wear calibration frames
pub mod calibration {
    pub const START: u8 = 1;
    pub const END: u8 = 2;
    pub const SINGLE_DATA: u8 = 3;
    pub const POWER_MODE: u8 = 4;
    pub const STOP_POWER_MODE: u8 = 5;
    pub const APP_START: u8 = 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MeasurementKind {
    HeartRate = 0,
    BloodPressure = 1,
    BloodOxygen = 2,
    OneKey = 3,
    Stress = 4,
    BloodGlucose = 5,
    Hrv = 6,
    BodyTemperature = 7,
    ThreeValueTemperature = 8,
    OneKeyHeartRate = 9,
    HeartRateRaw = 10,
    BloodOxygenRaw = 11,
}

impl MeasurementKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use MeasurementKind::*;
        let kind = match value {
            0 => HeartRate,
            1 => BloodPressure,
            2 => BloodOxygen,
            3 => OneKey,
            4 => Stress,
            5 => BloodGlucose,
            6 => Hrv,
            7 => BodyTemperature,
            8 => ThreeValueTemperature,
            9 => OneKeyHeartRate,
            10 => HeartRateRaw,
            11 => BloodOxygenRaw,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MeasurementKind::HeartRate => "heart rate",
            MeasurementKind::BloodPressure => "blood pressure",
            MeasurementKind::BloodOxygen => "blood oxygen",
            MeasurementKind::OneKey => "one-key",
            MeasurementKind::Stress => "stress",
            MeasurementKind::BloodGlucose => "blood glucose",
            MeasurementKind::Hrv => "HRV",
            MeasurementKind::BodyTemperature => "body temperature",
            MeasurementKind::ThreeValueTemperature => "three-value temperature",
            MeasurementKind::OneKeyHeartRate => "one-key heart rate",
            MeasurementKind::HeartRateRaw => "raw heart rate",
            MeasurementKind::BloodOxygenRaw => "raw blood oxygen",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Decoded sample value
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementValue {
    HeartRate(u8),
    BloodPressure { systolic: u8, diastolic: u8 },
    BloodOxygen(u8),
    Stress(u8),
    Hrv(u8),
    /// Degrees Celsius
    Temperature(f32),
    /// mmol/L
    BloodGlucose(f32),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementSample {
    pub kind: MeasurementKind,
    pub values: Vec<u8>,
}

impl MeasurementSample {
    pub fn value(&self) -> Result<MeasurementValue> {
        let need = |n: usize| -> Result<()> {
            if self.values.len() < n {
                return Err(BandError::WrongDataLength {
                    declared: n,
                    actual: self.values.len(),
                });
            }
            Ok(())
        };
        let word = || u16::from_le_bytes([self.values[0], self.values[1]]);

        let value = match self.kind {
            MeasurementKind::HeartRate | MeasurementKind::OneKeyHeartRate => {
                need(1)?;
                MeasurementValue::HeartRate(self.values[0])
            }
            MeasurementKind::BloodPressure => {
                need(2)?;
                MeasurementValue::BloodPressure {
                    systolic: self.values[0],
                    diastolic: self.values[1],
                }
            }
            MeasurementKind::BloodOxygen => {
                need(1)?;
                MeasurementValue::BloodOxygen(self.values[0])
            }
            MeasurementKind::Stress => {
                need(1)?;
                MeasurementValue::Stress(self.values[0])
            }
            MeasurementKind::Hrv => {
                need(1)?;
                MeasurementValue::Hrv(self.values[0])
            }
            MeasurementKind::BodyTemperature => {
                need(2)?;
                MeasurementValue::Temperature(word() as f32 / 100.0)
            }
            MeasurementKind::BloodGlucose => {
                need(2)?;
                MeasurementValue::BloodGlucose(word() as f32 / 10.0)
            }
            _ => MeasurementValue::Raw(self.values.clone()),
        };
        Ok(value)
    }
}

/// Receives the stream of a measurement session
pub trait MeasurementObserver: Send + Sync {
    fn on_sample(&self, sample: &MeasurementSample);

    /// The session ended without a stop request (device error or link loss)
    fn on_error(&self, _error: &BandError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SessionKey {
    Measurement(MeasurementKind),
    WearCalibration,
}

struct SessionEntry {
    state: SessionState,
    last_sample: Option<MeasurementSample>,
    observer: Option<Arc<dyn MeasurementObserver>>,
    calibration_result: Option<oneshot::Sender<Result<u8>>>,
}

type SessionTable = Arc<Mutex<HashMap<SessionKey, SessionEntry>>>;

fn lock_table(table: &SessionTable) -> MutexGuard<'_, HashMap<SessionKey, SessionEntry>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes measurement and calibration events into the session table
struct SessionRouter {
    sessions: SessionTable,
}

impl SessionRouter {
    fn on_report(&self, report: &MeasurementReport) {
        let Some(kind) = MeasurementKind::from_u8(report.kind) else {
            debug!("Measurement report for unknown kind {}", report.kind);
            return;
        };

        let delivery = {
            let mut sessions = lock_table(&self.sessions);
            let key = SessionKey::Measurement(kind);
            let active = sessions
                .get(&key)
                .is_some_and(|e| e.state == SessionState::Active);
            if !active {
                debug!("Dropping {} report without an active session", kind);
                return;
            }

            if report.status != 0 {
                let error = MeasurementError::from_status(report.status)
                    .unwrap_or(MeasurementError::StartFailed);
                let entry = sessions.remove(&key);
                warn!("{} session ended by device: {}", kind, error);
                entry
                    .and_then(|e| e.observer)
                    .map(|o| (o, Err(BandError::Measurement(error))))
            } else if report.values.is_empty() {
                // Late acknowledgement of the start request
                None
            } else {
                let sample = MeasurementSample {
                    kind,
                    values: report.values.clone(),
                };
                sessions.get_mut(&key).and_then(|entry| {
                    entry.last_sample = Some(sample.clone());
                    entry.observer.clone().map(|o| (o, Ok(sample)))
                })
            }
        };

        match delivery {
            Some((observer, Ok(sample))) => observer.on_sample(&sample),
            Some((observer, Err(error))) => observer.on_error(&error),
            None => {}
        }
    }

    fn on_calibration(&self, stage: u8, status: u8) {
        if stage != calibration::END {
            debug!("Wear calibration stage {} status {}", stage, status);
            return;
        }
        let waiter = lock_table(&self.sessions)
            .get_mut(&SessionKey::WearCalibration)
            .and_then(|e| e.calibration_result.take());
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(status));
            }
            None => debug!("Calibration result {} without a session", status),
        }
    }
}

impl EventObserver for SessionRouter {
    fn on_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Measurement(report) => self.on_report(report),
            DeviceEvent::WearCalibration { stage, status } => self.on_calibration(*stage, *status),
            _ => {}
        }
    }
}

/// Measurement and calibration sessions of one link
#[derive(Clone)]
pub struct SessionManager {
    channel: CommandChannel,
    config: SessionConfig,
    sessions: SessionTable,
}

impl SessionManager {
    /// Create the manager and hook it into the channel's event dispatcher
    pub async fn new(channel: CommandChannel, config: SessionConfig) -> Self {
        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));
        let router: Arc<dyn EventObserver> = Arc::new(SessionRouter {
            sessions: Arc::clone(&sessions),
        });
        let dispatcher = channel.dispatcher();
        let _: SubscriptionId = dispatcher
            .subscribe(EventTopic::Measurement, Arc::clone(&router))
            .await;
        let _: SubscriptionId = dispatcher.subscribe(EventTopic::WearCalibration, router).await;

        Self {
            channel,
            config,
            sessions,
        }
    }

    pub fn state(&self, kind: MeasurementKind) -> SessionState {
        self.state_of(SessionKey::Measurement(kind))
    }

    pub fn wear_calibration_state(&self) -> SessionState {
        self.state_of(SessionKey::WearCalibration)
    }

    fn state_of(&self, key: SessionKey) -> SessionState {
        lock_table(&self.sessions)
            .get(&key)
            .map(|e| e.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn last_sample(&self, kind: MeasurementKind) -> Option<MeasurementSample> {
        lock_table(&self.sessions)
            .get(&SessionKey::Measurement(kind))
            .and_then(|e| e.last_sample.clone())
    }

    fn begin(&self, key: SessionKey, observer: Option<Arc<dyn MeasurementObserver>>) -> Result<()> {
        let mut sessions = lock_table(&self.sessions);
        if sessions.contains_key(&key) {
            let name = match key {
                SessionKey::Measurement(kind) => kind.name().to_string(),
                SessionKey::WearCalibration => "wear calibration".to_string(),
            };
            return Err(BandError::SessionActive(name));
        }
        sessions.insert(
            key,
            SessionEntry {
                state: SessionState::Starting,
                last_sample: None,
                observer,
                calibration_result: None,
            },
        );
        Ok(())
    }

    /// Move `key` from `from` to `to`; false if the session was torn down meanwhile
    fn advance(&self, key: SessionKey, from: SessionState, to: SessionState) -> bool {
        let mut sessions = lock_table(&self.sessions);
        match sessions.get_mut(&key) {
            Some(entry) if entry.state == from => {
                entry.state = to;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, key: SessionKey) -> Option<SessionEntry> {
        lock_table(&self.sessions).remove(&key)
    }

    /// Start a measurement; resolves once the device has accepted it
    pub async fn start(
        &self,
        kind: MeasurementKind,
        observer: Arc<dyn MeasurementObserver>,
    ) -> Result<()> {
        let key = SessionKey::Measurement(kind);
        self.begin(key, Some(observer))?;
        info!("Starting {} measurement", kind);

        // Samples of other active kinds share the opcode; only our kind answers
        let request = Request::new(command::MEASUREMENT, vec![kind as u8, ACTION_START])
            .with_prefix(vec![kind as u8])
            .with_timeout(self.config.start_timeout());
        let result = match self.channel.submit(request).await {
            Ok(frame) => check_response(kind as u8, &frame),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if !self.advance(key, SessionState::Starting, SessionState::Active) {
                    return Err(BandError::Aborted);
                }
                debug!("{} measurement active", kind);
                Ok(())
            }
            Err(e) => {
                self.finish(key);
                let e = start_error(e);
                warn!("{} measurement did not start: {}", kind, e);
                Err(e)
            }
        }
    }

    /// Start a measurement that stops itself after `duration`
    pub async fn start_timed(
        &self,
        kind: MeasurementKind,
        observer: Arc<dyn MeasurementObserver>,
        duration: Duration,
    ) -> Result<()> {
        self.start(kind, observer).await?;
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if manager.state(kind) == SessionState::Active {
                if let Err(e) = manager.stop(kind).await {
                    warn!("Timed {} measurement did not stop cleanly: {}", kind, e);
                }
            }
        });
        Ok(())
    }

    /// Stop a measurement, sending the last sample as the final value
    ///
    /// The session is back to `Idle` when this returns, acknowledged or not.
    pub async fn stop(&self, kind: MeasurementKind) -> Result<Option<MeasurementSample>> {
        let key = SessionKey::Measurement(kind);
        let last_sample = {
            let mut sessions = lock_table(&self.sessions);
            match sessions.get_mut(&key) {
                None => return Ok(None),
                Some(entry) if entry.state != SessionState::Active => {
                    return Err(BandError::SessionActive(kind.name().to_string()));
                }
                Some(entry) => {
                    entry.state = SessionState::Stopping;
                    entry.last_sample.clone()
                }
            }
        };

        let mut payload = vec![kind as u8, ACTION_STOP];
        if let Some(sample) = &last_sample {
            payload.extend_from_slice(&sample.values);
        }
        let request = Request::new(command::MEASUREMENT, payload)
            .with_prefix(vec![kind as u8])
            .with_timeout(self.config.stop_timeout());
        let result = self.channel.submit(request).await;
        self.finish(key);
        info!("{} measurement stopped", kind);

        match result.and_then(|frame| check_response(kind as u8, &frame)) {
            Ok(()) => Ok(last_sample),
            Err(BandError::LinkLost) => Err(BandError::LinkLost),
            Err(e) => {
                warn!("{} stop not acknowledged: {}", kind, e);
                Err(BandError::Measurement(MeasurementError::EndFailed))
            }
        }
    }

    /// Run wear calibration until the device reports a result or `timeout` expires
    ///
    /// `None` uses the configured default.
    pub async fn calibrate_wear(&self, timeout: Option<Duration>) -> Result<()> {
        let key = SessionKey::WearCalibration;
        self.begin(key, None)?;
        let (result_tx, result_rx) = oneshot::channel();
        if let Some(entry) = lock_table(&self.sessions).get_mut(&key) {
            entry.calibration_result = Some(result_tx);
        }

        let request = Request::new(command::WEAR_CALIBRATION, vec![calibration::APP_START])
            .with_prefix(vec![calibration::APP_START])
            .with_timeout(self.config.start_timeout());
        let started = match self.channel.submit(request).await {
            Ok(frame) => check_response(calibration::APP_START, &frame),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.finish(key);
            return Err(start_error(e));
        }
        if !self.advance(key, SessionState::Starting, SessionState::Active) {
            return Err(BandError::Aborted);
        }

        let wait = timeout.unwrap_or_else(|| self.config.wear_calibration_timeout());
        info!("Wear calibration running (up to {:?})", wait);
        let outcome = tokio::time::timeout(wait, result_rx).await;

        let link_gone = matches!(outcome, Ok(Ok(Err(BandError::LinkLost))));
        if !link_gone && self.advance(key, SessionState::Active, SessionState::Stopping) {
            let end = Request::new(command::WEAR_CALIBRATION, vec![calibration::END])
                .with_prefix(vec![calibration::END])
                .with_timeout(self.config.stop_timeout());
            if let Err(e) = self.channel.submit(end).await {
                warn!("Wear calibration end not acknowledged: {}", e);
            }
        }
        self.finish(key);

        match outcome {
            Ok(Ok(Ok(0))) => {
                info!("Wear calibration succeeded");
                Ok(())
            }
            Ok(Ok(Ok(status))) => Err(BandError::Measurement(
                MeasurementError::from_status(status).unwrap_or(MeasurementError::StartFailed),
            )),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(BandError::Aborted),
            Err(_) => Err(BandError::NotifyTimeOut {
                opcode: command::WEAR_CALIBRATION,
            }),
        }
    }

    /// Stop a running wear calibration early
    pub fn cancel_wear_calibration(&self) -> bool {
        let waiter = lock_table(&self.sessions)
            .get_mut(&SessionKey::WearCalibration)
            .and_then(|e| e.calibration_result.take());
        match waiter {
            Some(waiter) => waiter.send(Err(BandError::Aborted)).is_ok(),
            None => false,
        }
    }

    /// Tear down every session, e.g. on link loss
    pub fn abort_all(&self, error: BandError) -> usize {
        let drained: Vec<(SessionKey, SessionEntry)> =
            lock_table(&self.sessions).drain().collect();
        let count = drained.len();
        for (key, mut entry) in drained {
            debug!("Aborting {:?} session in {:?}", key, entry.state);
            if let Some(waiter) = entry.calibration_result.take() {
                let _ = waiter.send(Err(clone_abort_error(&error)));
            }
            if entry.state == SessionState::Active {
                if let Some(observer) = entry.observer {
                    observer.on_error(&error);
                }
            }
        }
        count
    }
}

/// Check a `[id, status]` response
fn check_response(expected: u8, frame: &Frame) -> Result<()> {
    let payload = frame.payload();
    if payload.len() < 2 {
        return Err(BandError::WrongDataLength {
            declared: 2,
            actual: payload.len(),
        });
    }
    if payload[0] != expected {
        return Err(BandError::InvalidData(format!(
            "response for {} while waiting for {}",
            payload[0], expected
        )));
    }
    match MeasurementError::from_status(payload[1]) {
        None => Ok(()),
        Some(e) => Err(BandError::Measurement(e)),
    }
}

/// Everything but link loss, cancellation and device verdicts is a failed start
fn start_error(error: BandError) -> BandError {
    match error {
        BandError::Measurement(_) | BandError::LinkLost | BandError::Aborted => error,
        BandError::SessionActive(_) => error,
        _ => BandError::Measurement(MeasurementError::StartFailed),
    }
}

fn clone_abort_error(error: &BandError) -> BandError {
    match error {
        BandError::LinkLost => BandError::LinkLost,
        BandError::NotConnected => BandError::NotConnected,
        _ => BandError::Aborted,
    }
}
