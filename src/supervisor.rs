//! Connection supervisor
//!
//! Owns the link lifecycle:
//! - `Idle -> Scanning -> Idle` while discovering peripherals
//! - `Idle -> Connecting -> Ready` on connect
//! - `Ready -> Reconnecting` when the link drops, then back to `Ready` or on to
//!   `Disconnected` once the retry budget is spent
//! - any state `-> Disconnected` on an explicit disconnect, which also cancels any
//!   scan, connect or reconnect in progress
//!
//! It also tracks RX activity so a silent link can be detected and recycled.

use crate::config::{ReconnectConfig, ReconnectMode};
use crate::transport::{BleTransport, DiscoveredPeripheral, PeripheralId, SERVICE_UUID};
use crate::types::{BandError, Result};
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};

/// Lifecycle state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Ready,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Scanning => write!(f, "Scanning"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Ready => write!(f, "Ready"),
            LinkState::Reconnecting => write!(f, "Reconnecting"),
            LinkState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Reasons why a reconnection was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// The platform reported the link as gone
    ConnectionLost,
    /// No RX traffic within the configured timeout
    RxTimeout,
    /// Requested by the caller
    Manual,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectReason::ConnectionLost => write!(f, "Connection Lost"),
            ReconnectReason::RxTimeout => write!(f, "RX Timeout"),
            ReconnectReason::Manual => write!(f, "Manual"),
        }
    }
}

/// Health of the link as seen from RX activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Quiet for 90% of the RX timeout
    Degraded,
    /// Quiet for the whole RX timeout
    Unhealthy,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
            HealthStatus::Reconnecting => write!(f, "Reconnecting"),
            HealthStatus::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Receiver of link-state transitions
///
/// Called synchronously, in transition order. Must not register or remove
/// observers from inside the callback.
pub trait LinkObserver: Send + Sync {
    fn on_transition(&self, from: LinkState, to: LinkState);
}

impl<F> LinkObserver for F
where
    F: Fn(LinkState, LinkState) + Send + Sync,
{
    fn on_transition(&self, from: LinkState, to: LinkState) {
        self(from, to)
    }
}

/// Snapshot of the supervised link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkInfo {
    pub state: LinkState,
    pub peripheral: Option<PeripheralId>,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

type ReadyContinuation = Box<dyn FnOnce() + Send>;

struct SupervisorState {
    link: LinkState,
    peripheral: Option<PeripheralId>,
    /// Advertisement data from the most recent scans
    known: HashMap<PeripheralId, DiscoveredPeripheral>,
    /// Bumped by every explicit disconnect; stale flows compare against it
    generation: u64,
    ready_continuations: Vec<ReadyContinuation>,

    last_rx: Option<Instant>,
    connection_start: Option<Instant>,
    reconnect_attempts: u32,
    current_backoff: Duration,
    total_reconnects: u64,
    last_reconnect_reason: Option<ReconnectReason>,
}

impl SupervisorState {
    fn new(initial_backoff: Duration) -> Self {
        Self {
            link: LinkState::Idle,
            peripheral: None,
            known: HashMap::new(),
            generation: 0,
            ready_continuations: Vec::new(),
            last_rx: None,
            connection_start: None,
            reconnect_attempts: 0,
            current_backoff: initial_backoff,
            total_reconnects: 0,
            last_reconnect_reason: None,
        }
    }

    fn ensure_generation(&self, generation: u64) -> Result<()> {
        if self.generation != generation {
            return Err(BandError::Aborted);
        }
        Ok(())
    }

    fn mark_connected(&mut self) {
        let now = Instant::now();
        self.connection_start = Some(now);
        self.last_rx = Some(now);
    }
}

/// Clears the reconnect-running flag however the loop exits
struct ReconnectGuard(Arc<AtomicBool>);

impl Drop for ReconnectGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Link lifecycle owner for one physical link
#[derive(Clone)]
pub struct ConnectionSupervisor {
    transport: Arc<dyn BleTransport>,
    config: ReconnectConfig,
    state: Arc<Mutex<SupervisorState>>,
    observers: Arc<Mutex<Vec<(u64, Arc<dyn LinkObserver>)>>>,
    next_observer: Arc<AtomicU64>,
    cancel: Arc<watch::Sender<u64>>,
    reconnect_running: Arc<AtomicBool>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn BleTransport>, config: ReconnectConfig) -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            transport,
            state: Arc::new(Mutex::new(SupervisorState::new(config.initial_backoff()))),
            config,
            observers: Arc::new(Mutex::new(Vec::new())),
            next_observer: Arc::new(AtomicU64::new(1)),
            cancel: Arc::new(cancel),
            reconnect_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn state(&self) -> LinkState {
        self.state.lock().await.link
    }

    pub async fn info(&self) -> LinkInfo {
        let state = self.state.lock().await;
        let advert = state.peripheral.as_ref().and_then(|p| state.known.get(p));
        LinkInfo {
            state: state.link,
            peripheral: state.peripheral.clone(),
            name: advert.and_then(|a| a.name.clone()),
            rssi: advert.and_then(|a| a.rssi),
        }
    }

    /// Register a link-state observer; returns an id for [`Self::unobserve`]
    pub async fn observe(&self, observer: Arc<dyn LinkObserver>) -> u64 {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().await.push((id, observer));
        id
    }

    pub async fn unobserve(&self, id: u64) -> bool {
        let mut observers = self.observers.lock().await;
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Run `f` once on the next transition into `Ready`
    ///
    /// Dropped without running if the attempt ends in `Disconnected` instead.
    pub async fn on_next_ready(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().await.ready_continuations.push(Box::new(f));
    }

    /// Move to `to` if `guard` accepts the current state, then notify observers
    ///
    /// The observer lock is held across the state change so deliveries happen in
    /// transition order.
    async fn transition<F>(&self, to: LinkState, guard: F) -> Result<u64>
    where
        F: FnOnce(&mut SupervisorState) -> Result<()>,
    {
        let observers = self.observers.lock().await;
        let (from, generation, continuations) = {
            let mut state = self.state.lock().await;
            guard(&mut state)?;
            let from = state.link;
            state.link = to;
            let continuations = match to {
                LinkState::Ready => std::mem::take(&mut state.ready_continuations),
                LinkState::Disconnected => {
                    state.ready_continuations.clear();
                    Vec::new()
                }
                _ => Vec::new(),
            };
            (from, state.generation, continuations)
        };

        if from != to {
            info!("Link state: {} -> {}", from, to);
            for (_, observer) in observers.iter() {
                observer.on_transition(from, to);
            }
        }
        drop(observers);

        for continuation in continuations {
            continuation();
        }
        Ok(generation)
    }

    /// Scan for `duration`, reporting each peripheral once
    pub async fn scan<F>(
        &self,
        service_filters: &[String],
        duration: Duration,
        on_found: F,
    ) -> Result<Vec<DiscoveredPeripheral>>
    where
        F: FnMut(&DiscoveredPeripheral) + Send,
    {
        self.scan_until(service_filters, duration, on_found, |_| false)
            .await
    }

    async fn scan_until<F, S>(
        &self,
        service_filters: &[String],
        duration: Duration,
        mut on_found: F,
        stop: S,
    ) -> Result<Vec<DiscoveredPeripheral>>
    where
        F: FnMut(&DiscoveredPeripheral) + Send,
        S: Fn(&DiscoveredPeripheral) -> bool + Send,
    {
        let mut cancel = self.cancel.subscribe();
        let generation = self
            .transition(LinkState::Scanning, |s| match s.link {
                LinkState::Idle | LinkState::Disconnected => Ok(()),
                other => Err(BandError::LinkBusy(format!("link is {}", other))),
            })
            .await?;

        let mut stream = match self.transport.scan(service_filters).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self
                    .transition(LinkState::Idle, |s| s.ensure_generation(generation))
                    .await;
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let deadline = sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = cancel.changed() => {
                    debug!("Scan cancelled");
                    break;
                }
                next = stream.next() => match next {
                    Some(peripheral) => {
                        if !seen.insert(peripheral.id.clone()) {
                            continue;
                        }
                        debug!("Discovered {} ({:?}, rssi {:?})", peripheral.id, peripheral.name, peripheral.rssi);
                        on_found(&peripheral);
                        let done = stop(&peripheral);
                        found.push(peripheral);
                        if done {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        {
            let mut state = self.state.lock().await;
            for peripheral in &found {
                state.known.insert(peripheral.id.clone(), peripheral.clone());
            }
        }
        let _ = self
            .transition(LinkState::Idle, |s| s.ensure_generation(generation))
            .await;

        Ok(found)
    }

    async fn connect_once(&self, peripheral: &PeripheralId) -> Result<()> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.transport.connect(peripheral, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(BandError::ConnectTimeout(timeout)),
        }
    }

    /// Connect to a peripheral; fails with `LinkBusy` if a link is already active
    pub async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let mut cancel = self.cancel.subscribe();
        let initial_backoff = self.config.initial_backoff();
        let generation = self
            .transition(LinkState::Connecting, |s| match s.link {
                LinkState::Idle | LinkState::Disconnected => {
                    s.peripheral = Some(peripheral.clone());
                    s.reconnect_attempts = 0;
                    s.current_backoff = initial_backoff;
                    Ok(())
                }
                other => Err(BandError::LinkBusy(format!(
                    "link is {} ({})",
                    other,
                    s.peripheral
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_default()
                ))),
            })
            .await?;

        info!("Connecting to {}", peripheral);
        let result = tokio::select! {
            _ = cancel.changed() => Err(BandError::Aborted),
            r = self.connect_once(peripheral) => r,
        };

        match result {
            Ok(()) => {
                let ready = self
                    .transition(LinkState::Ready, |s| {
                        s.ensure_generation(generation)?;
                        s.mark_connected();
                        Ok(())
                    })
                    .await;
                if ready.is_err() {
                    // Disconnected while the platform was still connecting
                    let _ = self.transport.disconnect(peripheral).await;
                    return Err(BandError::Aborted);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", peripheral, e);
                let _ = self
                    .transition(LinkState::Disconnected, |s| s.ensure_generation(generation))
                    .await;
                Err(e)
            }
        }
    }

    /// Scan for a peripheral advertising `name` and connect to it
    pub async fn connect_by_name(&self, name: &str, scan_timeout: Duration) -> Result<()> {
        let filters = [SERVICE_UUID.to_string()];
        let found = self
            .scan_until(&filters, scan_timeout, |_| {}, |p| p.name.as_deref() == Some(name))
            .await?;
        let target = found
            .into_iter()
            .find(|p| p.name.as_deref() == Some(name))
            .ok_or(BandError::ConnectTimeout(scan_timeout))?;
        self.connect(&target.id).await
    }

    /// Tear the link down; always honored, cancelling any flow in progress
    pub async fn disconnect(&self) -> Result<()> {
        let peripheral = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            self.cancel.send_replace(state.generation);
            state.connection_start = None;
            state.peripheral.clone()
        };
        self.transition(LinkState::Disconnected, |_| Ok(())).await?;

        if let Some(peripheral) = peripheral {
            if let Err(e) = self.transport.disconnect(&peripheral).await {
                warn!("Platform disconnect of {} failed: {}", peripheral, e);
            }
        }
        Ok(())
    }

    /// Involuntary loss of a ready link: move to `Reconnecting`
    ///
    /// Returns the generation to hand to [`Self::resume`], or `None` if the link
    /// was not ready.
    pub async fn link_lost(&self, reason: ReconnectReason) -> Option<u64> {
        let generation = self
            .transition(LinkState::Reconnecting, |s| {
                if s.link != LinkState::Ready {
                    return Err(BandError::NotConnected);
                }
                s.connection_start = None;
                s.last_reconnect_reason = Some(reason);
                s.total_reconnects += 1;
                Ok(())
            })
            .await
            .ok()?;
        warn!("Link lost: {}", reason);
        Some(generation)
    }

    /// Continue a reconnect started by [`Self::link_lost`] using the configured mode
    pub async fn resume(&self, generation: u64) -> Result<()> {
        self.run_reconnect(self.budget(), Some(generation)).await
    }

    /// Reconnect using the configured mode
    pub async fn reconnect(&self) -> Result<()> {
        self.run_reconnect(self.budget(), None).await
    }

    /// Reconnect until `max_attempts` attempts or `deadline` have been used up
    pub async fn reconnect_bounded(&self, max_attempts: u32, deadline: Duration) -> Result<()> {
        self.run_reconnect(Some((max_attempts, deadline)), None)
            .await
    }

    /// Reconnect until it succeeds or [`Self::disconnect`] is called
    pub async fn reconnect_unbounded(&self) -> Result<()> {
        self.run_reconnect(None, None).await
    }

    fn budget(&self) -> Option<(u32, Duration)> {
        match self.config.mode {
            ReconnectMode::Bounded => Some((self.config.max_attempts, self.config.deadline())),
            ReconnectMode::Unbounded => None,
        }
    }

    async fn run_reconnect(
        &self,
        budget: Option<(u32, Duration)>,
        expected_generation: Option<u64>,
    ) -> Result<()> {
        if self
            .reconnect_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BandError::LinkBusy("reconnect already running".to_string()));
        }
        let _running = ReconnectGuard(Arc::clone(&self.reconnect_running));

        let mut cancel = self.cancel.subscribe();
        let generation = self
            .transition(LinkState::Reconnecting, |s| {
                if let Some(expected) = expected_generation {
                    s.ensure_generation(expected)?;
                }
                match (s.link, &s.peripheral) {
                    (_, None) => Err(BandError::NotConnected),
                    (
                        LinkState::Reconnecting | LinkState::Disconnected | LinkState::Idle,
                        Some(_),
                    ) => {
                        if s.last_reconnect_reason.is_none() || s.link != LinkState::Reconnecting {
                            s.last_reconnect_reason = Some(ReconnectReason::Manual);
                        }
                        Ok(())
                    }
                    (other, Some(_)) => Err(BandError::LinkBusy(format!("link is {}", other))),
                }
            })
            .await?;

        let peripheral = self
            .state
            .lock()
            .await
            .peripheral
            .clone()
            .ok_or(BandError::NotConnected)?;

        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            let mut backoff = self.get_and_advance_backoff().await;
            if let Some((max_attempts, deadline)) = budget {
                let elapsed = started.elapsed();
                if attempts >= max_attempts || elapsed >= deadline {
                    warn!(
                        "Giving up on {} after {} attempts ({:?})",
                        peripheral, attempts, elapsed
                    );
                    let _ = self
                        .transition(LinkState::Disconnected, |s| s.ensure_generation(generation))
                        .await;
                    return Err(BandError::ReconnectExhausted { attempts });
                }
                backoff = backoff.min(deadline - elapsed);
            }

            attempts += 1;
            self.state.lock().await.reconnect_attempts += 1;
            match budget {
                Some((max_attempts, _)) => info!(
                    "Reconnecting to {} (attempt {}/{}) in {:?}",
                    peripheral, attempts, max_attempts, backoff
                ),
                None => info!(
                    "Reconnecting to {} (attempt {}) in {:?}",
                    peripheral, attempts, backoff
                ),
            }

            let result = tokio::select! {
                _ = cancel.changed() => {
                    info!("Reconnect to {} cancelled", peripheral);
                    return Err(BandError::Aborted);
                }
                r = async {
                    sleep(backoff).await;
                    self.connect_once(&peripheral).await
                } => r,
            };

            match result {
                Ok(()) => {
                    let initial_backoff = self.config.initial_backoff();
                    let ready = self
                        .transition(LinkState::Ready, |s| {
                            s.ensure_generation(generation)?;
                            s.mark_connected();
                            s.reconnect_attempts = 0;
                            s.current_backoff = initial_backoff;
                            Ok(())
                        })
                        .await;
                    if ready.is_err() {
                        let _ = self.transport.disconnect(&peripheral).await;
                        return Err(BandError::Aborted);
                    }
                    info!("Reconnected to {} after {} attempt(s)", peripheral, attempts);
                    return Ok(());
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempts, e),
            }
        }
    }

    /// Get the current backoff duration and advance to the next one
    pub async fn get_and_advance_backoff(&self) -> Duration {
        let mut state = self.state.lock().await;
        let current = state.current_backoff;
        state.current_backoff = Duration::from_secs_f64(
            (current.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_backoff().as_secs_f64()),
        );
        current
    }

    /// Record that a notification was received
    pub async fn record_rx(&self) {
        self.state.lock().await.last_rx = Some(Instant::now());
    }

    pub async fn check_health(&self) -> HealthStatus {
        let state = self.state.lock().await;
        match state.link {
            LinkState::Ready => {}
            LinkState::Reconnecting => return HealthStatus::Reconnecting,
            _ => return HealthStatus::Disconnected,
        }

        let rx_timeout = self.config.rx_timeout();
        match state.last_rx.map(|t| t.elapsed()) {
            Some(elapsed) if elapsed >= rx_timeout => HealthStatus::Unhealthy,
            Some(elapsed) if elapsed >= rx_timeout * 9 / 10 => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }

    pub async fn metrics(&self) -> SupervisorMetrics {
        let health = self.check_health().await;
        let state = self.state.lock().await;
        SupervisorMetrics {
            state: state.link,
            health,
            uptime: state.connection_start.map(|t| t.elapsed()),
            last_rx_elapsed: state.last_rx.map(|t| t.elapsed()),
            reconnect_attempts: state.reconnect_attempts,
            total_reconnects: state.total_reconnects,
            last_reconnect_reason: state.last_reconnect_reason,
            current_backoff: state.current_backoff,
        }
    }
}

/// Link diagnostics
#[derive(Debug, Clone)]
pub struct SupervisorMetrics {
    pub state: LinkState,
    pub health: HealthStatus,
    pub uptime: Option<Duration>,
    pub last_rx_elapsed: Option<Duration>,
    pub reconnect_attempts: u32,
    pub total_reconnects: u64,
    pub last_reconnect_reason: Option<ReconnectReason>,
    pub current_backoff: Duration,
}

impl fmt::Display for SupervisorMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Link Metrics:")?;
        writeln!(f, "  State: {} ({})", self.state, self.health)?;
        writeln!(f, "  Uptime: {:?}", self.uptime)?;
        writeln!(f, "  Last RX: {:?} ago", self.last_rx_elapsed)?;
        writeln!(f, "  Reconnect Attempts: {}", self.reconnect_attempts)?;
        writeln!(f, "  Total Reconnects: {}", self.total_reconnects)?;
        writeln!(
            f,
            "  Last Reconnect Reason: {:?}",
            self.last_reconnect_reason
        )?;
        writeln!(f, "  Current Backoff: {:?}", self.current_backoff)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use std::sync::Mutex as StdMutex;

    fn supervisor(config: ReconnectConfig) -> (ConnectionSupervisor, MockTransport) {
        let (transport, _device) = MockTransport::pair();
        let supervisor = ConnectionSupervisor::new(Arc::new(transport.clone()), config);
        (supervisor, transport)
    }

    async fn record_transitions(
        supervisor: &ConnectionSupervisor,
    ) -> Arc<StdMutex<Vec<(LinkState, LinkState)>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        supervisor
            .observe(Arc::new(move |from: LinkState, to: LinkState| {
                sink.lock().unwrap().push((from, to));
            }))
            .await;
        seen
    }

    fn advert(id: &str, name: &str) -> DiscoveredPeripheral {
        DiscoveredPeripheral {
            id: PeripheralId::new(id),
            name: Some(name.to_string()),
            rssi: Some(-60),
        }
    }

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let (supervisor, transport) = supervisor(ReconnectConfig::default());
        let seen = record_transitions(&supervisor).await;

        supervisor.connect(&PeripheralId::new("AA:BB")).await.unwrap();
        assert_eq!(supervisor.state().await, LinkState::Ready);
        assert_eq!(
            transport.connected_peripheral().await,
            Some(PeripheralId::new("AA:BB"))
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (LinkState::Idle, LinkState::Connecting),
                (LinkState::Connecting, LinkState::Ready)
            ]
        );
    }

    #[tokio::test]
    async fn test_single_link_policy() {
        let (supervisor, _transport) = supervisor(ReconnectConfig::default());
        supervisor.connect(&PeripheralId::new("AA:BB")).await.unwrap();

        assert!(matches!(
            supervisor.connect(&PeripheralId::new("CC:DD")).await,
            Err(BandError::LinkBusy(_))
        ));
        assert_eq!(
            supervisor.info().await.peripheral,
            Some(PeripheralId::new("AA:BB"))
        );
    }

    #[tokio::test]
    async fn test_failed_connect_ends_disconnected() {
        let (supervisor, transport) = supervisor(ReconnectConfig::default());
        transport
            .fail_next_connects(vec![BandError::Bluetooth("refused".to_string())])
            .await;

        assert!(supervisor.connect(&PeripheralId::new("AA:BB")).await.is_err());
        assert_eq!(supervisor.state().await, LinkState::Disconnected);

        // A fresh attempt is allowed afterwards
        supervisor.connect(&PeripheralId::new("AA:BB")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_deduplicates() {
        let (supervisor, transport) = supervisor(ReconnectConfig::default());
        transport
            .set_advertisements(vec![
                advert("AA", "Ring"),
                advert("BB", "Band"),
                advert("AA", "Ring"),
            ])
            .await;

        let mut reported = Vec::new();
        let found = supervisor
            .scan(&[], Duration::from_secs(1), |p| reported.push(p.id.clone()))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(reported, vec![PeripheralId::new("AA"), PeripheralId::new("BB")]);
        assert_eq!(supervisor.state().await, LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_by_name_uses_scan_metadata() {
        let (supervisor, transport) = supervisor(ReconnectConfig::default());
        transport
            .set_advertisements(vec![advert("AA", "Ring"), advert("BB", "Band")])
            .await;

        supervisor
            .connect_by_name("Band", Duration::from_secs(5))
            .await
            .unwrap();
        let info = supervisor.info().await;
        assert_eq!(info.peripheral, Some(PeripheralId::new("BB")));
        assert_eq!(info.name.as_deref(), Some("Band"));
        assert_eq!(info.rssi, Some(-60));

        supervisor.disconnect().await.unwrap();
        assert!(matches!(
            supervisor
                .connect_by_name("Missing", Duration::from_secs(5))
                .await,
            Err(BandError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_continuation_fires_once() {
        let (supervisor, _transport) = supervisor(ReconnectConfig::default());
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        supervisor
            .on_next_ready(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        supervisor.connect(&PeripheralId::new("AA")).await.unwrap();
        supervisor.disconnect().await.unwrap();
        supervisor.connect(&PeripheralId::new("AA")).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_reconnect_exhausts() {
        let mut config = ReconnectConfig::default();
        config.max_attempts = 3;
        let (supervisor, transport) = supervisor(config);
        supervisor.connect(&PeripheralId::new("AA")).await.unwrap();

        transport
            .fail_next_connects(
                (0..3)
                    .map(|_| BandError::Bluetooth("out of range".to_string()))
                    .collect(),
            )
            .await;
        let generation = supervisor
            .link_lost(ReconnectReason::ConnectionLost)
            .await
            .unwrap();
        assert_eq!(supervisor.state().await, LinkState::Reconnecting);

        assert!(matches!(
            supervisor.resume(generation).await,
            Err(BandError::ReconnectExhausted { attempts: 3 })
        ));
        assert_eq!(supervisor.state().await, LinkState::Disconnected);
        assert_eq!(transport.connect_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers() {
        let (supervisor, transport) = supervisor(ReconnectConfig::default());
        supervisor.connect(&PeripheralId::new("AA")).await.unwrap();
        let seen = record_transitions(&supervisor).await;

        transport
            .fail_next_connects(vec![
                BandError::Bluetooth("busy".to_string()),
                BandError::Bluetooth("busy".to_string()),
            ])
            .await;
        let generation = supervisor
            .link_lost(ReconnectReason::ConnectionLost)
            .await
            .unwrap();
        supervisor.resume(generation).await.unwrap();

        assert_eq!(supervisor.state().await, LinkState::Ready);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (LinkState::Ready, LinkState::Reconnecting),
                (LinkState::Reconnecting, LinkState::Ready)
            ]
        );
        let metrics = supervisor.metrics().await;
        assert_eq!(metrics.total_reconnects, 1);
        assert_eq!(metrics.reconnect_attempts, 0);
        assert_eq!(
            metrics.last_reconnect_reason,
            Some(ReconnectReason::ConnectionLost)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_reconnect_cancelled_by_disconnect() {
        let (supervisor, transport) = supervisor(ReconnectConfig::default());
        supervisor.connect(&PeripheralId::new("AA")).await.unwrap();
        transport
            .fail_next_connects(
                (0..1000)
                    .map(|_| BandError::Bluetooth("gone".to_string()))
                    .collect(),
            )
            .await;
        supervisor
            .link_lost(ReconnectReason::ConnectionLost)
            .await
            .unwrap();

        let task = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.reconnect_unbounded().await })
        };
        sleep(Duration::from_secs(120)).await;
        assert_eq!(supervisor.state().await, LinkState::Reconnecting);

        supervisor.disconnect().await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(BandError::Aborted)));
        assert_eq!(supervisor.state().await, LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_disconnect_is_refused() {
        let (supervisor, _transport) = supervisor(ReconnectConfig::default());
        supervisor.connect(&PeripheralId::new("AA")).await.unwrap();
        let generation = supervisor
            .link_lost(ReconnectReason::ConnectionLost)
            .await
            .unwrap();
        supervisor.disconnect().await.unwrap();

        assert!(matches!(
            supervisor.resume(generation).await,
            Err(BandError::Aborted)
        ));
        assert_eq!(supervisor.state().await, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_backoff() {
        let (supervisor, _transport) = supervisor(ReconnectConfig::default());
        assert_eq!(
            supervisor.get_and_advance_backoff().await,
            Duration::from_secs(1)
        );
        assert_eq!(
            supervisor.get_and_advance_backoff().await,
            Duration::from_secs(2)
        );
        assert_eq!(
            supervisor.get_and_advance_backoff().await,
            Duration::from_secs(4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tracks_rx() {
        let mut config = ReconnectConfig::default();
        config.rx_timeout_ms = 1000;
        let (supervisor, _transport) = supervisor(config);
        assert_eq!(supervisor.check_health().await, HealthStatus::Disconnected);

        supervisor.connect(&PeripheralId::new("AA")).await.unwrap();
        assert_eq!(supervisor.check_health().await, HealthStatus::Healthy);

        sleep(Duration::from_millis(950)).await;
        assert_eq!(supervisor.check_health().await, HealthStatus::Degraded);

        supervisor.record_rx().await;
        assert_eq!(supervisor.check_health().await, HealthStatus::Healthy);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(supervisor.check_health().await, HealthStatus::Unhealthy);
    }
}
