//! Command channel
//!
//! Serializes requests over one link: at most one request is in flight, a second
//! submit fails with [`BandError::ChannelBusy`]. Incoming frames are matched against
//! the pending request by opcode, sequence number for sequenced opcodes, and an
//! optional payload prefix for opcodes shared by several request kinds; any other
//! frame goes to the [`EventDispatcher`]. A response that arrives after its
//! request timed out is recognised for a short window and dropped.

use crate::codec::{hex_dump, Decoded, Frame, FrameCodec};
use crate::config::ChannelConfig;
use crate::events::EventDispatcher;
use crate::transport::BleTransport;
use crate::types::{BandError, FileStatus, OperationStatus, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

/// How the first payload byte of a response is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusMode {
    /// The payload is returned as-is
    #[default]
    None,
    /// First byte is an [`OperationStatus`]
    Operation,
    /// First byte is a [`FileStatus`]
    File,
}

impl StatusMode {
    fn check(self, frame: Frame) -> Result<Frame> {
        if self == StatusMode::None {
            return Ok(frame);
        }
        let Some(&code) = frame.payload().first() else {
            return Err(BandError::WrongDataLength {
                declared: 1,
                actual: 0,
            });
        };
        match self {
            StatusMode::Operation => {
                let status = OperationStatus::from_u8(code)?;
                if !status.is_success() {
                    return Err(BandError::Device(status));
                }
            }
            StatusMode::File => {
                let status = FileStatus::from_u8(code)?;
                if !status.is_success() {
                    return Err(BandError::File(status));
                }
            }
            StatusMode::None => {}
        }
        Ok(frame)
    }
}

/// One outbound command
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: u8,
    pub sequence: Option<u16>,
    pub payload: Vec<u8>,
    /// Falls back to the channel default when unset
    pub timeout: Option<Duration>,
    pub status: StatusMode,
    /// Leading payload bytes a response must carry to match
    pub prefix: Vec<u8>,
}

impl Request {
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            sequence: None,
            payload,
            timeout: None,
            status: StatusMode::None,
            prefix: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_status(mut self, status: StatusMode) -> Self {
        self.status = status;
        self
    }

    /// Only accept responses whose payload starts with `prefix`
    pub fn with_prefix(mut self, prefix: Vec<u8>) -> Self {
        self.prefix = prefix;
        self
    }

    fn key(&self) -> ResponseKey {
        ResponseKey {
            opcode: self.opcode,
            sequence: self.sequence,
            prefix: self.prefix.clone(),
        }
    }

    fn frame(&self) -> Frame {
        match self.sequence {
            Some(seq) => Frame::with_sequence(self.opcode, seq, self.payload.clone()),
            None => Frame::new(self.opcode, self.payload.clone()),
        }
    }
}

/// Where an incoming frame ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Resolved the pending request
    Response,
    /// Late answer to a request that already timed out
    Stale,
    /// Handed to the event dispatcher, with the number of observers reached
    Event(usize),
}

/// What a response must look like to answer a request
#[derive(Debug, Clone)]
struct ResponseKey {
    opcode: u8,
    sequence: Option<u16>,
    prefix: Vec<u8>,
}

impl ResponseKey {
    fn matches(&self, frame: &Frame) -> bool {
        self.opcode == frame.opcode()
            && (self.sequence.is_none() || self.sequence == frame.sequence())
            && frame.payload().starts_with(&self.prefix)
    }
}

struct PendingRequest {
    id: u64,
    key: ResponseKey,
    issued_at: Instant,
    status: StatusMode,
    reply: oneshot::Sender<Result<Frame>>,
}

struct StaleEntry {
    key: ResponseKey,
    expires: Instant,
}

impl ChannelState {
    /// Drop the pending request `id`, remembering it as stale; false if it already left
    fn expire(&mut self, id: u64, stale_window: Duration) -> bool {
        if !self.pending.as_ref().is_some_and(|p| p.id == id) {
            return false;
        }
        if let Some(pending) = self.pending.take() {
            self.stale.push(StaleEntry {
                key: pending.key,
                expires: Instant::now() + stale_window,
            });
        }
        true
    }
}

/// Frees the slot when a submit future is dropped before it resolves
struct PendingGuard {
    state: Arc<Mutex<ChannelState>>,
    id: u64,
    stale_window: Duration,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        let stale_window = self.stale_window;
        if let Ok(mut state) = self.state.try_lock() {
            if state.expire(id, stale_window) {
                debug!("Request {} abandoned by its caller", id);
            }
            return;
        }
        let state = Arc::clone(&self.state);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if state.lock().await.expire(id, stale_window) {
                        debug!("Request {} abandoned by its caller", id);
                    }
                });
            }
            Err(_) => warn!("Request {} abandoned outside a runtime, slot left pending", id),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    pending: Option<PendingRequest>,
    stale: Vec<StaleEntry>,
}

/// Request/response correlation for one link
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<dyn BleTransport>,
    codec: Arc<Mutex<FrameCodec>>,
    dispatcher: EventDispatcher,
    state: Arc<Mutex<ChannelState>>,
    ready: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    config: ChannelConfig,
}

impl CommandChannel {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        codec: FrameCodec,
        dispatcher: EventDispatcher,
        config: ChannelConfig,
    ) -> Self {
        Self {
            transport,
            codec: Arc::new(Mutex::new(codec)),
            dispatcher,
            state: Arc::new(Mutex::new(ChannelState::default())),
            ready: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Mark the underlying link usable or not; submits fail with `NotConnected` while false
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    pub async fn chunk_size(&self) -> usize {
        self.codec.lock().await.chunk_size()
    }

    pub async fn set_chunk_size(&self, chunk_size: usize) -> Result<()> {
        self.codec.lock().await.set_chunk_size(chunk_size)
    }

    /// Opcode of the request currently in flight
    pub async fn pending_opcode(&self) -> Option<u8> {
        self.state.lock().await.pending.as_ref().map(|p| p.key.opcode)
    }

    /// Send a request and wait for its matching response
    pub async fn submit(&self, request: Request) -> Result<Frame> {
        if !self.is_ready() {
            return Err(BandError::NotConnected);
        }

        let timeout = request.timeout.unwrap_or_else(|| self.config.default_timeout());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, mut rx) = oneshot::channel();

        {
            let mut state = self.state.lock().await;
            if let Some(pending) = &state.pending {
                debug!(
                    "Rejecting {}: {} still pending",
                    crate::opcodes::name(request.opcode),
                    crate::opcodes::name(pending.key.opcode)
                );
                return Err(BandError::ChannelBusy {
                    pending: pending.key.opcode,
                });
            }
            state.pending = Some(PendingRequest {
                id,
                key: request.key(),
                issued_at: Instant::now(),
                status: request.status,
                reply,
            });
        }
        let mut guard = PendingGuard {
            state: Arc::clone(&self.state),
            id,
            stale_window: self.config.stale_window(),
            armed: true,
        };

        if let Err(e) = self.write_frame(&request.frame()).await {
            // The link may have failed the request while the write was under way
            if let Ok(result) = rx.try_recv() {
                guard.disarm();
                return result;
            }
            self.clear_pending(id).await;
            guard.disarm();
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(BandError::LinkLost)
            }
            Err(_) => {
                let mut state = self.state.lock().await;
                guard.disarm();
                if state.expire(id, self.config.stale_window()) {
                    warn!(
                        "{} timed out after {:?}",
                        crate::opcodes::name(request.opcode),
                        timeout
                    );
                    return Err(BandError::NotifyTimeOut {
                        opcode: request.opcode,
                    });
                }
                drop(state);
                // Resolved concurrently with the timer firing
                rx.try_recv().unwrap_or(Err(BandError::NotifyTimeOut {
                    opcode: request.opcode,
                }))
            }
        }
    }

    /// Encode and write a frame without registering a pending request
    ///
    /// Used for cumulatively acknowledged transfer packets.
    pub async fn send_unacknowledged(&self, frame: &Frame) -> Result<()> {
        if !self.is_ready() {
            return Err(BandError::NotConnected);
        }
        self.write_frame(frame).await
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let chunks = self.codec.lock().await.encode(frame)?;
        for chunk in &chunks {
            debug!("TX {}", hex_dump(chunk, 32));
            self.transport.write(chunk).await?;
        }
        Ok(())
    }

    async fn clear_pending(&self, id: u64) {
        let mut state = self.state.lock().await;
        if state.pending.as_ref().is_some_and(|p| p.id == id) {
            state.pending = None;
        }
    }

    /// Feed one notified chunk; returns where the completed frame went, if any
    pub async fn on_chunk(&self, chunk: &[u8]) -> Option<Routed> {
        let decoded = self.codec.lock().await.decode(chunk);
        match decoded {
            Ok(Decoded::Frame(frame)) => Some(self.route(frame).await),
            Ok(Decoded::Incomplete) => None,
            Err(e) => {
                warn!("Discarding frame: {} ({})", e, hex_dump(chunk, 16));
                // A broken frame carrying the pending opcode fails that request
                if let Some(&opcode) = chunk.first() {
                    let mut state = self.state.lock().await;
                    if state.pending.as_ref().is_some_and(|p| p.key.opcode == opcode) {
                        if let Some(pending) = state.pending.take() {
                            let _ = pending.reply.send(Err(e));
                        }
                    }
                }
                None
            }
        }
    }

    /// Match a complete frame against the pending request, or pass it on
    pub async fn route(&self, frame: Frame) -> Routed {
        let resolved = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.stale.retain(|s| s.expires > now);

            if state.pending.as_ref().is_some_and(|p| p.key.matches(&frame)) {
                state.pending.take()
            } else {
                let stale = state.stale.iter().position(|s| s.key.matches(&frame));
                if let Some(index) = stale {
                    state.stale.remove(index);
                    info!(
                        "Dropping late {} response: {}",
                        crate::opcodes::name(frame.opcode()),
                        hex_dump(frame.payload(), 16)
                    );
                    return Routed::Stale;
                }
                None
            }
        };

        match resolved {
            Some(pending) => {
                debug!(
                    "{} answered in {:?}",
                    crate::opcodes::name(pending.key.opcode),
                    pending.issued_at.elapsed()
                );
                let result = pending.status.check(frame);
                if pending.reply.send(result).is_err() {
                    debug!("Requester went away before the response arrived");
                }
                Routed::Response
            }
            None => Routed::Event(self.dispatcher.dispatch(&frame).await),
        }
    }

    /// Fail the pending request only if it carries `opcode`
    pub async fn cancel_pending(&self, opcode: u8, error: BandError) -> bool {
        let pending = {
            let mut state = self.state.lock().await;
            if state.pending.as_ref().is_some_and(|p| p.key.opcode == opcode) {
                state.pending.take()
            } else {
                None
            }
        };
        match pending {
            Some(pending) => {
                debug!("Cancelled pending {}", crate::opcodes::name(opcode));
                let _ = pending.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail the request in flight, e.g. with `LinkLost` when the link drops
    pub async fn fail_pending(&self, error: BandError) -> bool {
        let pending = {
            let mut state = self.state.lock().await;
            state.stale.clear();
            state.pending.take()
        };
        self.codec.lock().await.reset();

        match pending {
            Some(pending) => {
                info!(
                    "Failing pending {}: {}",
                    crate::opcodes::name(pending.key.opcode),
                    error
                );
                let _ = pending.reply.send(Err(error));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceEvent, EventObserver, EventTopic};
    use crate::mock::{MockDevice, MockTransport};
    use crate::opcodes::{command, dfu};

    fn channel_pair() -> (CommandChannel, MockDevice) {
        let (transport, device) = MockTransport::pair();
        let channel = CommandChannel::new(
            Arc::new(transport),
            FrameCodec::new(),
            EventDispatcher::new(),
            ChannelConfig::default(),
        );
        channel.set_ready(true);
        (channel, device)
    }

    async fn reply(channel: &CommandChannel, device: &MockDevice, frame: Frame) {
        for chunk in device.chunks_for(&frame).unwrap() {
            channel.on_chunk(&chunk).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_response_after_delay() {
        let (channel, mut device) = channel_pair();
        let responder = channel.clone();
        let device_task = tokio::spawn(async move {
            let request = device.next_frame().await.unwrap();
            assert_eq!(request.opcode(), command::BATTERY);
            tokio::time::sleep(Duration::from_millis(500)).await;
            reply(&responder, &device, Frame::new(command::BATTERY, vec![78, 0x01])).await;
        });

        let response = channel
            .submit(
                Request::new(command::BATTERY, vec![]).with_timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(response.payload(), &[78, 0x01]);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_not_ready_is_not_connected() {
        let (channel, _device) = channel_pair();
        channel.set_ready(false);
        assert!(matches!(
            channel.submit(Request::new(command::BATTERY, vec![])).await,
            Err(BandError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_submit_is_busy_and_first_still_completes() {
        let (channel, device) = channel_pair();
        let first = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(Request::new(command::BATTERY, vec![]))
                    .await
            })
        };
        tokio::task::yield_now().await;
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }

        let second = channel
            .submit(Request::new(command::FIND_DEVICE, vec![]))
            .await;
        assert!(matches!(
            second,
            Err(BandError::ChannelBusy {
                pending: command::BATTERY
            })
        ));

        reply(&channel, &device, Frame::new(command::BATTERY, vec![50, 0])).await;
        assert_eq!(first.await.unwrap().unwrap().payload(), &[50, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot_and_late_frame_is_stale() {
        let (channel, device) = channel_pair();
        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let observer: Arc<dyn EventObserver> = Arc::new(move |_: &DeviceEvent| {
            *counter.lock().unwrap() += 1;
        });
        channel
            .dispatcher()
            .subscribe(EventTopic::Battery, observer)
            .await;

        let result = channel
            .submit(
                Request::new(command::BATTERY, vec![]).with_timeout(Duration::from_millis(200)),
            )
            .await;
        assert!(matches!(
            result,
            Err(BandError::NotifyTimeOut {
                opcode: command::BATTERY
            })
        ));
        assert_eq!(channel.pending_opcode().await, None);

        // The late answer is swallowed rather than reported as a battery event
        let late = Frame::new(command::BATTERY, vec![10, 0]);
        let chunks = device.chunks_for(&late).unwrap();
        assert_eq!(channel.on_chunk(&chunks[0]).await, Some(Routed::Stale));
        assert_eq!(*seen.lock().unwrap(), 0);

        // A second identical frame is a genuine event
        assert_eq!(channel.on_chunk(&chunks[0]).await, Some(Routed::Event(1)));

        // The slot is usable again straight away
        let next = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(Request::new(command::FIND_DEVICE, vec![]))
                    .await
            })
        };
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }
        reply(&channel, &device, Frame::new(command::FIND_DEVICE, vec![])).await;
        assert!(next.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_expires() {
        let (channel, device) = channel_pair();
        let _ = channel
            .submit(
                Request::new(command::BATTERY, vec![]).with_timeout(Duration::from_millis(100)),
            )
            .await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        let chunks = device
            .chunks_for(&Frame::new(command::BATTERY, vec![10, 0]))
            .unwrap();
        assert_eq!(channel.on_chunk(&chunks[0]).await, Some(Routed::Event(0)));
    }

    #[tokio::test]
    async fn test_link_loss_fails_pending_immediately() {
        let (channel, _device) = channel_pair();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(
                        Request::new(command::BATTERY, vec![])
                            .with_timeout(Duration::from_secs(60)),
                    )
                    .await
            })
        };
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }

        assert!(channel.fail_pending(BandError::LinkLost).await);
        assert!(matches!(pending.await.unwrap(), Err(BandError::LinkLost)));
        assert!(!channel.fail_pending(BandError::LinkLost).await);
    }

    #[tokio::test]
    async fn test_operation_status_is_typed_failure() {
        let (channel, device) = channel_pair();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(
                        Request::new(dfu::INIT_PARAMETERS, vec![1])
                            .with_status(StatusMode::Operation),
                    )
                    .await
            })
        };
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }
        reply(&channel, &device, Frame::new(dfu::INIT_PARAMETERS, vec![6])).await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(BandError::Device(OperationStatus::NotEnoughPower))
        ));
    }

    #[tokio::test]
    async fn test_sequence_must_match() {
        let (channel, device) = channel_pair();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(
                        Request::new(dfu::RECEIVE_IMAGE, vec![0xAA; 4])
                            .with_sequence(5)
                            .with_status(StatusMode::Operation),
                    )
                    .await
            })
        };
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }

        let wrong = Frame::with_sequence(dfu::RECEIVE_IMAGE, 4, vec![0]);
        for chunk in device.chunks_for(&wrong).unwrap() {
            assert_eq!(channel.on_chunk(&chunk).await, Some(Routed::Event(0)));
        }
        assert_eq!(channel.pending_opcode().await, Some(dfu::RECEIVE_IMAGE));

        reply(
            &channel,
            &device,
            Frame::with_sequence(dfu::RECEIVE_IMAGE, 5, vec![0]),
        )
        .await;
        let frame = pending.await.unwrap().unwrap();
        assert_eq!(frame.sequence(), Some(5));
    }

    #[tokio::test]
    async fn test_corrupt_response_fails_request() {
        let (channel, device) = channel_pair();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(Request::new(command::BATTERY, vec![]))
                    .await
            })
        };
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }

        let mut chunks = device
            .chunks_for(&Frame::new(command::BATTERY, vec![78, 1]))
            .unwrap();
        chunks[0][3] ^= 0xFF;
        assert_eq!(channel.on_chunk(&chunks[0]).await, None);
        assert!(matches!(
            pending.await.unwrap(),
            Err(BandError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_failure_releases_slot() {
        let (transport, _device) = MockTransport::pair();
        transport.set_fail_writes(true);
        let channel = CommandChannel::new(
            Arc::new(transport),
            FrameCodec::new(),
            EventDispatcher::new(),
            ChannelConfig::default(),
        );
        channel.set_ready(true);

        assert!(matches!(
            channel.submit(Request::new(command::BATTERY, vec![])).await,
            Err(BandError::Bluetooth(_))
        ));
        assert_eq!(channel.pending_opcode().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_submit_frees_slot() {
        let (channel, device) = channel_pair();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            channel.submit(
                Request::new(command::BATTERY, vec![]).with_timeout(Duration::from_secs(60)),
            ),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(channel.pending_opcode().await, None);

        // The answer to the abandoned request does not leak out as an event
        let late = device
            .chunks_for(&Frame::new(command::BATTERY, vec![10, 0]))
            .unwrap();
        assert_eq!(channel.on_chunk(&late[0]).await, Some(Routed::Stale));

        let next = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(Request::new(command::FIND_DEVICE, vec![]))
                    .await
            })
        };
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }
        reply(&channel, &device, Frame::new(command::FIND_DEVICE, vec![])).await;
        assert!(next.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_prefix_must_match() {
        let (channel, device) = channel_pair();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .submit(
                        Request::new(command::MEASUREMENT, vec![1, 1]).with_prefix(vec![1]),
                    )
                    .await
            })
        };
        while channel.pending_opcode().await.is_none() {
            tokio::task::yield_now().await;
        }

        let other_kind = Frame::new(command::MEASUREMENT, vec![2, 0, 98]);
        for chunk in device.chunks_for(&other_kind).unwrap() {
            assert_eq!(channel.on_chunk(&chunk).await, Some(Routed::Event(0)));
        }
        assert_eq!(channel.pending_opcode().await, Some(command::MEASUREMENT));

        reply(&channel, &device, Frame::new(command::MEASUREMENT, vec![1, 0])).await;
        assert_eq!(pending.await.unwrap().unwrap().payload(), &[1, 0]);
    }
}
