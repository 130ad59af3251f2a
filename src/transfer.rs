//! Chunked transfer engine
//!
//! Moves large blobs (firmware, watch faces, UI resources, images, contact lists)
//! over the command channel as `init -> stream -> validate`. Each job lives in a
//! registry keyed by id until it completes, fails or is aborted.
//!
//! Progress counts acknowledged bytes only. The final chunk is credited once the
//! device has validated the blob (and activated it, when asked to), so `bytes_sent == total_bytes` holds exactly when
//! the job completed.

use crate::channel::{CommandChannel, Request, StatusMode};
use crate::checksum::Crc16Arc;
use crate::codec::{Frame, CHUNK_HEADER_LEN};
use crate::commands::{ActivateFirmware, Command};
use crate::config::TransferConfig;
use crate::opcodes::dfu;
use crate::types::{BandError, FileInitOp, FirmwareType, ResourceType, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sequence prefix plus checksum that every packet frame carries besides its data
const PACKET_OVERHEAD: usize = 2 + 2;

/// Packet sequence numbers are u16 on the wire
const MAX_PACKETS: usize = u16::MAX as usize + 1;

const RUNNING: u8 = 0;
const ABORTED: u8 = 1;
const LINK_LOST: u8 = 2;

/// Why a job was told to stop; the first reason sticks
#[derive(Default)]
struct CancelFlag(AtomicU8);

impl CancelFlag {
    fn raise(&self, error: &BandError) {
        let reason = match error {
            BandError::LinkLost => LINK_LOST,
            _ => ABORTED,
        };
        let _ = self
            .0
            .compare_exchange(RUNNING, reason, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn error(&self) -> Option<BandError> {
        match self.0.load(Ordering::SeqCst) {
            RUNNING => None,
            LINK_LOST => Some(BandError::LinkLost),
            _ => Some(BandError::Aborted),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Firmware,
    DialFile,
    Resource,
    Contacts,
    Image,
}

impl TransferKind {
    pub fn init_opcode(self) -> u8 {
        match self {
            TransferKind::Firmware => dfu::INIT_PARAMETERS,
            TransferKind::DialFile => dfu::DIAL_FILE_INIT,
            TransferKind::Resource => dfu::INIT_RESOURCE,
            TransferKind::Contacts => dfu::CONTACTS,
            TransferKind::Image => dfu::FILE_INIT,
        }
    }

    pub fn packet_opcode(self) -> u8 {
        match self {
            TransferKind::Firmware => dfu::RECEIVE_IMAGE,
            TransferKind::DialFile => dfu::DIAL_FILE_PACKET,
            TransferKind::Resource => dfu::RECEIVE_RESOURCE,
            TransferKind::Contacts => dfu::LONG_CONTACTS,
            TransferKind::Image => dfu::FILE_PACKET,
        }
    }

    pub fn validate_opcode(self) -> u8 {
        match self {
            TransferKind::Firmware => dfu::VALIDATE,
            TransferKind::DialFile => dfu::DIAL_FILE_CHECK,
            TransferKind::Resource => dfu::VALIDATE_RESOURCE,
            TransferKind::Contacts => dfu::CONTACTS,
            TransferKind::Image => dfu::FILE_CHECK,
        }
    }

    /// The missing-file protocol reports [`crate::types::FileStatus`], the rest
    /// [`crate::types::OperationStatus`]
    pub fn status_mode(self) -> StatusMode {
        match self {
            TransferKind::Image => StatusMode::File,
            _ => StatusMode::Operation,
        }
    }

    /// First byte of the init request unless overridden on the job
    pub fn default_tag(self) -> u8 {
        match self {
            TransferKind::Firmware => FirmwareType::Application as u8,
            TransferKind::Resource => ResourceType::Image as u8,
            TransferKind::Image => FileInitOp::Add as u8,
            TransferKind::DialFile | TransferKind::Contacts => 0,
        }
    }

    /// Contact lists are streamed without per-packet replies
    pub fn default_ack(self, window: usize) -> AckMode {
        match self {
            TransferKind::Contacts => AckMode::Windowed(window),
            _ => AckMode::PerChunk,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Firmware => write!(f, "firmware"),
            TransferKind::DialFile => write!(f, "dial file"),
            TransferKind::Resource => write!(f, "resource"),
            TransferKind::Contacts => write!(f, "contacts"),
            TransferKind::Image => write!(f, "image"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    Streaming,
    Validating,
    Completed,
    Failed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Aborted
        )
    }
}

/// How streamed packets are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Every packet is a request with its own response
    PerChunk,
    /// Packets are written back to back; the last of every `n` is acknowledged
    /// for all of them
    Windowed(usize),
}

/// A blob to upload
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub kind: TransferKind,
    pub name: String,
    pub data: Vec<u8>,
    /// Data bytes per packet; derived from the codec chunk size when unset
    pub chunk_size: Option<usize>,
    pub ack: Option<AckMode>,
    pub tag: Option<u8>,
    /// Firmware only: activate and reset after validation
    pub activate: bool,
}

impl TransferJob {
    pub fn new(kind: TransferKind, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind,
            name: name.into(),
            data,
            chunk_size: None,
            ack: None,
            tag: None,
            activate: false,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_ack(mut self, ack: AckMode) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn with_tag(mut self, tag: u8) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn with_activation(mut self) -> Self {
        self.activate = true;
        self
    }

    fn init_payload(&self, tag: u8, chunk_size: usize) -> Result<Vec<u8>> {
        let total = u32::try_from(self.data.len())
            .map_err(|_| BandError::PayloadTooLarge(self.data.len()))?;
        let chunk = u16::try_from(chunk_size).map_err(|_| {
            BandError::InvalidParameter(format!("chunk size {} does not fit u16", chunk_size))
        })?;
        let name = self.name.as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_| {
            BandError::InvalidParameter(format!("name is {} bytes, at most 255", name.len()))
        })?;

        let mut payload = Vec::with_capacity(10 + name.len());
        payload.push(tag);
        payload.extend_from_slice(&total.to_le_bytes());
        payload.extend_from_slice(&chunk.to_le_bytes());
        payload.extend_from_slice(&Crc16Arc::digest(&self.data).to_le_bytes());
        payload.push(name_len);
        payload.extend_from_slice(name);
        Ok(payload)
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub id: u32,
    pub kind: TransferKind,
    pub name: String,
    pub total_bytes: usize,
    pub chunk_size: usize,
    pub bytes_sent: usize,
    pub state: TransferState,
}

impl TransferSnapshot {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        ((self.bytes_sent * 100) / self.total_bytes) as u8
    }
}

/// Outcome of a completed job
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub id: u32,
    pub kind: TransferKind,
    pub name: String,
    pub total_bytes: usize,
    pub elapsed: Duration,
}

/// Transfer callbacks
///
/// `on_start`, `on_success` and `on_failed` fire at most once per job and exactly
/// one of the last two fires. `on_progress` never fires after either of them.
pub trait TransferObserver: Send + Sync {
    fn on_start(&self, _job: &TransferSnapshot) {}
    fn on_progress(&self, _percent: u8, _bytes_sent: usize, _total_bytes: usize) {}
    fn on_success(&self, _elapsed: Duration) {}
    fn on_failed(&self, _error: &BandError) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

struct JobEntry {
    status: Arc<Mutex<TransferSnapshot>>,
    cancel: Arc<CancelFlag>,
    /// Opcode of the request the job is waiting on, if any
    in_flight: Arc<Mutex<Option<u8>>>,
}

/// Handle to a running job
pub struct TransferHandle {
    id: u32,
    status: Arc<Mutex<TransferSnapshot>>,
    task: JoinHandle<Result<TransferReport>>,
}

impl TransferHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn snapshot(&self) -> TransferSnapshot {
        self.status.lock().await.clone()
    }

    /// Wait for the job to finish
    pub async fn wait(self) -> Result<TransferReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Transfer task {} ended abnormally: {}", self.id, e);
                Err(BandError::Aborted)
            }
        }
    }
}

/// Runs transfer jobs over one command channel
#[derive(Clone)]
pub struct TransferEngine {
    channel: CommandChannel,
    config: TransferConfig,
    jobs: Arc<Mutex<HashMap<u32, JobEntry>>>,
    next_id: Arc<AtomicU32>,
}

impl TransferEngine {
    pub fn new(channel: CommandChannel, config: TransferConfig) -> Self {
        Self {
            channel,
            config,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Register a job and run it in the background
    pub async fn start(
        &self,
        job: TransferJob,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<TransferHandle> {
        if job.data.is_empty() {
            return Err(BandError::InvalidParameter(format!(
                "{} '{}' has no data",
                job.kind, job.name
            )));
        }

        let chunk_size = match job.chunk_size {
            Some(size) => size,
            None => self
                .channel
                .chunk_size()
                .await
                .saturating_sub(CHUNK_HEADER_LEN + PACKET_OVERHEAD),
        };
        if chunk_size == 0 {
            return Err(BandError::InvalidParameter(
                "transfer chunk size must be non-zero".to_string(),
            ));
        }
        if let Some(AckMode::Windowed(0)) = job.ack {
            return Err(BandError::InvalidParameter(
                "ack window must be at least 1".to_string(),
            ));
        }
        if job.data.len().div_ceil(chunk_size) > MAX_PACKETS {
            return Err(BandError::PayloadTooLarge(job.data.len()));
        }
        let tag = job.tag.unwrap_or_else(|| job.kind.default_tag());
        let init_payload = job.init_payload(tag, chunk_size)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let status = Arc::new(Mutex::new(TransferSnapshot {
            id,
            kind: job.kind,
            name: job.name.clone(),
            total_bytes: job.data.len(),
            chunk_size,
            bytes_sent: 0,
            state: TransferState::Init,
        }));
        let cancel = Arc::new(CancelFlag::default());
        let in_flight = Arc::new(Mutex::new(None));

        self.jobs.lock().await.insert(
            id,
            JobEntry {
                status: Arc::clone(&status),
                cancel: Arc::clone(&cancel),
                in_flight: Arc::clone(&in_flight),
            },
        );
        info!(
            "Registered {} transfer {}: '{}', {} bytes in {} byte packets",
            job.kind,
            id,
            job.name,
            job.data.len(),
            chunk_size
        );

        let runner = JobRunner {
            id,
            channel: self.channel.clone(),
            config: self.config.clone(),
            ack: job.ack.unwrap_or_else(|| job.kind.default_ack(self.config.window)),
            job,
            init_payload,
            status: Arc::clone(&status),
            cancel,
            in_flight,
            observer,
        };
        let jobs = Arc::clone(&self.jobs);
        let task = tokio::spawn(async move {
            let result = runner.run().await;
            jobs.lock().await.remove(&id);
            result
        });

        Ok(TransferHandle { id, status, task })
    }

    /// Run a job to completion
    pub async fn run(
        &self,
        job: TransferJob,
        observer: Arc<dyn TransferObserver>,
    ) -> Result<TransferReport> {
        self.start(job, observer).await?.wait().await
    }

    /// Abort a job before its next network operation
    ///
    /// A request the job is waiting on is failed straight away so the channel slot
    /// is released. Returns false for unknown or finished jobs.
    pub async fn abort(&self, id: u32) -> bool {
        let (cancel, in_flight) = {
            let jobs = self.jobs.lock().await;
            match jobs.get(&id) {
                Some(entry) => (Arc::clone(&entry.cancel), Arc::clone(&entry.in_flight)),
                None => return false,
            }
        };
        info!("Aborting transfer {}", id);
        self.stop_job(&cancel, &in_flight, BandError::Aborted).await;
        true
    }

    /// Stop every job with `error`
    ///
    /// `LinkLost` fails the jobs with state `Failed`; anything else counts as a
    /// consumer abort.
    pub async fn abort_all(&self, error: BandError) -> usize {
        let entries: Vec<_> = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .map(|e| (Arc::clone(&e.cancel), Arc::clone(&e.in_flight)))
                .collect()
        };
        for (cancel, in_flight) in &entries {
            self.stop_job(cancel, in_flight, abort_error(&error)).await;
        }
        if !entries.is_empty() {
            info!("Stopped {} transfer(s): {}", entries.len(), error);
        }
        entries.len()
    }

    async fn stop_job(
        &self,
        cancel: &CancelFlag,
        in_flight: &Mutex<Option<u8>>,
        error: BandError,
    ) {
        cancel.raise(&error);
        let opcode = *in_flight.lock().await;
        if let Some(opcode) = opcode {
            self.channel.cancel_pending(opcode, error).await;
        }
    }

    pub async fn snapshot(&self, id: u32) -> Option<TransferSnapshot> {
        let status = {
            let jobs = self.jobs.lock().await;
            Arc::clone(&jobs.get(&id)?.status)
        };
        let snapshot = status.lock().await.clone();
        Some(snapshot)
    }

    pub async fn active_jobs(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.jobs.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// State of one job while it runs
struct JobRunner {
    id: u32,
    channel: CommandChannel,
    config: TransferConfig,
    ack: AckMode,
    job: TransferJob,
    init_payload: Vec<u8>,
    status: Arc<Mutex<TransferSnapshot>>,
    cancel: Arc<CancelFlag>,
    in_flight: Arc<Mutex<Option<u8>>>,
    observer: Arc<dyn TransferObserver>,
}

impl JobRunner {
    async fn run(self) -> Result<TransferReport> {
        let started = Instant::now();
        self.observer.on_start(&self.status.lock().await.clone());

        match self.execute().await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.set_state(TransferState::Completed).await;
                info!(
                    "{} transfer {} '{}' completed in {:?}",
                    self.job.kind, self.id, self.job.name, elapsed
                );
                self.observer.on_success(elapsed);
                Ok(TransferReport {
                    id: self.id,
                    kind: self.job.kind,
                    name: self.job.name.clone(),
                    total_bytes: self.job.data.len(),
                    elapsed,
                })
            }
            Err(e) => {
                let state = if matches!(e, BandError::Aborted) {
                    TransferState::Aborted
                } else {
                    TransferState::Failed
                };
                self.set_state(state).await;
                warn!(
                    "{} transfer {} '{}' {:?}: {}",
                    self.job.kind, self.id, self.job.name, state, e
                );
                self.observer.on_failed(&e);
                Err(e)
            }
        }
    }

    async fn execute(&self) -> Result<()> {
        let kind = self.job.kind;
        let mode = kind.status_mode();

        self.check_cancel()?;
        let init = Request::new(kind.init_opcode(), self.init_payload.clone())
            .with_timeout(self.config.init_timeout())
            .with_status(mode);
        self.submit(init).await?;

        self.set_state(TransferState::Streaming).await;
        let chunk_size = self.status.lock().await.chunk_size;
        let chunks: Vec<&[u8]> = self.job.data.chunks(chunk_size).collect();
        debug!("Transfer {}: streaming {} packets", self.id, chunks.len());

        // Bytes of the final packet are credited after validation
        let last = chunks.len() - 1;
        match self.ack {
            AckMode::PerChunk => {
                for (index, chunk) in chunks.iter().enumerate() {
                    self.send_packet(index, chunk).await?;
                    if index != last {
                        self.advance(chunk.len()).await;
                    }
                }
            }
            AckMode::Windowed(window) => {
                let window = window.max(1);
                let mut start = 0;
                while start < chunks.len() {
                    let end = (start + window).min(chunks.len());
                    self.send_window(start, &chunks[start..end]).await?;
                    let acked: usize = chunks[start..end]
                        .iter()
                        .enumerate()
                        .filter(|(offset, _)| start + offset != last)
                        .map(|(_, c)| c.len())
                        .sum();
                    self.advance(acked).await;
                    start = end;
                }
            }
        }

        self.set_state(TransferState::Validating).await;
        self.check_cancel()?;
        let crc = Crc16Arc::digest(&self.job.data);
        let validate = Request::new(kind.validate_opcode(), crc.to_le_bytes().to_vec())
            .with_timeout(self.config.validate_timeout())
            .with_status(mode);
        self.submit(validate).await?;

        if self.job.activate && kind == TransferKind::Firmware {
            self.check_cancel()?;
            let frame = self.submit(ActivateFirmware.request()).await?;
            ActivateFirmware.parse(frame)?;
        }
        self.advance(chunks[last].len()).await;
        Ok(())
    }

    fn check_cancel(&self) -> Result<()> {
        match self.cancel.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn submit(&self, request: Request) -> Result<Frame> {
        *self.in_flight.lock().await = Some(request.opcode);
        let result = self.channel.submit(request).await;
        *self.in_flight.lock().await = None;
        // The stop reason wins over whatever the interrupted request reported
        self.check_cancel()?;
        result
    }

    /// One packet with its own acknowledgement, retried on timeout
    async fn send_packet(&self, index: usize, data: &[u8]) -> Result<()> {
        let sequence = packet_sequence(index)?;
        let mut attempt = 0;
        loop {
            self.check_cancel()?;
            let request = Request::new(self.job.kind.packet_opcode(), data.to_vec())
                .with_sequence(sequence)
                .with_timeout(self.config.chunk_timeout())
                .with_status(self.job.kind.status_mode());
            match self.submit(request).await {
                Ok(_) => return Ok(()),
                Err(BandError::NotifyTimeOut { .. }) if attempt < self.config.chunk_retries => {
                    attempt += 1;
                    warn!(
                        "Transfer {}: packet {} not acknowledged, retry {}/{}",
                        self.id, index, attempt, self.config.chunk_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A run of packets acknowledged by the reply to the last one
    async fn send_window(&self, first: usize, window: &[&[u8]]) -> Result<()> {
        let opcode = self.job.kind.packet_opcode();
        let Some((last, rest)) = window.split_last() else {
            return Ok(());
        };
        let last_sequence = packet_sequence(first + rest.len())?;
        let mut attempt = 0;
        loop {
            for (offset, data) in rest.iter().enumerate() {
                self.check_cancel()?;
                let frame =
                    Frame::with_sequence(opcode, packet_sequence(first + offset)?, data.to_vec());
                self.channel.send_unacknowledged(&frame).await?;
            }
            self.check_cancel()?;
            let request = Request::new(opcode, last.to_vec())
                .with_sequence(last_sequence)
                .with_timeout(self.config.chunk_timeout())
                .with_status(self.job.kind.status_mode());
            match self.submit(request).await {
                Ok(_) => return Ok(()),
                Err(BandError::NotifyTimeOut { .. }) if attempt < self.config.chunk_retries => {
                    attempt += 1;
                    warn!(
                        "Transfer {}: window at packet {} not acknowledged, retry {}/{}",
                        self.id, first, attempt, self.config.chunk_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn set_state(&self, state: TransferState) {
        let mut status = self.status.lock().await;
        debug!("Transfer {}: {:?} -> {:?}", self.id, status.state, state);
        status.state = state;
    }

    async fn advance(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let (percent, sent, total) = {
            let mut status = self.status.lock().await;
            status.bytes_sent = (status.bytes_sent + bytes).min(status.total_bytes);
            (status.percent(), status.bytes_sent, status.total_bytes)
        };
        self.observer.on_progress(percent, sent, total);
    }
}

fn packet_sequence(index: usize) -> Result<u16> {
    u16::try_from(index).map_err(|_| {
        BandError::InvalidParameter(format!("packet {} has no u16 sequence number", index))
    })
}

fn abort_error(error: &BandError) -> BandError {
    match error {
        BandError::LinkLost => BandError::LinkLost,
        _ => BandError::Aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::config::ChannelConfig;
    use crate::events::EventDispatcher;
    use crate::mock::MockTransport;
    use crate::types::OperationStatus;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
        progress: StdMutex<Vec<usize>>,
    }

    impl TransferObserver for Recorder {
        fn on_start(&self, _job: &TransferSnapshot) {
            self.events.lock().unwrap().push("start".to_string());
        }

        fn on_progress(&self, _percent: u8, bytes_sent: usize, _total_bytes: usize) {
            self.progress.lock().unwrap().push(bytes_sent);
        }

        fn on_success(&self, _elapsed: Duration) {
            self.events.lock().unwrap().push("success".to_string());
        }

        fn on_failed(&self, error: &BandError) {
            self.events.lock().unwrap().push(format!("failed: {}", error));
        }
    }

    fn engine() -> (TransferEngine, crate::mock::MockDevice) {
        let (transport, device) = MockTransport::pair();
        let channel = CommandChannel::new(
            Arc::new(transport),
            FrameCodec::new(),
            EventDispatcher::new(),
            ChannelConfig::default(),
        );
        channel.set_ready(true);
        (TransferEngine::new(channel, TransferConfig::default()), device)
    }

    /// Acknowledge every request with status 0, except packets for which `drop` is true
    fn ack_all_but(
        frame: &Frame,
        drop: impl Fn(u16) -> bool,
    ) -> Vec<Frame> {
        match frame.sequence() {
            Some(seq) if drop(seq) => vec![],
            Some(seq) => vec![Frame::with_sequence(frame.opcode(), seq, vec![0])],
            None => vec![Frame::new(frame.opcode(), vec![0])],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_transfer_completes() {
        let (engine, device) = engine();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        device.serve(engine.channel.clone(), move |frame| {
            log.lock().unwrap().push((frame.opcode(), frame.sequence()));
            ack_all_but(&frame, |_| false)
        });

        let recorder = Arc::new(Recorder::default());
        let data: Vec<u8> = (0..100).collect();
        let report = engine
            .run(
                TransferJob::new(TransferKind::Firmware, "app.bin", data).with_chunk_size(10),
                recorder.clone(),
            )
            .await
            .unwrap();
        assert_eq!(report.total_bytes, 100);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&(dfu::INIT_PARAMETERS, None)));
        assert_eq!(seen.last(), Some(&(dfu::VALIDATE, None)));
        assert_eq!(seen.len(), 12);
        assert_eq!(seen[1], (dfu::RECEIVE_IMAGE, Some(0)));
        assert_eq!(seen[10], (dfu::RECEIVE_IMAGE, Some(9)));

        let progress = recorder.progress.lock().unwrap().clone();
        assert_eq!(progress, (1..=10).map(|n| n * 10).collect::<Vec<_>>());
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["start".to_string(), "success".to_string()]
        );
        assert!(engine.active_jobs().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_chunk_fails_with_six_chunks_sent() {
        let (engine, device) = engine();
        // Packet index 6 is the seventh chunk
        device.serve(engine.channel.clone(), |frame| ack_all_but(&frame, |seq| seq == 6));

        let recorder = Arc::new(Recorder::default());
        let handle = engine
            .start(
                TransferJob::new(TransferKind::DialFile, "face.bin", vec![0x5A; 100])
                    .with_chunk_size(10),
                recorder.clone(),
            )
            .await
            .unwrap();
        let status = Arc::clone(&handle.status);

        assert!(matches!(
            handle.wait().await,
            Err(BandError::NotifyTimeOut {
                opcode: dfu::DIAL_FILE_PACKET
            })
        ));
        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.state, TransferState::Failed);
        assert_eq!(snapshot.bytes_sent, 60);
        assert_eq!(*recorder.progress.lock().unwrap().last().unwrap(), 60);
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(events[1].starts_with("failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_retry_recovers() {
        let (engine, device) = engine();
        let dropped = Arc::new(StdMutex::new(false));
        let flag = Arc::clone(&dropped);
        device.serve(engine.channel.clone(), move |frame| {
            ack_all_but(&frame, |seq| {
                // Ignore the first copy of packet 2 only
                let mut dropped = flag.lock().unwrap();
                if seq == 2 && !*dropped {
                    *dropped = true;
                    return true;
                }
                false
            })
        });

        engine
            .run(
                TransferJob::new(TransferKind::Resource, "boot.res", vec![1; 40])
                    .with_chunk_size(10),
                Arc::new(NoopObserver),
            )
            .await
            .unwrap();
        assert!(*dropped.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_rejection_maps_status() {
        let (engine, device) = engine();
        device.serve(engine.channel.clone(), |frame| {
            vec![Frame::new(frame.opcode(), vec![OperationStatus::NotEnoughPower.to_u8()])]
        });

        let recorder = Arc::new(Recorder::default());
        let result = engine
            .run(
                TransferJob::new(TransferKind::Firmware, "app.bin", vec![1; 30]),
                recorder.clone(),
            )
            .await;
        assert!(matches!(
            result,
            Err(BandError::Device(OperationStatus::NotEnoughPower))
        ));
        assert!(recorder.progress.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_uses_file_status() {
        let (engine, device) = engine();
        device.serve(engine.channel.clone(), |frame| {
            vec![Frame::new(frame.opcode(), vec![7])]
        });

        let result = engine
            .run(
                TransferJob::new(TransferKind::Image, "photo.jpg", vec![1; 30]),
                Arc::new(NoopObserver),
            )
            .await;
        assert!(matches!(
            result,
            Err(BandError::File(crate::types::FileStatus::MemoryFull))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_keeps_last_chunk_uncredited() {
        let (engine, device) = engine();
        device.serve(engine.channel.clone(), |frame| {
            if frame.opcode() == dfu::VALIDATE_RESOURCE {
                vec![Frame::new(frame.opcode(), vec![2])]
            } else {
                ack_all_but(&frame, |_| false)
            }
        });

        let handle = engine
            .start(
                TransferJob::new(TransferKind::Resource, "ui.res", vec![3; 25])
                    .with_chunk_size(10),
                Arc::new(NoopObserver),
            )
            .await
            .unwrap();
        let status = Arc::clone(&handle.status);
        assert!(matches!(
            handle.wait().await,
            Err(BandError::Device(OperationStatus::InvalidData))
        ));
        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.state, TransferState::Failed);
        assert_eq!(snapshot.bytes_sent, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_failure_keeps_last_chunk_uncredited() {
        let (engine, device) = engine();
        device.serve(engine.channel.clone(), |frame| {
            if frame.opcode() == dfu::ACTIVATE_AND_RESET {
                vec![Frame::new(frame.opcode(), vec![5])]
            } else {
                ack_all_but(&frame, |_| false)
            }
        });

        let recorder = Arc::new(Recorder::default());
        let handle = engine
            .start(
                TransferJob::new(TransferKind::Firmware, "app.bin", vec![4; 30])
                    .with_chunk_size(10)
                    .with_activation(),
                recorder.clone(),
            )
            .await
            .unwrap();
        let status = Arc::clone(&handle.status);
        assert!(matches!(handle.wait().await, Err(BandError::Device(_))));

        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.state, TransferState::Failed);
        assert_eq!(snapshot.bytes_sent, 20);
        assert_eq!(*recorder.progress.lock().unwrap(), vec![10, 20]);
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(events[1].starts_with("failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_fails_transfer() {
        let (engine, device) = engine();
        device.serve(engine.channel.clone(), |frame| match frame.sequence() {
            Some(_) => vec![],
            None => vec![Frame::new(frame.opcode(), vec![0])],
        });

        let handle = engine
            .start(
                TransferJob::new(TransferKind::Firmware, "app.bin", vec![1; 50])
                    .with_chunk_size(10),
                Arc::new(NoopObserver),
            )
            .await
            .unwrap();
        let status = Arc::clone(&handle.status);
        while engine.channel.pending_opcode().await != Some(dfu::RECEIVE_IMAGE) {
            tokio::task::yield_now().await;
        }

        assert_eq!(engine.abort_all(BandError::LinkLost).await, 1);
        assert!(matches!(handle.wait().await, Err(BandError::LinkLost)));
        assert_eq!(status.lock().await.state, TransferState::Failed);
        assert_eq!(engine.channel.pending_opcode().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contacts_use_cumulative_ack() {
        let (engine, device) = engine();
        let acked = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&acked);
        device.serve(engine.channel.clone(), move |frame| {
            match frame.sequence() {
                // Only the last packet of every window of 4 is answered
                Some(seq) if seq % 4 == 3 || seq == 9 => {
                    log.lock().unwrap().push(seq);
                    vec![Frame::with_sequence(frame.opcode(), seq, vec![0])]
                }
                Some(_) => vec![],
                None => vec![Frame::new(frame.opcode(), vec![0])],
            }
        });

        let recorder = Arc::new(Recorder::default());
        engine
            .run(
                TransferJob::new(TransferKind::Contacts, "contacts", vec![9; 100])
                    .with_chunk_size(10),
                recorder.clone(),
            )
            .await
            .unwrap();
        assert_eq!(*acked.lock().unwrap(), vec![3, 7, 9]);
        assert_eq!(*recorder.progress.lock().unwrap(), vec![40, 80, 90, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_releases_slot() {
        let (engine, device) = engine();
        // Never acknowledge packets so the job waits on packet 0
        device.serve(engine.channel.clone(), |frame| match frame.sequence() {
            Some(_) => vec![],
            None => vec![Frame::new(frame.opcode(), vec![0])],
        });

        let recorder = Arc::new(Recorder::default());
        let handle = engine
            .start(
                TransferJob::new(TransferKind::Firmware, "app.bin", vec![1; 50])
                    .with_chunk_size(10),
                recorder.clone(),
            )
            .await
            .unwrap();
        let id = handle.id();
        while engine.channel.pending_opcode().await != Some(dfu::RECEIVE_IMAGE) {
            tokio::task::yield_now().await;
        }

        assert!(engine.abort(id).await);
        assert!(matches!(handle.wait().await, Err(BandError::Aborted)));
        assert_eq!(engine.channel.pending_opcode().await, None);
        assert!(!engine.abort(id).await);
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["start".to_string(), "failed: Operation aborted".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_bad_jobs() {
        let (engine, _device) = engine();
        assert!(matches!(
            engine
                .start(
                    TransferJob::new(TransferKind::Firmware, "empty", vec![]),
                    Arc::new(NoopObserver)
                )
                .await,
            Err(BandError::InvalidParameter(_))
        ));
        assert!(matches!(
            engine
                .start(
                    TransferJob::new(TransferKind::DialFile, "x".repeat(300), vec![1]),
                    Arc::new(NoopObserver)
                )
                .await,
            Err(BandError::InvalidParameter(_))
        ));
        // One byte per packet needs more sequence numbers than a u16 holds
        assert!(matches!(
            engine
                .start(
                    TransferJob::new(TransferKind::Resource, "big.res", vec![0; 65_537])
                        .with_chunk_size(1),
                    Arc::new(NoopObserver)
                )
                .await,
            Err(BandError::PayloadTooLarge(65_537))
        ));
        assert!(engine.active_jobs().await.is_empty());
    }

    #[test]
    fn test_init_payload_layout() {
        let job = TransferJob::new(TransferKind::Firmware, "fw", vec![1, 2, 3]);
        let payload = job.init_payload(1, 13).unwrap();
        assert_eq!(payload[0], 1);
        assert_eq!(&payload[1..5], &3u32.to_le_bytes());
        assert_eq!(&payload[5..7], &13u16.to_le_bytes());
        assert_eq!(&payload[7..9], &Crc16Arc::digest(&[1, 2, 3]).to_le_bytes());
        assert_eq!(payload[9], 2);
        assert_eq!(&payload[10..], b"fw");
    }
}
