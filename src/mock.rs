//! In-memory peripheral for tests and demos
//!
//! [`MockTransport`] implements [`BleTransport`]; every chunk written by the engine is
//! forwarded to the paired [`MockDevice`], which plays the band's side of the
//! conversation by decoding those chunks and answering through
//! [`crate::link::BandLink::on_notification`].

use crate::channel::CommandChannel;
use crate::codec::{Decoded, Frame, FrameCodec};
use crate::transport::{BleTransport, DiscoveredPeripheral, PeripheralId};
use crate::types::{BandError, Result};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Scriptable behaviour shared between the transport and the test
#[derive(Default)]
struct MockState {
    advertisements: Vec<DiscoveredPeripheral>,
    connect_failures: VecDeque<BandError>,
    connected: Option<PeripheralId>,
}

/// Simulated platform transport
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    writes_tx: mpsc::UnboundedSender<Vec<u8>>,
    fail_writes: Arc<AtomicBool>,
    connect_calls: Arc<AtomicUsize>,
    mtu: Option<usize>,
}

/// The band's end of a [`MockTransport`]
pub struct MockDevice {
    writes_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    codec: FrameCodec,
}

impl MockTransport {
    /// Create a connected transport/device pair
    pub fn pair() -> (MockTransport, MockDevice) {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let transport = MockTransport {
            state: Arc::new(Mutex::new(MockState::default())),
            writes_tx,
            fail_writes: Arc::new(AtomicBool::new(false)),
            connect_calls: Arc::new(AtomicUsize::new(0)),
            mtu: None,
        };
        let device = MockDevice {
            writes_rx,
            codec: FrameCodec::new(),
        };
        (transport, device)
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Peripherals returned by the next scan, duplicates included
    pub async fn set_advertisements(&self, peripherals: Vec<DiscoveredPeripheral>) {
        self.state.lock().await.advertisements = peripherals;
    }

    /// Make the next connect attempts fail, in order
    pub async fn fail_next_connects(&self, errors: Vec<BandError>) {
        self.state.lock().await.connect_failures.extend(errors);
    }

    /// Make every write fail as if the radio link were gone
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub async fn connected_peripheral(&self) -> Option<PeripheralId> {
        self.state.lock().await.connected.clone()
    }
}

#[async_trait::async_trait]
impl BleTransport for MockTransport {
    async fn scan(
        &self,
        _service_filters: &[String],
    ) -> Result<BoxStream<'static, DiscoveredPeripheral>> {
        let advertisements = self.state.lock().await.advertisements.clone();
        Ok(stream::iter(advertisements).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId, _timeout: Duration) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        state.connected = Some(peripheral.clone());
        Ok(())
    }

    async fn disconnect(&self, _peripheral: &PeripheralId) -> Result<()> {
        self.state.lock().await.connected = None;
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BandError::Bluetooth("Not connected".to_string()));
        }
        self.writes_tx
            .send(data.to_vec())
            .map_err(|_| BandError::Bluetooth("mock device dropped".to_string()))
    }

    fn mtu(&self) -> Option<usize> {
        self.mtu
    }
}

impl MockDevice {
    /// Wait for the next complete frame written by the engine
    pub async fn next_frame(&mut self) -> Option<Frame> {
        while let Some(chunk) = self.writes_rx.recv().await {
            match self.codec.decode(&chunk) {
                Ok(Decoded::Frame(frame)) => return Some(frame),
                Ok(Decoded::Incomplete) => continue,
                Err(e) => {
                    log::warn!("Mock device dropped malformed chunk: {}", e);
                    continue;
                }
            }
        }
        None
    }

    /// Raw chunk access for tests that check framing
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.writes_rx.recv().await
    }

    /// Encode a device-to-phone frame into the chunks the engine would receive
    pub fn chunks_for(&self, frame: &Frame) -> Result<Vec<Vec<u8>>> {
        self.codec.encode(frame)
    }

    /// Answer every request in the background
    ///
    /// `responder` returns the frames to notify back for each received frame,
    /// possibly none.
    pub fn serve<F>(mut self, channel: CommandChannel, mut responder: F) -> JoinHandle<()>
    where
        F: FnMut(Frame) -> Vec<Frame> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(frame) = self.next_frame().await {
                for reply in responder(frame) {
                    let chunks = match self.chunks_for(&reply) {
                        Ok(chunks) => chunks,
                        Err(e) => {
                            log::warn!("Mock device cannot encode reply: {}", e);
                            continue;
                        }
                    };
                    for chunk in chunks {
                        channel.on_chunk(&chunk).await;
                    }
                }
            }
        })
    }
}
