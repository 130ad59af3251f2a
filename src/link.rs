//! One supervised band link
//!
//! [`BandLink`] wires the supervisor, command channel, event dispatcher, transfer
//! engine and measurement sessions together over a single [`BleTransport`]. The
//! platform layer feeds it notifications, MTU updates and disconnect reports.

use crate::channel::{CommandChannel, Routed};
use crate::codec::FrameCodec;
use crate::commands::{self, Command};
use crate::config::LinkConfig;
use crate::events::EventDispatcher;
use crate::sessions::SessionManager;
use crate::supervisor::{ConnectionSupervisor, HealthStatus, LinkState, ReconnectReason};
use crate::transfer::TransferEngine;
use crate::transport::{BleTransport, PeripheralId};
use crate::types::{BandError, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct BandLink {
    config: LinkConfig,
    transport: Arc<dyn BleTransport>,
    supervisor: ConnectionSupervisor,
    channel: CommandChannel,
    dispatcher: EventDispatcher,
    transfers: TransferEngine,
    sessions: SessionManager,
}

impl BandLink {
    pub async fn new(config: LinkConfig, transport: Arc<dyn BleTransport>) -> Result<Self> {
        config.validate()?;

        let dispatcher = EventDispatcher::new();
        let codec: FrameCodec = config.codec.build();
        let channel = CommandChannel::new(
            Arc::clone(&transport),
            codec,
            dispatcher.clone(),
            config.channel.clone(),
        );
        let supervisor = ConnectionSupervisor::new(Arc::clone(&transport), config.reconnect.clone());
        let transfers = TransferEngine::new(channel.clone(), config.transfer.clone());
        let sessions = SessionManager::new(channel.clone(), config.sessions.clone()).await;

        // Requests are only accepted while the link is Ready
        let ready = channel.clone();
        supervisor
            .observe(Arc::new(move |_from: LinkState, to: LinkState| {
                ready.set_ready(to == LinkState::Ready);
            }))
            .await;

        Ok(Self {
            config,
            transport,
            supervisor,
            channel,
            dispatcher,
            transfers,
            sessions,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.supervisor.connect(peripheral).await?;
        self.apply_transport_mtu().await
    }

    pub async fn connect_by_name(&self, name: &str, scan_timeout: Duration) -> Result<()> {
        self.supervisor.connect_by_name(name, scan_timeout).await?;
        self.apply_transport_mtu().await
    }

    async fn apply_transport_mtu(&self) -> Result<()> {
        match self.transport.mtu() {
            Some(mtu) => self.on_mtu_changed(mtu).await,
            None => Ok(()),
        }
    }

    /// Explicit disconnect: stop all work, then tear the link down
    pub async fn disconnect(&self) -> Result<()> {
        self.channel.set_ready(false);
        let stopped = self.transfers.abort_all(BandError::LinkLost).await;
        if stopped > 0 {
            info!("Failed {} transfer(s) on disconnect", stopped);
        }
        self.channel.fail_pending(BandError::LinkLost).await;
        self.sessions.abort_all(BandError::LinkLost);
        self.supervisor.disconnect().await
    }

    /// Feed one raw notification from the platform
    pub async fn on_notification(&self, bytes: &[u8]) -> Option<Routed> {
        self.supervisor.record_rx().await;
        self.channel.on_chunk(bytes).await
    }

    /// The negotiated ATT MTU changed
    pub async fn on_mtu_changed(&self, mtu: usize) -> Result<()> {
        let chunk_size = LinkConfig::chunk_size_for_mtu(mtu);
        debug!("MTU {} -> chunk size {}", mtu, chunk_size);
        self.channel.set_chunk_size(chunk_size).await
    }

    /// The platform reported the link gone
    ///
    /// Outstanding work fails with `LinkLost` before the supervisor leaves `Ready`.
    /// Returns the background reconnect, if one was started.
    pub async fn on_link_lost(
        &self,
        reason: ReconnectReason,
    ) -> Option<JoinHandle<Result<()>>> {
        self.channel.set_ready(false);
        self.transfers.abort_all(BandError::LinkLost).await;
        self.channel.fail_pending(BandError::LinkLost).await;
        self.sessions.abort_all(BandError::LinkLost);

        let generation = self.supervisor.link_lost(reason).await?;
        let supervisor = self.supervisor.clone();
        Some(tokio::spawn(async move {
            let result = supervisor.resume(generation).await;
            if let Err(e) = &result {
                warn!("Link not recovered: {}", e);
            }
            result
        }))
    }

    pub async fn execute<C: Command>(&self, cmd: &C) -> Result<C::Output> {
        commands::execute(&self.channel, cmd).await
    }

    /// Recycle the link whenever RX stays silent past the configured timeout
    pub fn spawn_health_monitor(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let link = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if link.supervisor.check_health().await == HealthStatus::Unhealthy {
                            warn!("No RX within {:?}, recycling link", link.config.reconnect.rx_timeout());
                            link.on_link_lost(ReconnectReason::RxTimeout).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("Health monitor stopped");
                        break;
                    }
                }
            }
        })
    }
}
