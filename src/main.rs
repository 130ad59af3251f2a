//! Command line tool for QC-family bands over BlueZ

use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DiscoveryFilter, Uuid};
use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::{BoxStream, Stream, StreamExt};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use wearable_link::codec::hex_dump;
use wearable_link::commands::{FindDevice, GetBattery, SetTime};
use wearable_link::transport::{
    NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
};
use wearable_link::{
    BandError, BandLink, BleTransport, DeviceEvent, DiscoveredPeripheral, EventTopic, LinkConfig,
    LinkState, MeasurementKind, MeasurementObserver, MeasurementSample, PeripheralId,
    ReconnectReason, TransferJob, TransferKind, TransferObserver, TransferSnapshot,
};

#[derive(Parser, Debug)]
#[command(name = "wearable-link")]
#[command(about = "Talk to a QC-family wearable band over BlueZ")]
struct Args {
    /// JSON configuration file (built-in defaults when absent)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List nearby bands
    Scan {
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
    /// Read the battery level
    Battery {
        /// Bluetooth MAC address of the band (format: AA:BB:CC:DD:EE:FF)
        address: String,
    },
    /// Make the band vibrate
    Find { address: String },
    /// Set the band's clock to local time
    SetTime { address: String },
    /// Run a measurement and print its samples
    Measure {
        address: String,
        #[arg(long, value_enum, default_value = "heart-rate")]
        kind: MeasureArg,
        #[arg(long, default_value = "30")]
        seconds: u64,
    },
    /// Upload firmware, a watch face, a resource, an image or a contact list
    Upload {
        address: String,
        #[arg(long, value_enum)]
        kind: UploadArg,
        file: PathBuf,
        /// Name sent to the band (file name by default)
        #[arg(long)]
        name: Option<String>,
        /// Activate firmware after validation
        #[arg(long)]
        activate: bool,
    },
    /// Stay connected and print device events until Ctrl-C
    Monitor { address: String },
}

impl Cmd {
    fn address(&self) -> Option<&str> {
        match self {
            Cmd::Scan { .. } => None,
            Cmd::Battery { address }
            | Cmd::Find { address }
            | Cmd::SetTime { address }
            | Cmd::Measure { address, .. }
            | Cmd::Upload { address, .. }
            | Cmd::Monitor { address } => Some(address),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MeasureArg {
    HeartRate,
    BloodPressure,
    BloodOxygen,
    Stress,
    Hrv,
    BodyTemperature,
    BloodGlucose,
}

impl From<MeasureArg> for MeasurementKind {
    fn from(arg: MeasureArg) -> Self {
        match arg {
            MeasureArg::HeartRate => MeasurementKind::HeartRate,
            MeasureArg::BloodPressure => MeasurementKind::BloodPressure,
            MeasureArg::BloodOxygen => MeasurementKind::BloodOxygen,
            MeasureArg::Stress => MeasurementKind::Stress,
            MeasureArg::Hrv => MeasurementKind::Hrv,
            MeasureArg::BodyTemperature => MeasurementKind::BodyTemperature,
            MeasureArg::BloodGlucose => MeasurementKind::BloodGlucose,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum UploadArg {
    Firmware,
    Dial,
    Resource,
    Image,
    Contacts,
}

impl From<UploadArg> for TransferKind {
    fn from(arg: UploadArg) -> Self {
        match arg {
            UploadArg::Firmware => TransferKind::Firmware,
            UploadArg::Dial => TransferKind::DialFile,
            UploadArg::Resource => TransferKind::Resource,
            UploadArg::Image => TransferKind::Image,
            UploadArg::Contacts => TransferKind::Contacts,
        }
    }
}

// ============================================================================
// BlueZ transport
// ============================================================================

fn bt(e: bluer::Error) -> BandError {
    BandError::Bluetooth(e.to_string())
}

struct Connected {
    device: Device,
    write: Characteristic,
    notify: Characteristic,
}

struct BluerTransport {
    adapter: Adapter,
    connected: Mutex<Option<Connected>>,
    /// 0 until a connection reported one
    mtu: AtomicUsize,
}

impl BluerTransport {
    fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            connected: Mutex::new(None),
            mtu: AtomicUsize::new(0),
        }
    }

    async fn wait_services_resolved(device: &Device) -> wearable_link::Result<()> {
        const MAX_ATTEMPTS: u32 = 30;
        for _ in 0..MAX_ATTEMPTS {
            if device.is_services_resolved().await.map_err(bt)? {
                return Ok(());
            }
            sleep(Duration::from_secs(1)).await;
        }
        Err(BandError::Bluetooth(
            "Timeout waiting for GATT services to be resolved".to_string(),
        ))
    }

    async fn discover(device: Device) -> wearable_link::Result<Connected> {
        Self::wait_services_resolved(&device).await?;

        let write_uuid = parse_uuid(WRITE_CHARACTERISTIC_UUID)?;
        let notify_uuid = parse_uuid(NOTIFY_CHARACTERISTIC_UUID)?;
        let mut write = None;
        let mut notify = None;

        for service in device.services().await.map_err(bt)? {
            for characteristic in service.characteristics().await.map_err(bt)? {
                let uuid = characteristic.uuid().await.map_err(bt)?;
                if uuid == write_uuid {
                    write = Some(characteristic);
                } else if uuid == notify_uuid {
                    notify = Some(characteristic);
                }
            }
        }

        match (write, notify) {
            (Some(write), Some(notify)) => Ok(Connected {
                device,
                write,
                notify,
            }),
            _ => Err(BandError::Bluetooth(
                "Band characteristics not found".to_string(),
            )),
        }
    }

    /// Subscribe to the notify characteristic of the current connection
    async fn notifications(&self) -> wearable_link::Result<impl Stream<Item = Vec<u8>>> {
        let notify = self
            .connected
            .lock()
            .await
            .as_ref()
            .map(|c| c.notify.clone())
            .ok_or(BandError::NotConnected)?;
        notify.notify().await.map_err(bt)
    }
}

fn parse_uuid(uuid: &str) -> wearable_link::Result<Uuid> {
    Uuid::parse_str(uuid).map_err(|e| BandError::Config(format!("bad UUID {}: {}", uuid, e)))
}

#[async_trait::async_trait]
impl BleTransport for BluerTransport {
    async fn scan(
        &self,
        service_filters: &[String],
    ) -> wearable_link::Result<BoxStream<'static, DiscoveredPeripheral>> {
        let uuids = service_filters
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect();
        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids,
                ..Default::default()
            })
            .await
            .map_err(bt)?;

        let events = self.adapter.discover_devices().await.map_err(bt)?;
        let adapter = self.adapter.clone();
        let found = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let AdapterEvent::DeviceAdded(address) = event else {
                    return None;
                };
                let device = adapter.device(address).ok()?;
                Some(DiscoveredPeripheral {
                    id: PeripheralId::new(address.to_string()),
                    name: device.name().await.ok().flatten(),
                    rssi: device.rssi().await.ok().flatten(),
                })
            }
        });
        Ok(found.boxed())
    }

    async fn stop_scan(&self) -> wearable_link::Result<()> {
        // BlueZ stops discovering once the scan stream is dropped
        Ok(())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralId,
        timeout: Duration,
    ) -> wearable_link::Result<()> {
        let address: Address = peripheral.as_str().parse().map_err(|_| {
            BandError::InvalidParameter(format!("Invalid MAC address: {}", peripheral))
        })?;
        let device = self.adapter.device(address).map_err(bt)?;

        let connected = tokio::time::timeout(timeout, async {
            if !device.is_connected().await.map_err(bt)? {
                device.connect().await.map_err(bt)?;
            }
            Self::discover(device).await
        })
        .await
        .map_err(|_| BandError::ConnectTimeout(timeout))??;

        match connected.write.mtu().await {
            Ok(mtu) => self.mtu.store(mtu, Ordering::SeqCst),
            Err(e) => debug!("MTU not available: {}", e),
        }
        *self.connected.lock().await = Some(connected);
        Ok(())
    }

    async fn disconnect(&self, _peripheral: &PeripheralId) -> wearable_link::Result<()> {
        if let Some(connected) = self.connected.lock().await.take() {
            connected.device.disconnect().await.map_err(bt)?;
        }
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> wearable_link::Result<()> {
        let write = self
            .connected
            .lock()
            .await
            .as_ref()
            .map(|c| c.write.clone())
            .ok_or(BandError::NotConnected)?;
        write.write(data).await.map_err(bt)
    }

    fn mtu(&self) -> Option<usize> {
        match self.mtu.load(Ordering::SeqCst) {
            0 => None,
            mtu => Some(mtu),
        }
    }
}

/// Feed notifications into the link, resubscribing after every reconnect
fn spawn_listener(
    link: BandLink,
    transport: Arc<BluerTransport>,
    ready_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if link.supervisor().state().await != LinkState::Ready {
                tokio::select! {
                    _ = sleep(Duration::from_millis(500)) => continue,
                    _ = shutdown.changed() => break,
                }
            }

            let stream = match transport.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start notification stream: {}", e);
                    link.on_link_lost(ReconnectReason::ConnectionLost).await;
                    continue;
                }
            };
            let mut stream = Box::pin(stream);
            info!("Notification stream active");
            let _ = ready_tx.try_send(());

            loop {
                tokio::select! {
                    value = stream.next() => match value {
                        Some(value) => {
                            debug!("RX {} bytes: {}", value.len(), hex_dump(&value, 32));
                            link.on_notification(&value).await;
                        }
                        None => {
                            warn!("Notification stream ended");
                            link.on_link_lost(ReconnectReason::ConnectionLost).await;
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        info!("Listener shutdown requested");
                        return;
                    }
                }
            }
        }
    })
}

// ============================================================================
// Observers
// ============================================================================

struct PrintSamples;

impl MeasurementObserver for PrintSamples {
    fn on_sample(&self, sample: &MeasurementSample) {
        match sample.value() {
            Ok(value) => println!("   {:?}", value),
            Err(e) => println!("   {:?} ({})", sample.values, e),
        }
    }

    fn on_error(&self, error: &BandError) {
        println!("   ❌ {}", error);
    }
}

struct PrintProgress;

impl TransferObserver for PrintProgress {
    fn on_start(&self, job: &TransferSnapshot) {
        println!(
            "📤 Uploading {} '{}' ({} bytes, {} per packet)",
            job.kind, job.name, job.total_bytes, job.chunk_size
        );
    }

    fn on_progress(&self, percent: u8, bytes_sent: usize, total_bytes: usize) {
        println!("   {:3}% ({}/{})", percent, bytes_sent, total_bytes);
    }

    fn on_failed(&self, error: &BandError) {
        println!("   ❌ Upload failed: {}", error);
    }
}

// ============================================================================
// Main Application
// ============================================================================

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => LinkConfig::load(path)?,
        None => LinkConfig::default(),
    };

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    info!("Using adapter {}", adapter.name());

    let transport = Arc::new(BluerTransport::new(adapter));
    let link = BandLink::new(config, transport.clone()).await?;

    match args.command.address().map(str::to_string) {
        None => {
            if let Cmd::Scan { seconds } = args.command {
                scan(&link, Duration::from_secs(seconds)).await?;
            }
        }
        Some(address) => run_connected(&link, transport, &address, args.command).await?,
    }
    Ok(())
}

async fn scan(link: &BandLink, duration: Duration) -> wearable_link::Result<()> {
    println!("🔍 Scanning for {:?}...", duration);
    let found = link
        .supervisor()
        .scan(&[SERVICE_UUID.to_string()], duration, |p| {
            println!(
                "   {}  {}  {} dBm",
                p.id,
                p.name.as_deref().unwrap_or("(unnamed)"),
                p.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into())
            );
        })
        .await?;
    println!("Found {} band(s)", found.len());
    Ok(())
}

async fn run_connected(
    link: &BandLink,
    transport: Arc<BluerTransport>,
    address: &str,
    command: Cmd,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    println!("📡 Connecting to {}...", address);
    link.connect(&PeripheralId::new(address)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, mut ready_rx) = mpsc::channel(1);
    let listener = spawn_listener(link.clone(), transport, ready_tx, shutdown_rx.clone());
    match tokio::time::timeout(Duration::from_secs(5), ready_rx.recv()).await {
        Ok(Some(())) => println!("✅ Connected"),
        _ => {
            let _ = shutdown_tx.send(true);
            let _ = link.disconnect().await;
            return Err("Timeout waiting for notification stream".into());
        }
    }

    let result = run_command(link, command, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = link.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    let _ = listener.await;
    result
}

async fn run_command(
    link: &BandLink,
    command: Cmd,
    shutdown: watch::Receiver<bool>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    match command {
        Cmd::Scan { .. } => {}
        Cmd::Battery { .. } => {
            let battery = link.execute(&GetBattery::default()).await?;
            println!(
                "🔋 {}%{}",
                battery.level,
                if battery.charging { " (charging)" } else { "" }
            );
        }
        Cmd::Find { .. } => {
            link.execute(&FindDevice).await?;
            println!("📳 Band is vibrating");
        }
        Cmd::SetTime { .. } => {
            let now = chrono::Local::now().naive_local();
            link.execute(&SetTime(now)).await?;
            println!("🕐 Clock set to {}", now.format("%Y-%m-%d %H:%M:%S"));
        }
        Cmd::Measure { kind, seconds, .. } => {
            let kind = MeasurementKind::from(kind);
            println!("❤️  Measuring {} for {}s", kind, seconds);
            link.sessions().start(kind, Arc::new(PrintSamples)).await?;
            tokio::select! {
                _ = sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => println!("Interrupted"),
            }
            if let Some(sample) = link.sessions().stop(kind).await? {
                println!("Final: {:?}", sample.value()?);
            }
        }
        Cmd::Upload {
            kind,
            file,
            name,
            activate,
            ..
        } => {
            let data = std::fs::read(&file)?;
            let name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let mut job = TransferJob::new(kind.into(), name, data);
            if activate {
                job = job.with_activation();
            }
            let report = link
                .transfers()
                .start(job, Arc::new(PrintProgress))
                .await?
                .wait()
                .await?;
            println!(
                "✅ {} '{}' uploaded in {:?}",
                report.kind, report.name, report.elapsed
            );
        }
        Cmd::Monitor { .. } => {
            for topic in EventTopic::ALL {
                link.dispatcher()
                    .subscribe(
                        topic,
                        Arc::new(|event: &DeviceEvent| println!("📥 {:?}", event)),
                    )
                    .await;
            }
            let period = link.config().reconnect.rx_timeout() / 10;
            let monitor = link.spawn_health_monitor(period, shutdown);
            println!("Monitoring events, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            println!("{}", link.supervisor().metrics().await);
            monitor.abort();
        }
    }
    Ok(())
}
