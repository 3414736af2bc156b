use crate::config::DriverConfig;
use crate::device::{DeviceSnapshot, Shared};
use crate::discovery::{DiscoveryScanner, DiscoveryTransport};
use crate::dispatcher::CommandDispatcher;
use crate::error::{DriverError, Result};
use crate::protocol::ClientFactory;
use crate::registry::DeviceRegistry;
use crate::subscription::StateReceiver;
use crate::sync::StateSynchronizer;
use crate::types::{
    Capability, CapabilityValue, LoadOptions, PairedDevice, PairingCandidate, Track, TrackState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Host-facing driver for one protocol family
///
/// `Driver` ties the discovery scanner, the paired-device registry, state synchronization
/// and command dispatch together. Devices are addressed by their paired id; capability
/// state changes arrive on [`Driver::subscribe`].
///
/// # Example
///
/// ```no_run
/// # use heos_renderer::{ClientFactory, Capability, CapabilityValue, DiscoveryTransport, Driver, DriverConfig, PairedDevice};
/// # use std::sync::Arc;
/// # async fn run(
/// #     transport: Arc<dyn DiscoveryTransport>,
/// #     factory: Arc<dyn ClientFactory>,
/// # ) -> heos_renderer::Result<()> {
/// let driver = Driver::new(DriverConfig::heos(), transport, factory);
/// let mut events = driver.subscribe();
/// driver.init(vec![PairedDevice::new("uuid:abc")]).await?;
///
/// driver
///     .set("uuid:abc", Capability::VolumeSet, CapabilityValue::Volume(0.3))
///     .await?;
///
/// while let Ok(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Driver {
    config: DriverConfig,
    scanner: DiscoveryScanner,
    registry: DeviceRegistry,
    sync: StateSynchronizer,
    dispatcher: CommandDispatcher,
    shared: Arc<Shared>,
}

impl Driver {
    /// Wire a driver to its discovery transport and client factory; call [`Driver::init`] next
    pub fn new(
        config: DriverConfig,
        transport: Arc<dyn DiscoveryTransport>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let shared = Arc::new(Shared::new(config.event_capacity));
        let scanner = DiscoveryScanner::new(transport, config.family, config.scan.clone());
        let sync = StateSynchronizer::new(shared.clone(), config.active_poll_interval);
        let registry = DeviceRegistry::new(
            shared.clone(),
            scanner.clone(),
            factory,
            sync.clone(),
            config.family,
            config.scan.removal_grace,
        );
        let dispatcher = CommandDispatcher::new(shared.clone(), registry.clone());

        Self {
            config,
            scanner,
            registry,
            sync,
            dispatcher,
            shared,
        }
    }

    /// Settings the driver was built with
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// The discovery scanner, for inspecting found devices
    pub fn scanner(&self) -> &DiscoveryScanner {
        &self.scanner
    }

    /// Subscribe to realtime capability values and availability changes
    pub fn subscribe(&self) -> StateReceiver {
        self.shared.subscribe()
    }

    /// Bind the paired devices, then start periodic scanning
    ///
    /// Paired devices that have not been found yet are bound as soon as the scanner
    /// reports them.
    pub async fn init(&self, paired: Vec<PairedDevice>) -> Result<()> {
        tracing::info!(
            "Initializing {} driver with {} paired device(s)",
            self.config.family,
            paired.len()
        );
        self.registry.initialize(paired).await;
        self.scanner.start().await
    }

    /// A device was paired by the host
    pub async fn added(&self, data: PairedDevice) {
        self.registry.add_device(data).await;
    }

    /// A device was unpaired by the host
    pub async fn deleted(&self, data: &PairedDevice) {
        self.registry.remove_device(&data.id).await;
    }

    /// Scan now, extending the current window if one is open
    pub async fn scan(&self, window: Option<Duration>) -> Result<()> {
        self.scanner.scan(window).await
    }

    /// Snapshot of a bound device; `NotFound` while it is unpaired or waiting
    pub fn device(&self, device_id: &str) -> Result<DeviceSnapshot> {
        self.registry.lookup(device_id)
    }

    /// Whether a paired device is still waiting to be found
    pub fn is_waiting(&self, device_id: &str) -> bool {
        self.registry.is_pending(device_id)
    }

    /// Found devices that are not paired yet
    pub fn list_devices(&self) -> Vec<PairingCandidate> {
        let paired = self.registry.paired();
        self.scanner
            .found_devices()
            .into_iter()
            .filter(|found| !paired.iter().any(|p| found.matches(&p.id)))
            .map(|found| PairingCandidate {
                name: found.name.clone(),
                data: PairedDevice::new(found.id.clone()),
            })
            .collect()
    }

    /// Start a pairing session answering the host's pairing requests
    pub fn pair(&self) -> PairingSession<'_> {
        PairingSession { driver: self }
    }

    /// Read a cached capability value
    ///
    /// Play state and volume are served from the cache; mute is read from the device.
    pub async fn get(&self, device_id: &str, capability: Capability) -> Result<CapabilityValue> {
        match capability {
            Capability::SpeakerPlaying => self.speaker_playing(device_id).map(CapabilityValue::Bool),
            Capability::VolumeSet => self.volume(device_id).map(CapabilityValue::Volume),
            Capability::VolumeMute => self.muted(device_id).await.map(CapabilityValue::Bool),
            Capability::SpeakerPrev | Capability::SpeakerNext => Err(DriverError::InvalidValue(
                format!("{} has no readable value", capability),
            )),
        }
    }

    /// Write a capability value, resolving to the value now in effect
    pub async fn set(
        &self,
        device_id: &str,
        capability: Capability,
        value: CapabilityValue,
    ) -> Result<CapabilityValue> {
        match (capability, value) {
            (Capability::SpeakerPlaying, CapabilityValue::Bool(playing)) => self
                .set_speaker_playing(device_id, playing)
                .await
                .map(CapabilityValue::Bool),
            (Capability::SpeakerPrev, _) => {
                self.previous(device_id).await?;
                Ok(CapabilityValue::Trigger)
            }
            (Capability::SpeakerNext, _) => {
                self.next(device_id).await?;
                Ok(CapabilityValue::Trigger)
            }
            (Capability::VolumeSet, CapabilityValue::Volume(volume)) => self
                .set_volume(device_id, volume)
                .await
                .map(CapabilityValue::Volume),
            (Capability::VolumeMute, CapabilityValue::Bool(mute)) => self
                .set_muted(device_id, mute)
                .await
                .map(CapabilityValue::Bool),
            (capability, value) => Err(DriverError::InvalidValue(format!(
                "{:?} is not a value for {}",
                value, capability
            ))),
        }
    }

    /// Cached play state
    pub fn speaker_playing(&self, device_id: &str) -> Result<bool> {
        self.dispatcher.playing(device_id)
    }

    /// Play or pause, addressing the group when the device is grouped
    pub async fn set_speaker_playing(&self, device_id: &str, playing: bool) -> Result<bool> {
        self.dispatcher.set_playing(device_id, playing).await
    }

    /// Skip to the previous track
    pub async fn previous(&self, device_id: &str) -> Result<()> {
        self.dispatcher.previous(device_id).await
    }

    /// Skip to the next track
    pub async fn next(&self, device_id: &str) -> Result<()> {
        self.dispatcher.next(device_id).await
    }

    /// Cached volume as a fraction in [0, 1]
    pub fn volume(&self, device_id: &str) -> Result<f64> {
        self.dispatcher.volume(device_id)
    }

    /// Set the volume from a fraction in [0, 1]
    pub async fn set_volume(&self, device_id: &str, volume: f64) -> Result<f64> {
        self.dispatcher.set_volume(device_id, volume).await
    }

    /// Ask a renderer whether it is muted
    pub async fn muted(&self, device_id: &str) -> Result<bool> {
        self.dispatcher.muted(device_id).await
    }

    /// Mute or unmute a renderer
    pub async fn set_muted(&self, device_id: &str, mute: bool) -> Result<bool> {
        self.dispatcher.set_muted(device_id, mute).await
    }

    /// Load a track on a media renderer
    ///
    /// With a non-zero [`LoadOptions::delay`] the load waits for the delay and is
    /// superseded by any later load for the same device.
    pub async fn load_track(
        &self,
        device_id: &str,
        track: Track,
        options: LoadOptions,
    ) -> Result<Track> {
        self.dispatcher.load_track(device_id, track, options).await
    }

    /// Seek a renderer, rounded to whole seconds
    pub async fn set_position(&self, device_id: &str, position: Duration) -> Result<Duration> {
        self.dispatcher.set_position(device_id, position).await
    }

    /// Track last loaded on the device, if any
    pub fn track(&self, device_id: &str) -> Result<Option<TrackState>> {
        self.dispatcher.track(device_id)
    }

    /// Mark a renderer as the host's active speaker, polling its position while active
    pub fn set_active(&self, device_id: &str, active: bool) -> Result<()> {
        self.sync.set_active(device_id, active)
    }

    /// Run a host flow action against a device
    pub async fn run_flow_action(&self, device_id: &str, action: FlowAction) -> Result<()> {
        tracing::debug!("Flow action {:?} on {}", action, device_id);
        match action {
            FlowAction::Play => self.set_speaker_playing(device_id, true).await.map(drop),
            FlowAction::Pause => self.set_speaker_playing(device_id, false).await.map(drop),
            FlowAction::Prev => self.previous(device_id).await,
            FlowAction::Next => self.next(device_id).await,
            FlowAction::VolumeSet(volume) => self.set_volume(device_id, volume).await.map(drop),
        }
    }

    /// Stop scanning and disconnect every device
    pub async fn shutdown(&self) {
        self.scanner.shutdown().await;
        self.registry.shutdown().await;
    }
}

/// Host flow actions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum FlowAction {
    Play,
    Pause,
    Prev,
    Next,
    VolumeSet(f64),
}

/// Requests a host sends during pairing
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PairingRequest {
    ListDevices,
}

/// Answers pairing requests from the found-device table
pub struct PairingSession<'a> {
    driver: &'a Driver,
}

impl PairingSession<'_> {
    /// Answer a pairing request
    pub fn handle(&self, request: &PairingRequest) -> Vec<PairingCandidate> {
        match request {
            PairingRequest::ListDevices => self.driver.list_devices(),
        }
    }

    /// Handle a raw JSON request such as `{"event":"list_devices"}`
    pub fn handle_json(&self, request: &str) -> Result<serde_json::Value> {
        let request: PairingRequest = serde_json::from_str(request)?;
        Ok(serde_json::to_value(self.handle(&request))?)
    }
}
