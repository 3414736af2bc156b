use crate::connection::DeviceConnection;
use crate::error::{DriverError, Result};
use crate::protocol::ProtocolClient;
use crate::subscription::{DriverEvent, StateReceiver};
use crate::types::{
    Capability, CapabilityValue, DeviceId, GroupId, PairedDevice, PlayerId, ProtocolFamily,
    Track, TrackState,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle of a bound device
///
/// A paired device that has not been found yet has no record at all; see
/// `Driver::is_waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    PollingInitialState,
    Available,
    Unavailable,
    Removed,
}

/// Cached playback state; `None` until a poll or notification populates it
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackState {
    pub is_playing: Option<bool>,
    /// Unit fraction in [0, 1]
    pub volume: Option<f64>,
}

/// Point-in-time view of a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub name: String,
    pub family: ProtocolFamily,
    pub address: String,
    pub player_id: Option<PlayerId>,
    pub group_id: Option<GroupId>,
    pub lifecycle: Lifecycle,
    pub playback: PlaybackState,
    pub track: Option<TrackState>,
    pub active: bool,
}

/// Load-track request waiting for its delay to elapse
pub(crate) struct PendingLoad {
    pub token: Uuid,
    pub reply: oneshot::Sender<Result<Track>>,
    pub timer: JoinHandle<()>,
}

impl PendingLoad {
    /// Stop the timer and tell the waiting caller why
    pub fn cancel(self, error: DriverError) {
        self.timer.abort();
        let _ = self.reply.send(Err(error));
    }
}

/// A paired, operationally tracked device
pub(crate) struct Device {
    pub data: PairedDevice,
    pub name: String,
    pub family: ProtocolFamily,
    pub connection: DeviceConnection,
    pub player_id: Option<PlayerId>,
    pub group_id: Option<GroupId>,
    pub lifecycle: Lifecycle,
    pub playback: PlaybackState,
    pub track: Option<TrackState>,
    pub pending_load: Option<PendingLoad>,
}

impl Device {
    pub fn new(
        data: PairedDevice,
        name: String,
        family: ProtocolFamily,
        connection: DeviceConnection,
    ) -> Self {
        Self {
            data,
            name,
            family,
            connection,
            player_id: None,
            group_id: None,
            lifecycle: Lifecycle::Connecting,
            playback: PlaybackState::default(),
            track: None,
            pending_load: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.data.id
    }

    pub fn session(&self) -> Uuid {
        self.connection.session()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.data.id.clone(),
            name: self.name.clone(),
            family: self.family,
            address: self.connection.address().to_string(),
            player_id: self.player_id.clone(),
            group_id: self.group_id.clone(),
            lifecycle: self.lifecycle,
            playback: self.playback,
            track: self.track.clone(),
            active: self.connection.is_polling(),
        }
    }

    /// Store a play state; returns whether the cached value changed
    pub fn set_playing(&mut self, playing: bool) -> bool {
        let changed = self.playback.is_playing != Some(playing);
        self.playback.is_playing = Some(playing);
        changed
    }

    /// Store a volume fraction; returns whether the cached value changed
    pub fn set_volume(&mut self, volume: f64) -> bool {
        let changed = self.playback.volume != Some(volume);
        self.playback.volume = Some(volume);
        changed
    }

    pub fn set_group(&mut self, group_id: Option<GroupId>) {
        self.group_id = group_id.filter(|g| !g.is_empty());
    }

    pub fn in_group(&self, group_id: &str) -> bool {
        self.group_id.as_deref() == Some(group_id)
    }
}

/// What a command needs from a bound device
pub(crate) struct Binding {
    pub session: Uuid,
    pub family: ProtocolFamily,
    pub client: Arc<dyn ProtocolClient>,
    pub player_id: PlayerId,
    pub group_id: Option<GroupId>,
}

impl Binding {
    /// Group id when grouped, else the player id
    pub fn command_target(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.player_id)
    }
}

pub(crate) type DeviceMap = HashMap<DeviceId, Device>;

/// Device collection and host event channel shared by registry, synchronizer and dispatcher
pub(crate) struct Shared {
    devices: Mutex<DeviceMap>,
    events: broadcast::Sender<DriverEvent>,
}

impl Shared {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            devices: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> StateReceiver {
        StateReceiver::new(self.events.subscribe())
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceMap> {
        self.devices.lock()
    }

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_playing(&self, device_id: &str, playing: bool) {
        self.emit(DriverEvent::Realtime {
            device_id: device_id.to_string(),
            capability: Capability::SpeakerPlaying,
            value: CapabilityValue::Bool(playing),
        });
    }

    pub fn emit_volume(&self, device_id: &str, volume: f64) {
        self.emit(DriverEvent::Realtime {
            device_id: device_id.to_string(),
            capability: Capability::VolumeSet,
            value: CapabilityValue::Volume(volume),
        });
    }

    pub fn lookup(&self, device_id: &str) -> Result<DeviceSnapshot> {
        self.lock()
            .get(device_id)
            .map(Device::snapshot)
            .ok_or_else(|| DriverError::NotFound(device_id.to_string()))
    }

    pub fn binding(&self, device_id: &str) -> Result<Binding> {
        let devices = self.lock();
        let device = devices
            .get(device_id)
            .ok_or_else(|| DriverError::NotFound(device_id.to_string()))?;
        let player_id = device
            .player_id
            .clone()
            .ok_or_else(|| DriverError::Unavailable(device_id.to_string()))?;
        Ok(Binding {
            session: device.session(),
            family: device.family,
            client: device.connection.client(),
            player_id,
            group_id: device.group_id.clone(),
        })
    }

    /// Run `f` on the device only if it is still bound to `session`
    pub fn with_current<R>(
        &self,
        device_id: &str,
        session: Uuid,
        f: impl FnOnce(&mut Device) -> R,
    ) -> Option<R> {
        let mut devices = self.lock();
        devices
            .get_mut(device_id)
            .filter(|d| d.session() == session)
            .map(f)
    }

    pub fn is_current(&self, device_id: &str, session: Uuid) -> bool {
        self.with_current(device_id, session, |_| ()).is_some()
    }

    /// Write a play state to the device, emitting only on change
    ///
    /// Events are sent while the device lock is held so their order matches the order of
    /// the cache writes.
    pub fn update_playing(&self, device_id: &str, session: Uuid, playing: bool) -> bool {
        self.with_current(device_id, session, |d| {
            let changed = d.set_playing(playing);
            if changed {
                self.emit_playing(device_id, playing);
            }
            changed
        })
        .unwrap_or(false)
    }

    /// Mark the device unavailable if it is still bound to `session`
    pub fn mark_unavailable(&self, device_id: &str, session: Uuid, reason: &str) {
        self.with_current(device_id, session, |d| {
            if d.lifecycle == Lifecycle::Unavailable {
                return;
            }
            d.lifecycle = Lifecycle::Unavailable;
            tracing::warn!("Device {} unavailable: {}", device_id, reason);
            self.emit(DriverEvent::Unavailable {
                device_id: device_id.to_string(),
                reason: reason.to_string(),
            });
        });
    }
}

/// Write `playing` to every device in `group_id` except `source`
///
/// Returns the ids whose cached value changed.
pub(crate) fn fan_out_playing(
    devices: &mut DeviceMap,
    source: &str,
    group_id: &str,
    playing: bool,
) -> Vec<DeviceId> {
    devices
        .values_mut()
        .filter(|d| d.id() != source && d.in_group(group_id))
        .filter_map(|d| d.set_playing(playing).then(|| d.id().to_string()))
        .collect()
}
