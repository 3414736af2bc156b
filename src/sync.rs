//! Reconciles cached device state with polls and pushed notifications.

use crate::device::{fan_out_playing, Shared};
use crate::error::{DriverError, Result};
use crate::protocol::{level_to_fraction, Notification, PlayState, ProtocolClient};
use crate::subscription::{DriverEvent, NotificationReceiver};
use crate::types::{Capability, DeviceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use uuid::Uuid;

/// Keeps cached play state, volume and group membership current
///
/// Every write is checked against the connection session it was started for, so a
/// listener or poll belonging to a replaced client cannot touch the new binding.
#[derive(Clone)]
pub(crate) struct StateSynchronizer {
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl StateSynchronizer {
    pub fn new(shared: Arc<Shared>, poll_interval: Duration) -> Self {
        Self {
            shared,
            poll_interval,
        }
    }

    /// Seed the cache with one volume poll and one play-state poll
    ///
    /// Poll failures are logged and leave the cache as it was.
    pub async fn seed(
        &self,
        device_id: &str,
        session: Uuid,
        client: &Arc<dyn ProtocolClient>,
        player_id: &str,
    ) {
        match client.volume(player_id).await {
            Ok(level) => {
                self.store_volume(device_id, session, level_to_fraction(level));
            }
            Err(e) => tracing::warn!("Initial volume poll for {} failed: {}", device_id, e),
        }
        match client.play_state(player_id).await {
            Ok(state) => {
                self.shared
                    .update_playing(device_id, session, state.is_playing());
            }
            Err(e) => tracing::warn!("Initial play state poll for {} failed: {}", device_id, e),
        }
    }

    /// Dispatch notifications one at a time until the stream closes
    pub async fn run(&self, device_id: DeviceId, session: Uuid, mut rx: NotificationReceiver) {
        loop {
            match rx.recv().await {
                Ok(notification) => self.handle(&device_id, session, notification).await,
                Err(DriverError::ChannelError(msg)) => {
                    tracing::warn!("Notifications for {}: {}", device_id, msg);
                }
                Err(_) => break,
            }
        }
        tracing::debug!("Notification stream for {} closed", device_id);
    }

    pub async fn handle(&self, device_id: &str, session: Uuid, notification: Notification) {
        match notification {
            Notification::VolumeChanged { player_id, level } => {
                self.apply_volume(device_id, session, &player_id, level);
            }
            Notification::StateChanged { player_id, state } => {
                self.apply_play_state(device_id, session, &player_id, state);
            }
            Notification::GroupsChanged => self.refresh_group(device_id, session).await,
        }
    }

    /// Apply a volume notification addressed to `player_id`
    ///
    /// Only the device's own player id matches; volume never fans out to a group.
    pub fn apply_volume(&self, device_id: &str, session: Uuid, player_id: &str, level: u8) -> bool {
        let volume = level_to_fraction(level);
        self.shared
            .with_current(device_id, session, |d| {
                if d.player_id.as_deref() != Some(player_id) {
                    return false;
                }
                let changed = d.set_volume(volume);
                if changed {
                    self.shared.emit_volume(device_id, volume);
                }
                changed
            })
            .unwrap_or(false)
    }

    /// Apply a play-state notification addressed to a player or group id
    ///
    /// When the device's cached state changes and it is grouped, every other device of the
    /// group is updated within the same lock.
    pub fn apply_play_state(
        &self,
        device_id: &str,
        session: Uuid,
        target: &str,
        state: PlayState,
    ) -> bool {
        let playing = state.is_playing();
        let mut devices = self.shared.lock();
        let Some(device) = devices
            .get_mut(device_id)
            .filter(|d| d.session() == session)
        else {
            return false;
        };

        let addressed = device.player_id.as_deref() == Some(target) || device.in_group(target);
        if !addressed {
            return false;
        }
        if !device.set_playing(playing) {
            tracing::debug!("Play state of {} unchanged", device_id);
            return false;
        }
        self.shared.emit_playing(device_id, playing);

        if let Some(group_id) = device.group_id.clone() {
            for peer in fan_out_playing(&mut devices, device_id, &group_id, playing) {
                self.shared.emit_playing(&peer, playing);
            }
        }
        true
    }

    /// Re-resolve the device's group id after a groups-changed notification
    pub async fn refresh_group(&self, device_id: &str, session: Uuid) {
        let binding = match self.shared.binding(device_id) {
            Ok(binding) if binding.session == session => binding,
            _ => return,
        };
        match binding.client.player_info(&binding.player_id).await {
            Ok(info) => {
                self.shared.with_current(device_id, session, |d| {
                    d.set_group(info.group_id);
                    tracing::info!(
                        "Player {} is now in group {:?}",
                        binding.player_id,
                        d.group_id
                    );
                });
            }
            Err(e) => tracing::warn!("Could not refresh group of {}: {}", device_id, e),
        }
    }

    fn store_volume(&self, device_id: &str, session: Uuid, volume: f64) {
        self.shared.with_current(device_id, session, |d| {
            if d.set_volume(volume) {
                self.shared.emit_volume(device_id, volume);
            }
        });
    }

    /// Start or stop position/transport polling for a renderer
    pub fn set_active(&self, device_id: &str, active: bool) -> Result<()> {
        let binding = self.shared.binding(device_id)?;
        if !binding.family.supports_media() {
            return Err(DriverError::CapabilityMismatch {
                capability: Capability::SpeakerPlaying,
                family: binding.family,
            });
        }

        let mut poller = active.then(|| {
            self.spawn_poller(device_id.to_string(), binding.session, binding.client.clone())
        });
        let installed = self.shared.with_current(device_id, binding.session, |d| {
            d.connection.set_poller(poller.take());
        });
        if installed.is_none() {
            if let Some(task) = poller {
                task.abort();
            }
            return Err(DriverError::NotFound(device_id.to_string()));
        }
        tracing::debug!("Active speaker polling for {}: {}", device_id, active);
        Ok(())
    }

    fn spawn_poller(
        &self,
        device_id: DeviceId,
        session: Uuid,
        client: Arc<dyn ProtocolClient>,
    ) -> JoinHandle<()> {
        let sync = self.clone();
        let every = self.poll_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                sync.poll_once(&device_id, session, &client).await;
            }
        })
    }

    async fn poll_once(&self, device_id: &str, session: Uuid, client: &Arc<dyn ProtocolClient>) {
        match client.position().await {
            Ok(secs) => {
                let position = Duration::from_secs(secs);
                self.shared.with_current(device_id, session, |d| {
                    if let Some(track) = d.track.as_mut() {
                        track.position = Some(position);
                    }
                    self.shared.emit(DriverEvent::PositionChanged {
                        device_id: device_id.to_string(),
                        position,
                    });
                });
            }
            Err(e) => tracing::debug!("Position poll for {} failed: {}", device_id, e),
        }
        match client.transport_info().await {
            Ok(info) => {
                self.shared
                    .update_playing(device_id, session, info.is_playing());
            }
            Err(e) => tracing::debug!("Transport poll for {} failed: {}", device_id, e),
        }
    }
}
