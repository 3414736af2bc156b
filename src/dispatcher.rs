//! Capability commands issued through a device's protocol client.

use crate::device::{fan_out_playing, Binding, DeviceSnapshot, PendingLoad, Shared};
use crate::error::{DriverError, Result};
use crate::protocol::{fraction_to_level, PlayState};
use crate::registry::DeviceRegistry;
use crate::subscription::DriverEvent;
use crate::types::{Capability, LoadOptions, Track, TrackMetadata, TrackState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use uuid::Uuid;

/// Translates capability calls into protocol client calls and keeps the cache in step
///
/// Reads never touch the network. Writes update the cache only once the client confirms,
/// with the exception of group peers on play/pause which are written as soon as the
/// command is issued.
#[derive(Clone)]
pub(crate) struct CommandDispatcher {
    shared: Arc<Shared>,
    registry: DeviceRegistry,
}

impl CommandDispatcher {
    pub fn new(shared: Arc<Shared>, registry: DeviceRegistry) -> Self {
        Self { shared, registry }
    }

    pub fn device(&self, device_id: &str) -> Result<DeviceSnapshot> {
        self.shared.lookup(device_id)
    }

    pub fn playing(&self, device_id: &str) -> Result<bool> {
        self.shared
            .lookup(device_id)?
            .playback
            .is_playing
            .ok_or_else(|| DriverError::UnresolvedState {
                device_id: device_id.to_string(),
                field: "speaker_playing",
            })
    }

    pub fn volume(&self, device_id: &str) -> Result<f64> {
        self.shared
            .lookup(device_id)?
            .playback
            .volume
            .ok_or_else(|| DriverError::UnresolvedState {
                device_id: device_id.to_string(),
                field: "volume_set",
            })
    }

    pub fn track(&self, device_id: &str) -> Result<Option<TrackState>> {
        Ok(self.shared.lookup(device_id)?.track)
    }

    /// Play or pause, addressed to the group when grouped
    pub async fn set_playing(&self, device_id: &str, playing: bool) -> Result<bool> {
        let binding = self.shared.binding(device_id)?;

        // Peers are written when the command is issued, not when it resolves
        if let Some(group_id) = &binding.group_id {
            let mut devices = self.shared.lock();
            for peer in fan_out_playing(&mut devices, device_id, group_id, playing) {
                self.shared.emit_playing(&peer, playing);
            }
        }

        let result = binding
            .client
            .set_play_state(binding.command_target(), PlayState::from_playing(playing))
            .await;
        self.check(device_id, &binding, result)?;
        self.shared
            .with_current(device_id, binding.session, |d| d.set_playing(playing));
        Ok(playing)
    }

    pub async fn previous(&self, device_id: &str) -> Result<()> {
        let binding = self.shared.binding(device_id)?;
        let result = binding.client.play_previous(binding.command_target()).await;
        self.check(device_id, &binding, result)
    }

    pub async fn next(&self, device_id: &str) -> Result<()> {
        let binding = self.shared.binding(device_id)?;
        let result = binding.client.play_next(binding.command_target()).await;
        self.check(device_id, &binding, result)
    }

    /// Set the unit's own volume; groups never share volume
    pub async fn set_volume(&self, device_id: &str, volume: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(DriverError::InvalidValue(format!(
                "volume {} outside [0, 1]",
                volume
            )));
        }
        let binding = self.shared.binding(device_id)?;
        let level = fraction_to_level(volume);
        let result = binding.client.set_volume(&binding.player_id, level).await;
        self.check(device_id, &binding, result)?;

        self.shared
            .with_current(device_id, binding.session, |d| d.set_volume(volume));
        Ok(volume)
    }

    pub async fn muted(&self, device_id: &str) -> Result<bool> {
        let binding = self.media_binding(device_id, Capability::VolumeMute)?;
        let result = binding.client.mute().await;
        self.check(device_id, &binding, result)
    }

    pub async fn set_muted(&self, device_id: &str, mute: bool) -> Result<bool> {
        let binding = self.media_binding(device_id, Capability::VolumeMute)?;
        let result = binding.client.set_mute(mute).await;
        self.check(device_id, &binding, result)?;
        Ok(mute)
    }

    /// Seek a renderer; the position is sent in whole seconds
    pub async fn set_position(&self, device_id: &str, position: Duration) -> Result<Duration> {
        let binding = self.media_binding(device_id, Capability::SpeakerPlaying)?;
        let result = binding.client.seek(whole_seconds(position)).await;
        self.check(device_id, &binding, result)?;

        self.shared.with_current(device_id, binding.session, |d| {
            if let Some(track) = d.track.as_mut() {
                track.position = Some(position);
            }
        });
        Ok(position)
    }

    /// Load a track on a renderer, optionally after a delay
    ///
    /// A request still waiting for its delay is cancelled by the next request for the same
    /// device and its caller receives [`DriverError::Debounced`].
    pub async fn load_track(
        &self,
        device_id: &str,
        track: Track,
        options: LoadOptions,
    ) -> Result<Track> {
        let binding = self.media_binding(device_id, Capability::SpeakerPlaying)?;
        let delay = options.delay.filter(|d| !d.is_zero());

        let Some(delay) = delay else {
            self.cancel_pending_load(device_id, binding.session);
            return self.execute_load(device_id, binding, track, options).await;
        };

        let (reply, rx) = oneshot::channel();
        {
            let mut devices = self.shared.lock();
            let device = devices
                .get_mut(device_id)
                .filter(|d| d.session() == binding.session)
                .ok_or_else(|| DriverError::NotFound(device_id.to_string()))?;
            if let Some(pending) = device.pending_load.take() {
                tracing::debug!("Debouncing pending load on {}", device_id);
                pending.cancel(DriverError::Debounced);
            }

            let token = Uuid::new_v4();
            let timer = self.spawn_delayed_load(device_id.to_string(), token, delay, track, options);
            device.pending_load = Some(PendingLoad {
                token,
                reply,
                timer,
            });
        }

        rx.await.unwrap_or(Err(DriverError::ConnectionClosed))
    }

    fn spawn_delayed_load(
        &self,
        device_id: String,
        token: Uuid,
        delay: Duration,
        track: Track,
        options: LoadOptions,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let reply = {
                let mut devices = dispatcher.shared.lock();
                let Some(device) = devices.get_mut(&device_id) else { return };
                match device.pending_load.take() {
                    Some(pending) if pending.token == token => pending.reply,
                    other => {
                        device.pending_load = other;
                        return;
                    }
                }
            };
            let result = match dispatcher.shared.binding(&device_id) {
                Ok(binding) => {
                    dispatcher
                        .execute_load(&device_id, binding, track, options)
                        .await
                }
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        })
    }

    fn cancel_pending_load(&self, device_id: &str, session: Uuid) {
        let pending = self
            .shared
            .with_current(device_id, session, |d| d.pending_load.take())
            .flatten();
        if let Some(pending) = pending {
            tracing::debug!("Debouncing pending load on {}", device_id);
            pending.cancel(DriverError::Debounced);
        }
    }

    /// Only the load call itself can fail the operation; seek and play are best-effort
    async fn execute_load(
        &self,
        device_id: &str,
        binding: Binding,
        track: Track,
        options: LoadOptions,
    ) -> Result<Track> {
        let session = binding.session;
        self.shared.update_playing(device_id, session, false);

        let metadata = TrackMetadata::from(&track);
        let loaded = binding.client.load(&track.stream_url, &metadata).await;
        self.check(device_id, &binding, loaded)?;
        tracing::info!("Loaded {} on {}", track.title, device_id);

        if let Some(position) = options.position {
            if let Err(e) = binding.client.seek(whole_seconds(position)).await {
                tracing::warn!("Seek after load on {} failed: {}", device_id, e);
            }
        }
        if options.start_playing {
            let play = binding
                .client
                .set_play_state(binding.command_target(), PlayState::Play)
                .await;
            if let Err(e) = play {
                tracing::warn!("Start playing after load on {} failed: {}", device_id, e);
            }
        }

        let state = TrackState {
            track: track.clone(),
            position: options.position,
        };
        self.shared.with_current(device_id, session, |d| {
            d.track = Some(state.clone());
            self.shared.emit(DriverEvent::TrackChanged {
                device_id: device_id.to_string(),
                track: state,
            });
        });
        self.shared
            .update_playing(device_id, session, options.start_playing);
        Ok(track)
    }

    fn media_binding(&self, device_id: &str, capability: Capability) -> Result<Binding> {
        let binding = self.shared.binding(device_id)?;
        if !binding.family.supports_media() {
            return Err(DriverError::CapabilityMismatch {
                capability,
                family: binding.family,
            });
        }
        Ok(binding)
    }

    /// Pass a client result through, handing a lost connection to the registry
    fn check<T>(&self, device_id: &str, binding: &Binding, result: Result<T>) -> Result<T> {
        if let Err(DriverError::ConnectionClosed) = &result {
            self.registry
                .connection_failed(device_id, binding.session, "connection closed");
        }
        result
    }
}

/// Milliseconds rounded to the nearest second
fn whole_seconds(position: Duration) -> u64 {
    (position.as_millis() as f64 / 1000.0).round() as u64
}
