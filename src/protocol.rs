//! Capability set the driver consumes from a protocol client.
//!
//! Concrete clients (HEOS binary protocol, UPnP/SOAP renderer) live outside this crate and
//! are handed in through a [`ClientFactory`].

use crate::error::{DriverError, Result};
use crate::subscription::NotificationReceiver;
use crate::types::{Capability, DeviceDescriptor, GroupId, PlayerId, ProtocolFamily, TrackMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Transport play state as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Play,
    Pause,
    Stop,
}

impl PlayState {
    /// Parse a wire state; anything but `play`/`pause` counts as stopped
    pub fn from_wire(state: &str) -> Self {
        match state {
            "play" => PlayState::Play,
            "pause" => PlayState::Pause,
            _ => PlayState::Stop,
        }
    }

    /// `Play` when playing, `Pause` otherwise
    pub fn from_playing(playing: bool) -> Self {
        if playing {
            PlayState::Play
        } else {
            PlayState::Pause
        }
    }

    /// Only `Play` counts as playing
    pub fn is_playing(&self) -> bool {
        matches!(self, PlayState::Play)
    }
}

/// Player entry returned by [`ProtocolClient::players`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Network address of the unit
    pub address: String,
    pub player_id: PlayerId,
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

/// Renderer transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    Playing,
    PausedPlayback,
    Stopped,
    Transitioning,
    NoMediaPresent,
}

/// Result of a renderer `GetTransportInfo` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    #[serde(rename = "CurrentTransportState")]
    pub state: TransportState,
}

impl TransportInfo {
    /// Only `PLAYING` counts; transitioning does not
    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }
}

/// Asynchronous state-change notification pushed by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Volume of a player changed, level in 0..=100
    VolumeChanged { player_id: PlayerId, level: u8 },

    /// Play state of a player or a group changed
    StateChanged { player_id: String, state: PlayState },

    /// Group membership changed somewhere; the payload carries no ids
    GroupsChanged,
}

/// Convert a wire volume level (0..=100) to a unit fraction
pub fn level_to_fraction(level: u8) -> f64 {
    f64::from(level.min(100)) / 100.0
}

/// Convert a unit fraction to a wire volume level
pub fn fraction_to_level(fraction: f64) -> u8 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Per-device protocol adapter
///
/// One instance serves exactly one bound device. Renderer-only operations default to a
/// [`DriverError::CapabilityMismatch`] so the binary family need not implement them.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Protocol family this client speaks
    fn family(&self) -> ProtocolFamily;

    /// Open the connection to the unit at `address`
    async fn connect(&self, address: &str) -> Result<()>;

    /// Close the connection; must be safe to call on a client that never connected
    async fn disconnect(&self);

    /// List the players reachable through this connection
    async fn players(&self) -> Result<Vec<PlayerInfo>>;

    /// Fetch a single player's current info (used to re-resolve its group)
    async fn player_info(&self, player_id: &str) -> Result<PlayerInfo>;

    /// Volume level in 0..=100
    async fn volume(&self, player_id: &str) -> Result<u8>;

    /// Set the volume level (0..=100) of a single player
    async fn set_volume(&self, player_id: &str, level: u8) -> Result<()>;

    /// Current play state of a player
    async fn play_state(&self, player_id: &str) -> Result<PlayState>;

    /// `target` is a group id or a player id
    async fn set_play_state(&self, target: &str, state: PlayState) -> Result<()>;

    /// Skip back on a group or player
    async fn play_previous(&self, target: &str) -> Result<()>;

    /// Skip forward on a group or player
    async fn play_next(&self, target: &str) -> Result<()>;

    /// Subscribe to this connection's notification stream
    fn subscribe(&self) -> NotificationReceiver;

    /// Load a stream URL with its metadata as the current transport URI
    async fn load(&self, _url: &str, _metadata: &TrackMetadata) -> Result<()> {
        Err(self.unsupported(Capability::SpeakerPlaying))
    }

    /// Seek to an absolute position in seconds
    async fn seek(&self, _position_secs: u64) -> Result<()> {
        Err(self.unsupported(Capability::SpeakerPlaying))
    }

    /// Current playback position in seconds
    async fn position(&self) -> Result<u64> {
        Err(self.unsupported(Capability::SpeakerPlaying))
    }

    /// Renderer transport state
    async fn transport_info(&self) -> Result<TransportInfo> {
        Err(self.unsupported(Capability::SpeakerPlaying))
    }

    /// Whether the renderer is muted
    async fn mute(&self) -> Result<bool> {
        Err(self.unsupported(Capability::VolumeMute))
    }

    /// Mute or unmute the renderer
    async fn set_mute(&self, _mute: bool) -> Result<()> {
        Err(self.unsupported(Capability::VolumeMute))
    }

    #[doc(hidden)]
    fn unsupported(&self, capability: Capability) -> DriverError {
        DriverError::CapabilityMismatch {
            capability,
            family: self.family(),
        }
    }
}

/// Creates a fresh client for a discovered device
pub trait ClientFactory: Send + Sync {
    /// Build an unconnected client for `descriptor`
    fn create(&self, descriptor: &DeviceDescriptor) -> Arc<dyn ProtocolClient>;
}

impl<F> ClientFactory for F
where
    F: Fn(&DeviceDescriptor) -> Arc<dyn ProtocolClient> + Send + Sync,
{
    fn create(&self, descriptor: &DeviceDescriptor) -> Arc<dyn ProtocolClient> {
        self(descriptor)
    }
}
