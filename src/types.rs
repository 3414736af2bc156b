use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Stable device identifier (the UDN of the device description)
pub type DeviceId = String;

/// Protocol-assigned id of an individual physical unit
pub type PlayerId = String;

/// Protocol-assigned id shared by units playing in sync
pub type GroupId = String;

/// Protocol family a device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// Binary-protocol HEOS player
    Heos,
    /// UPnP/SOAP media renderer
    MediaRenderer,
}

impl ProtocolFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFamily::Heos => "heos",
            ProtocolFamily::MediaRenderer => "media_renderer",
        }
    }

    /// Whether the family supports media loading, seeking and mute
    pub fn supports_media(&self) -> bool {
        matches!(self, ProtocolFamily::MediaRenderer)
    }

    /// Whether found-device entries are dropped once no longer advertised.
    /// HEOS players rely on explicit pairing only.
    pub fn expires_found_devices(&self) -> bool {
        matches!(self, ProtocolFamily::MediaRenderer)
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-facing capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SpeakerPlaying,
    SpeakerPrev,
    SpeakerNext,
    VolumeSet,
    VolumeMute,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::SpeakerPlaying => "speaker_playing",
            Capability::SpeakerPrev => "speaker_prev",
            Capability::SpeakerNext => "speaker_next",
            Capability::VolumeSet => "volume_set",
            Capability::VolumeMute => "volume_mute",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value carried by a capability get/set
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    /// Unit fraction in [0, 1]
    Volume(f64),
    /// Trigger capabilities carry no value
    Trigger,
}

/// Headers of an SSDP search response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsdpHeaders {
    /// Unique service name, session-scoped identity of the response
    #[serde(rename = "USN")]
    pub usn: String,

    /// URL of the device description
    #[serde(rename = "LOCATION")]
    pub location: String,

    /// Search target the device answered for
    #[serde(rename = "ST")]
    pub st: String,
}

/// A discovery probe response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub headers: SsdpHeaders,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

/// Service entry of a device description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    #[serde(rename = "serviceType", default)]
    pub service_type: String,
    #[serde(rename = "controlURL", default)]
    pub control_url: Option<String>,
}

/// Device description fetched from a probe response's location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    /// Persistent unique device name
    #[serde(rename = "UDN")]
    pub udn: String,

    #[serde(rename = "friendlyName")]
    pub friendly_name: String,

    /// Services keyed by service id
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDescription>,
}

impl DeviceDescription {
    /// Whether the description lists `service_id`
    pub fn has_service(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }
}

/// A device observed on the network, independent of pairing status
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Stable identity (UDN)
    pub id: DeviceId,
    /// Session-scoped identity (USN) of the probe response that produced it
    pub usn: String,
    /// Network address (host part of the location)
    pub address: String,
    pub location: String,
    pub name: String,
    pub family: ProtocolFamily,
    pub description: DeviceDescription,
    /// Last time a probe response advertised this device
    pub last_seen: Instant,
}

impl DeviceDescriptor {
    /// Whether `id` is either of the two identifier forms of this descriptor
    pub fn matches(&self, id: &str) -> bool {
        self.id == id || self.usn == id
    }
}

/// Device data the host keeps for a paired device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    pub id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PairedDevice {
    /// Pairing data with only an id
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Entry returned by the pairing `list_devices` exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCandidate {
    pub name: String,
    pub data: PairedDevice,
}

/// Artist credit of a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Artwork URLs of a track
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artwork {
    #[serde(default)]
    pub small: Option<String>,
    #[serde(default)]
    pub medium: Option<String>,
    #[serde(default)]
    pub large: Option<String>,
}

/// Track handed over by the host for loading on a renderer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub stream_url: String,
    /// Duration in milliseconds
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub artist: Vec<Artist>,
    #[serde(default)]
    pub artwork: Artwork,
}

/// Metadata sent along with a media-load call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    pub content_type: String,
    pub title: String,
    pub duration: Option<u64>,
    pub artist: Option<String>,
    pub creator: String,
    pub album_art: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&Track> for TrackMetadata {
    fn from(track: &Track) -> Self {
        let artwork = &track.artwork;
        Self {
            content_type: "audio/mpeg".to_string(),
            title: track.title.clone(),
            duration: track.duration,
            artist: track
                .artist
                .iter()
                .find(|a| a.kind == "artist")
                .map(|a| a.name.clone()),
            creator: track
                .artist
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            album_art: artwork
                .large
                .clone()
                .or_else(|| artwork.medium.clone())
                .or_else(|| artwork.small.clone()),
            kind: "audio".to_string(),
        }
    }
}

/// Options of a load-track request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Wait this long before loading; a newer request cancels the wait
    pub delay: Option<Duration>,
    /// Seek here after loading
    pub position: Option<Duration>,
    /// Start playback after loading
    pub start_playing: bool,
}

/// Track currently loaded on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackState {
    pub track: Track,
    pub position: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> Track {
        serde_json::from_value(serde_json::json!({
            "id": "t1",
            "title": "Song",
            "stream_url": "http://host/t1.mp3",
            "duration": 180000,
            "artist": [
                { "name": "Feat", "type": "featured" },
                { "name": "Main", "type": "artist" }
            ],
            "artwork": { "small": "s.jpg", "medium": "m.jpg" }
        }))
        .unwrap()
    }

    #[test]
    fn metadata_picks_primary_artist_and_largest_artwork() {
        let meta = TrackMetadata::from(&track());
        assert_eq!(meta.artist.as_deref(), Some("Main"));
        assert_eq!(meta.creator, "Feat, Main");
        assert_eq!(meta.album_art.as_deref(), Some("m.jpg"));
        assert_eq!(meta.content_type, "audio/mpeg");
        assert_eq!(meta.duration, Some(180000));
    }

    #[test]
    fn probe_response_uses_wire_header_names() {
        let resp: ProbeResponse = serde_json::from_value(serde_json::json!({
            "headers": {
                "USN": "uuid:abc::urn:schemas-upnp-org:device:MediaRenderer:1",
                "LOCATION": "http://10.0.0.5:1400/xml/device_description.xml",
                "ST": "urn:schemas-upnp-org:device:MediaRenderer:1"
            },
            "statusCode": 200
        }))
        .unwrap();
        assert_eq!(resp.status_code, 200);
        assert!(resp.headers.usn.starts_with("uuid:abc"));
    }

    #[test]
    fn capability_names_match_host_ids() {
        let json = serde_json::to_string(&Capability::VolumeMute).unwrap();
        assert_eq!(json, "\"volume_mute\"");
        assert_eq!(Capability::SpeakerPlaying.to_string(), "speaker_playing");
    }
}
