//! Driver configuration.
//!
//! Durations are expressed in milliseconds when (de)serialized.

use crate::error::{DriverError, Result};
use crate::types::ProtocolFamily;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Search target answered by HEOS players
pub const HEOS_SEARCH_TARGET: &str = "urn:schemas-denon-com:device:ACT-Denon:1";

/// Search target answered by UPnP media renderers
pub const MEDIA_RENDERER_SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";

/// Service a media renderer must expose to be usable
pub const AV_TRANSPORT_SERVICE_ID: &str = "urn:upnp-org:serviceId:AVTransport";

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanConfig {
    /// Search target sent with every probe; responses for other targets are ignored
    pub search_target: String,

    /// Service id a description must contain, if any
    pub required_service: Option<String>,

    /// Length of a scan window when none is given
    #[serde(with = "millis")]
    pub scan_window: Duration,

    /// Interval of the background rescan
    #[serde(with = "millis")]
    pub rescan_interval: Duration,

    /// Time before a rejected response may be resolved again
    #[serde(with = "millis")]
    pub retry_cooldown: Duration,

    /// Found entries not advertised for this long are expired (renderer family only)
    #[serde(with = "millis")]
    pub stale_after: Duration,

    /// Delay before an unavailable device's found entries are dropped
    #[serde(with = "millis")]
    pub removal_grace: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            search_target: MEDIA_RENDERER_SEARCH_TARGET.to_string(),
            required_service: Some(AV_TRANSPORT_SERVICE_ID.to_string()),
            scan_window: Duration::from_secs(10),
            rescan_interval: Duration::from_secs(2 * 60),
            retry_cooldown: Duration::from_secs(60),
            stale_after: Duration::from_secs(5 * 60),
            removal_grace: Duration::from_secs(1),
        }
    }
}

/// Top-level driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverConfig {
    pub family: ProtocolFamily,

    pub scan: ScanConfig,

    /// Interval of position/transport polling while a renderer is the active speaker
    #[serde(with = "millis")]
    pub active_poll_interval: Duration,

    /// Capacity of the host event channel
    pub event_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::media_renderer()
    }
}

impl DriverConfig {
    /// Settings for HEOS players
    pub fn heos() -> Self {
        Self {
            family: ProtocolFamily::Heos,
            scan: ScanConfig {
                search_target: HEOS_SEARCH_TARGET.to_string(),
                required_service: None,
                ..ScanConfig::default()
            },
            ..Self::media_renderer()
        }
    }

    /// Settings for UPnP media renderers
    pub fn media_renderer() -> Self {
        Self {
            family: ProtocolFamily::MediaRenderer,
            scan: ScanConfig::default(),
            active_poll_interval: Duration::from_secs(5),
            event_capacity: 100,
        }
    }

    /// Parse a JSON configuration document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject periods the background tasks cannot run with
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("scanWindow", self.scan.scan_window),
            ("rescanInterval", self.scan.rescan_interval),
            ("activePollInterval", self.active_poll_interval),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(DriverError::InvalidValue(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
