use crate::types::{Capability, DeviceId, ProtocolFamily};
use thiserror::Error;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur when discovering or controlling devices
#[derive(Error, Debug)]
pub enum DriverError {
    /// The device id is unknown or not bound to a live client
    #[error("Device not found or not initialized: {0}")]
    NotFound(DeviceId),

    /// The device is bound but has no resolved player identifier yet
    #[error("Device unavailable: {0}")]
    Unavailable(DeviceId),

    /// Network or protocol failure reported by a protocol client
    #[error("Transport error: {0}")]
    Transport(String),

    /// State was queried before any poll or notification populated it
    #[error("Device state is unknown: {field} of {device_id}")]
    UnresolvedState {
        /// Device whose state was queried
        device_id: DeviceId,
        /// Name of the unresolved field
        field: &'static str,
    },

    /// A pending load-track request was superseded by a newer one
    #[error("setTrack debounced")]
    Debounced,

    /// The device's protocol family does not support the capability
    #[error("Capability {capability} is not supported by {family} devices")]
    CapabilityMismatch {
        /// Requested capability
        capability: Capability,
        /// Family of the targeted device
        family: ProtocolFamily,
    },

    /// A capability value was out of range or of the wrong kind
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Request timed out waiting for response
    #[error("Request timeout")]
    Timeout,

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid or unexpected response from a device
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
