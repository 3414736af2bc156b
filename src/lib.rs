//! Rust library for driving HEOS players and UPnP media renderers
//!
//! This library keeps a set of paired network speakers bound to live protocol clients and
//! exposes them to a home-automation host as capabilities. It supports:
//!
//! - Periodic SSDP discovery with extendable scan windows
//! - Deferred binding of paired devices that have not been found yet
//! - Cached play state and volume, kept current from polls and pushed notifications
//! - Group-aware play/pause (volume is always per unit)
//! - Debounced track loading, seeking and position polling on media renderers
//! - Realtime capability events for the host
//!
//! The wire protocols themselves are supplied by the host through [`ProtocolClient`],
//! [`ClientFactory`] and [`DiscoveryTransport`].
//!
//! # Quick Start
//!
//! ```no_run
//! use heos_renderer::{
//!     ClientFactory, DiscoveryTransport, Driver, DriverConfig, DriverEvent, PairedDevice,
//! };
//! use std::sync::Arc;
//!
//! async fn run(
//!     transport: Arc<dyn DiscoveryTransport>,
//!     factory: Arc<dyn ClientFactory>,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Driver::new(DriverConfig::heos(), transport, factory);
//!     let mut events = driver.subscribe();
//!
//!     driver.init(vec![PairedDevice::new("uuid:living-room")]).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let DriverEvent::Available(id) = &event {
//!             driver.set_volume(id, 0.25).await?;
//!             driver.set_speaker_playing(id, true).await?;
//!         }
//!         println!("{:?}", event);
//!     }
//!
//!     driver.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Discovery**: scan windows, found-device table and "found" events
//! - **Registry**: paired devices, binding and re-binding of protocol clients
//! - **Sync**: cache seeding, notification handling and group fan-out
//! - **Dispatcher**: capability commands and debounced track loads
//! - **Driver**: host-facing facade, pairing and flow actions

mod config;
mod connection;
mod device;
mod discovery;
mod dispatcher;
mod driver;
mod error;
mod protocol;
mod registry;
mod subscription;
mod sync;
mod types;

// Public exports
pub use config::{
    DriverConfig, ScanConfig, AV_TRANSPORT_SERVICE_ID, HEOS_SEARCH_TARGET,
    MEDIA_RENDERER_SEARCH_TARGET,
};
pub use device::{DeviceSnapshot, Lifecycle, PlaybackState};
pub use discovery::{DiscoveryScanner, DiscoveryTransport};
pub use driver::{Driver, FlowAction, PairingRequest, PairingSession};
pub use error::{DriverError, Result};
pub use protocol::{
    fraction_to_level, level_to_fraction, ClientFactory, Notification, PlayState, PlayerInfo,
    ProtocolClient, TransportInfo, TransportState,
};
pub use subscription::{DriverEvent, NotificationReceiver, StateReceiver};
pub use types::{
    Artist, Artwork, Capability, CapabilityValue, DeviceDescription, DeviceDescriptor, DeviceId,
    GroupId, LoadOptions, PairedDevice, PairingCandidate, PlayerId, ProbeResponse,
    ProtocolFamily, ServiceDescription, SsdpHeaders, Track, TrackMetadata, TrackState,
};
