use crate::error::{DriverError, Result};
use crate::protocol::Notification;
use crate::types::{Capability, CapabilityValue, DeviceId, TrackState};
use std::time::Duration;
use tokio::sync::broadcast;

/// Event delivered to the host
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// A capability value changed on a device
    Realtime {
        device_id: DeviceId,
        capability: Capability,
        value: CapabilityValue,
    },

    /// A device became available
    Available(DeviceId),

    /// A device became unavailable
    Unavailable { device_id: DeviceId, reason: String },

    /// A track was loaded on a device
    TrackChanged { device_id: DeviceId, track: TrackState },

    /// Playback position reported by active-speaker polling
    PositionChanged { device_id: DeviceId, position: Duration },
}

impl DriverEvent {
    /// Device the event is about
    pub fn device_id(&self) -> &str {
        match self {
            DriverEvent::Realtime { device_id, .. }
            | DriverEvent::Unavailable { device_id, .. }
            | DriverEvent::TrackChanged { device_id, .. }
            | DriverEvent::PositionChanged { device_id, .. } => device_id,
            DriverEvent::Available(device_id) => device_id,
        }
    }
}

/// Receiver for driver events
pub struct StateReceiver {
    rx: broadcast::Receiver<DriverEvent>,
}

impl StateReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<DriverEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with [`DriverError::ConnectionClosed`] once the driver is dropped.
    pub async fn recv(&mut self) -> Result<DriverEvent> {
        self.rx.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<DriverEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(DriverError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(DriverError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}

/// Receiver for a protocol client's notification stream
pub struct NotificationReceiver {
    rx: broadcast::Receiver<Notification>,
}

impl NotificationReceiver {
    /// Wrap the receiving end of a client's notification channel
    pub fn new(rx: broadcast::Receiver<Notification>) -> Self {
        Self { rx }
    }

    /// Receive the next notification
    ///
    /// [`DriverError::ConnectionClosed`] means the client dropped its sender and no more
    /// notifications will arrive. [`DriverError::ChannelError`] reports skipped messages.
    pub async fn recv(&mut self) -> Result<Notification> {
        self.rx.recv().await.map_err(map_recv_error)
    }
}

impl From<broadcast::Receiver<Notification>> for NotificationReceiver {
    fn from(rx: broadcast::Receiver<Notification>) -> Self {
        Self::new(rx)
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> DriverError {
    match e {
        broadcast::error::RecvError::Closed => DriverError::ConnectionClosed,
        broadcast::error::RecvError::Lagged(n) => {
            DriverError::ChannelError(format!("Lagged by {} messages", n))
        }
    }
}
