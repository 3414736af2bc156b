use crate::connection::{self, DeviceConnection};
use crate::device::{Device, DeviceSnapshot, Lifecycle, Shared};
use crate::discovery::DiscoveryScanner;
use crate::error::{DriverError, Result};
use crate::protocol::{ClientFactory, ProtocolClient};
use crate::subscription::{DriverEvent, NotificationReceiver};
use crate::sync::StateSynchronizer;
use crate::types::{DeviceDescriptor, DeviceId, PairedDevice, ProtocolFamily};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Owns the paired set and binds each paired device to a live protocol client
///
/// A paired device with no found-device entry waits for the scanner's next "found" event
/// for its id; the wait fires at most once. Re-binding always releases the previous
/// client (listener aborted, client disconnected) before the new client connects.
#[derive(Clone)]
pub(crate) struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    shared: Arc<Shared>,
    scanner: DiscoveryScanner,
    factory: Arc<dyn ClientFactory>,
    sync: StateSynchronizer,
    family: ProtocolFamily,
    removal_grace: Duration,
    paired: Mutex<Vec<PairedDevice>>,
    /// Paired ids waiting for their device to be found
    pending: Mutex<HashSet<DeviceId>>,
    found_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(
        shared: Arc<Shared>,
        scanner: DiscoveryScanner,
        factory: Arc<dyn ClientFactory>,
        sync: StateSynchronizer,
        family: ProtocolFamily,
        removal_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                shared,
                scanner,
                factory,
                sync,
                family,
                removal_grace,
                paired: Mutex::new(Vec::new()),
                pending: Mutex::new(HashSet::new()),
                found_task: Mutex::new(None),
            }),
        }
    }

    /// Bind every paired device, deferring those not found yet
    pub async fn initialize(&self, paired: Vec<PairedDevice>) {
        *self.inner.paired.lock() = paired.clone();
        self.watch_found();
        join_all(paired.into_iter().map(|data| self.bind(data))).await;
    }

    fn watch_found(&self) {
        let mut task = self.inner.found_task.lock();
        if task.is_some() {
            return;
        }
        let mut rx = self.inner.scanner.subscribe_found();
        let weak = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(descriptor) => match weak.upgrade() {
                        Some(inner) => DeviceRegistry { inner }.on_found(&descriptor).await,
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Registry lagged, skipped {} found events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    async fn on_found(&self, descriptor: &DeviceDescriptor) {
        let matching: Vec<PairedDevice> = self
            .inner
            .paired
            .lock()
            .iter()
            .filter(|p| descriptor.matches(&p.id))
            .cloned()
            .collect();

        for data in matching {
            let was_pending = self.inner.pending.lock().remove(&data.id);
            let stale = {
                let devices = self.inner.shared.lock();
                devices.get(&data.id).is_some_and(|d| {
                    d.connection.address() != descriptor.address
                        || d.lifecycle == Lifecycle::Unavailable
                })
            };
            if was_pending || stale {
                if stale {
                    tracing::info!(
                        "Re-initializing {} at {}",
                        data.id,
                        descriptor.address
                    );
                }
                self.bind(data).await;
            }
        }
    }

    /// Bind a paired device to its found entry, replacing any previous binding
    pub async fn bind(&self, data: PairedDevice) {
        let Some(descriptor) = self.found_or_wait(&data.id) else {
            tracing::info!("Could not find device {}, waiting for it", data.id);
            return;
        };

        let client = self.inner.factory.create(&descriptor);
        let connection = DeviceConnection::new(client.clone(), descriptor.address.clone());
        let session = connection.session();
        let name = data.name.clone().unwrap_or_else(|| descriptor.name.clone());
        let device_id = data.id.clone();
        let device = Device::new(data, name, descriptor.family, connection);

        let previous = self.inner.shared.lock().insert(device_id.clone(), device);
        if let Some(old) = previous {
            Self::release(old).await;
        }

        let registry = self.clone();
        let address = descriptor.address.clone();
        tokio::spawn(async move {
            registry.establish(device_id, session, client, address).await;
        });
    }

    /// The found entry for `device_id`, or None after queueing the id for the next found event
    fn found_or_wait(&self, device_id: &str) -> Option<Arc<DeviceDescriptor>> {
        if let Some(descriptor) = self.inner.scanner.found_device(device_id) {
            return Some(descriptor);
        }
        self.inner.pending.lock().insert(device_id.to_string());
        // A found event may have been handled between the lookup and the insert. Whoever
        // takes the id out of `pending` binds.
        let descriptor = self.inner.scanner.found_device(device_id)?;
        self.inner
            .pending
            .lock()
            .remove(device_id)
            .then_some(descriptor)
    }

    /// Connect, resolve the player id, subscribe and seed the cache
    async fn establish(
        &self,
        device_id: DeviceId,
        session: Uuid,
        client: Arc<dyn ProtocolClient>,
        address: String,
    ) {
        let shared = &self.inner.shared;
        if let Err(e) = client.connect(&address).await {
            self.connection_failed(&device_id, session, &e.to_string());
            return;
        }
        // A re-bind may have released this client while it was still connecting
        if !shared.is_current(&device_id, session) {
            Self::abandon(&device_id, client, &address).await;
            return;
        }

        let players = match client.players().await {
            Ok(players) => players,
            Err(e) => {
                self.connection_failed(&device_id, session, &e.to_string());
                return;
            }
        };

        // No match is normal while a unit boots; it stays unavailable without an error
        let Some(player) = players.into_iter().find(|p| p.address == address) else {
            tracing::debug!("No player at {} for {} yet", address, device_id);
            if shared
                .with_current(&device_id, session, |d| d.lifecycle = Lifecycle::Unavailable)
                .is_none()
            {
                Self::abandon(&device_id, client, &address).await;
            }
            return;
        };

        let rx = client.subscribe();
        let attached = shared.with_current(&device_id, session, |d| {
            d.player_id = Some(player.player_id.clone());
            d.set_group(player.group_id.clone());
            d.lifecycle = Lifecycle::PollingInitialState;
            d.connection
                .attach_listener(self.spawn_listener(device_id.clone(), session, rx));
        });
        if attached.is_none() {
            Self::abandon(&device_id, client, &address).await;
            return;
        }

        self.inner
            .sync
            .seed(&device_id, session, &client, &player.player_id)
            .await;

        shared.with_current(&device_id, session, |d| {
            d.lifecycle = Lifecycle::Available;
            tracing::info!("Device {} available as player {}", device_id, player.player_id);
            shared.emit(DriverEvent::Available(device_id.clone()));
        });
    }

    fn spawn_listener(
        &self,
        device_id: DeviceId,
        session: Uuid,
        rx: NotificationReceiver,
    ) -> JoinHandle<()> {
        let sync = self.inner.sync.clone();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            sync.run(device_id.clone(), session, rx).await;
            if let Some(inner) = weak.upgrade() {
                DeviceRegistry { inner }.connection_failed(&device_id, session, "connection closed");
            }
        })
    }

    /// Mark the session's device unavailable and, for renderers, forget its found entry
    ///
    /// Called for every observed loss (connect failure, closed notification stream or a
    /// command that hit a closed connection), in any order. The forget runs after
    /// `removal_grace` only if the lost session is still bound and still unavailable.
    pub(crate) fn connection_failed(&self, device_id: &str, session: Uuid, reason: &str) {
        self.inner.shared.mark_unavailable(device_id, session, reason);
        if !self.inner.family.expires_found_devices() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.removal_grace;
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else { return };
            let lost = inner
                .shared
                .with_current(&device_id, session, |d| d.lifecycle == Lifecycle::Unavailable);
            if lost == Some(true) {
                // Let the next probe response resolve the device afresh
                inner.scanner.forget(&device_id);
            }
        });
    }

    /// Disconnect a client whose session was superseded while it was being established
    async fn abandon(device_id: &str, client: Arc<dyn ProtocolClient>, address: &str) {
        tracing::debug!("Binding for {} at {} was replaced", device_id, address);
        connection::disconnect(client, address).await;
    }

    async fn release(mut device: Device) {
        if let Some(pending) = device.pending_load.take() {
            pending.cancel(DriverError::ConnectionClosed);
        }
        let address = device.connection.address().to_string();
        let client = device.connection.release();
        connection::disconnect(client, &address).await;
    }

    /// Pair a new device and bind it
    pub async fn add_device(&self, data: PairedDevice) {
        {
            let mut paired = self.inner.paired.lock();
            paired.retain(|p| p.id != data.id);
            paired.push(data.clone());
        }
        self.watch_found();
        self.bind(data).await;
    }

    /// Unpair a device and release its client
    pub async fn remove_device(&self, device_id: &str) {
        self.inner.paired.lock().retain(|p| p.id != device_id);
        self.inner.pending.lock().remove(device_id);

        let removed = self.inner.shared.lock().remove(device_id);
        if let Some(mut device) = removed {
            device.lifecycle = Lifecycle::Removed;
            tracing::info!("Removed device {}", device_id);
            Self::release(device).await;
        }
    }

    pub fn lookup(&self, device_id: &str) -> Result<DeviceSnapshot> {
        self.inner.shared.lookup(device_id)
    }

    pub fn is_pending(&self, device_id: &str) -> bool {
        self.inner.pending.lock().contains(device_id)
    }

    pub fn paired(&self) -> Vec<PairedDevice> {
        self.inner.paired.lock().clone()
    }

    /// Release every device and stop watching for found devices
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.found_task.lock().take() {
            task.abort();
        }
        let devices: Vec<Device> = self
            .inner
            .shared
            .lock()
            .drain()
            .map(|(_, device)| device)
            .collect();
        tracing::info!("Disconnecting {} device(s)", devices.len());
        join_all(devices.into_iter().map(Self::release)).await;
    }
}
