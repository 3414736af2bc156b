use crate::config::ScanConfig;
use crate::error::{DriverError, Result};
use crate::types::{DeviceDescription, DeviceDescriptor, ProbeResponse, ProtocolFamily};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use url::{Host, Url};

/// Broadcast discovery transport (SSDP search plus description fetch)
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Send a search for `search_target`; responses arrive on [`Self::responses`]
    async fn search(&self, search_target: &str) -> Result<()>;

    /// Stop listening for search responses
    async fn stop(&self);

    fn responses(&self) -> broadcast::Receiver<ProbeResponse>;

    async fn device_description(&self, location: &str) -> Result<DeviceDescription>;
}

/// Periodic, time-boxed network scanner maintaining the found-device table
///
/// Each found device is stored under both its USN and its UDN so callers may look it up
/// by either form. A "found" event is broadcast once a response's description has been
/// resolved.
///
/// # Example
///
/// ```no_run
/// # use heos_renderer::{DiscoveryScanner, DiscoveryTransport, DriverConfig};
/// # use std::sync::Arc;
/// # async fn run(transport: Arc<dyn DiscoveryTransport>) -> heos_renderer::Result<()> {
/// let config = DriverConfig::media_renderer();
/// let scanner = DiscoveryScanner::new(transport, config.family, config.scan);
/// let mut found = scanner.subscribe_found();
/// scanner.start().await?;
///
/// while let Ok(device) = found.recv().await {
///     println!("Found {} at {}", device.name, device.address);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DiscoveryScanner {
    inner: Arc<ScannerInner>,
}

struct ScannerInner {
    transport: Arc<dyn DiscoveryTransport>,
    family: ProtocolFamily,
    config: ScanConfig,
    state: Mutex<ScanState>,
    found_tx: broadcast::Sender<Arc<DeviceDescriptor>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct ScanState {
    scanning: bool,
    scan_end: Option<Instant>,
    stop_task: Option<JoinHandle<()>>,
    /// Keyed by USN and by UDN
    found: HashMap<String, Arc<DeviceDescriptor>>,
    /// USNs with a resolution in flight or cooling down
    resolving: HashSet<String>,
}

impl DiscoveryScanner {
    /// Create an idle scanner; nothing is sent until [`DiscoveryScanner::start`]
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        family: ProtocolFamily,
        config: ScanConfig,
    ) -> Self {
        let (found_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(ScannerInner {
                transport,
                family,
                config,
                state: Mutex::new(ScanState::default()),
                found_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn from_inner(inner: Arc<ScannerInner>) -> Self {
        Self { inner }
    }

    /// Start listening for responses, run the periodic rescan and open a first scan window
    ///
    /// Calling this again while running only opens a scan window.
    pub async fn start(&self) -> Result<()> {
        {
            let mut tasks = self.inner.tasks.lock();
            if tasks.is_empty() {
                tasks.push(self.spawn_response_loop());
                tasks.push(self.spawn_rescan_loop());
            }
        }
        self.scan(None).await
    }

    fn spawn_response_loop(&self) -> JoinHandle<()> {
        let mut rx = self.inner.transport.responses();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(response) => match weak.upgrade() {
                        Some(inner) => Self::from_inner(inner).handle_response(response),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Discovery lagged, skipped {} responses", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Discovery response stream closed");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_rescan_loop(&self) -> JoinHandle<()> {
        // `interval_at` panics on a zero period
        let every = self.inner.config.rescan_interval.max(Duration::from_millis(1));
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = Self::from_inner(inner).scan(None).await {
                    tracing::warn!("Periodic scan failed: {}", e);
                }
            }
        })
    }

    /// Open a scan window of `window` (or the configured default)
    ///
    /// While a window is open this only ever extends it; a shorter request leaves the
    /// current deadline alone.
    pub async fn scan(&self, window: Option<Duration>) -> Result<()> {
        let window = window.unwrap_or(self.inner.config.scan_window);
        let deadline = Instant::now() + window;
        {
            let mut state = self.inner.state.lock();
            if state.scanning {
                if state.scan_end.map_or(true, |end| end < deadline) {
                    state.scan_end = Some(deadline);
                    if let Some(old) = state.stop_task.replace(self.spawn_stop(deadline)) {
                        old.abort();
                    }
                    tracing::debug!("Extended scan window by {:?}", window);
                }
                return Ok(());
            }
            state.scanning = true;
            state.scan_end = Some(deadline);
            state.stop_task = Some(self.spawn_stop(deadline));
        }

        tracing::info!("Searching for {}", self.inner.config.search_target);
        if let Err(e) = self.inner.transport.search(&self.inner.config.search_target).await {
            let mut state = self.inner.state.lock();
            state.scanning = false;
            state.scan_end = None;
            if let Some(task) = state.stop_task.take() {
                task.abort();
            }
            return Err(e);
        }
        Ok(())
    }

    fn spawn_stop(&self, deadline: Instant) -> JoinHandle<()> {
        let weak: Weak<ScannerInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                Self::from_inner(inner).finish_window().await;
            }
        })
    }

    async fn finish_window(&self) {
        {
            let mut state = self.inner.state.lock();
            let extended = state.scan_end.is_some_and(|end| end > Instant::now());
            if !state.scanning || extended {
                return;
            }
            state.scanning = false;
            state.scan_end = None;
            state.stop_task = None;
        }
        self.inner.transport.stop().await;
        tracing::debug!("Scan window closed");
        self.expire_stale();
    }

    /// Whether a scan window is open
    pub fn is_scanning(&self) -> bool {
        self.inner.state.lock().scanning
    }

    fn handle_response(&self, response: ProbeResponse) {
        let config = &self.inner.config;
        if response.status_code != 200 || response.headers.st != config.search_target {
            tracing::debug!("Ignoring response for {}", response.headers.st);
            return;
        }

        let usn = response.headers.usn.clone();
        {
            let mut state = self.inner.state.lock();
            if state.resolving.contains(&usn) {
                tracing::debug!("Resolution for {} already pending", usn);
                return;
            }
            if let Some(existing) = state.found.get(&usn).cloned() {
                if existing.location == response.headers.location {
                    let mut seen = (*existing).clone();
                    seen.last_seen = Instant::now();
                    let seen = Arc::new(seen);
                    state.found.insert(seen.usn.clone(), seen.clone());
                    state.found.insert(seen.id.clone(), seen);
                    return;
                }
            }
            state.resolving.insert(usn);
        }

        let scanner = self.clone();
        tokio::spawn(async move { scanner.resolve(response).await });
    }

    async fn resolve(&self, response: ProbeResponse) {
        let usn = response.headers.usn.clone();
        match self.fetch_descriptor(response).await {
            Ok(descriptor) => {
                let descriptor = Arc::new(descriptor);
                {
                    let mut state = self.inner.state.lock();
                    state.found.insert(descriptor.usn.clone(), descriptor.clone());
                    state.found.insert(descriptor.id.clone(), descriptor.clone());
                    state.resolving.remove(&usn);
                }
                tracing::info!(
                    "Found device {} ({}) at {}",
                    descriptor.name,
                    descriptor.id,
                    descriptor.address
                );
                let _ = self.inner.found_tx.send(descriptor);
            }
            Err(e) => {
                tracing::warn!("Not able to get correct device info for {}: {}", usn, e);
                let cooldown = self.inner.config.retry_cooldown;
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    sleep(cooldown).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.state.lock().resolving.remove(&usn);
                    }
                });
            }
        }
    }

    async fn fetch_descriptor(&self, response: ProbeResponse) -> Result<DeviceDescriptor> {
        let config = &self.inner.config;
        let headers = response.headers;
        let address = host_from_location(&headers.location)?;

        let description = timeout(
            config.scan_window,
            self.inner.transport.device_description(&headers.location),
        )
        .await
        .map_err(|_| DriverError::Timeout)??;

        if description.udn.is_empty() {
            return Err(DriverError::InvalidResponse("Description has no UDN".to_string()));
        }
        if let Some(required) = &config.required_service {
            if !description.has_service(required) {
                return Err(DriverError::InvalidResponse(format!(
                    "{} does not expose {}",
                    description.udn, required
                )));
            }
        }

        Ok(DeviceDescriptor {
            id: description.udn.clone(),
            usn: headers.usn,
            address,
            location: headers.location,
            name: description.friendly_name.clone(),
            family: self.inner.family,
            description,
            last_seen: Instant::now(),
        })
    }

    /// Look up a found device by USN or UDN
    pub fn found_device(&self, id: &str) -> Option<Arc<DeviceDescriptor>> {
        self.inner.state.lock().found.get(id).cloned()
    }

    /// All found devices, one entry per UDN, sorted by name
    pub fn found_devices(&self) -> Vec<Arc<DeviceDescriptor>> {
        let state = self.inner.state.lock();
        let mut devices: Vec<_> = state
            .found
            .iter()
            .filter(|(key, d)| **key == d.id)
            .map(|(_, d)| d.clone())
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// Drop every entry of the device known as `id` (either form)
    pub fn forget(&self, id: &str) {
        let mut state = self.inner.state.lock();
        if let Some(descriptor) = state.found.get(id).cloned() {
            state.found.retain(|_, d| d.id != descriptor.id && d.usn != descriptor.usn);
            tracing::debug!("Forgot found device {}", descriptor.id);
        }
    }

    /// Drop entries no longer advertised, for families whose entries expire
    pub fn expire_stale(&self) {
        if !self.inner.family.expires_found_devices() {
            return;
        }
        let stale_after = self.inner.config.stale_after;
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let before = state.found.len();
        state
            .found
            .retain(|_, d| now.duration_since(d.last_seen) < stale_after);
        let removed = before - state.found.len();
        if removed > 0 {
            tracing::info!("Expired {} stale found-device entries", removed);
        }
    }

    /// Receive each device as soon as its description is resolved
    pub fn subscribe_found(&self) -> broadcast::Receiver<Arc<DeviceDescriptor>> {
        self.inner.found_tx.subscribe()
    }

    /// Stop scanning and abort the background tasks
    pub async fn shutdown(&self) {
        let (was_scanning, stop_task) = {
            let mut state = self.inner.state.lock();
            let was = state.scanning;
            state.scanning = false;
            state.scan_end = None;
            (was, state.stop_task.take())
        };
        if let Some(task) = stop_task {
            task.abort();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if was_scanning {
            self.inner.transport.stop().await;
        }
    }
}

/// Extract the host of a description URL, e.g. `http://10.0.0.5:1400/xml` gives `10.0.0.5`
pub(crate) fn host_from_location(location: &str) -> Result<String> {
    let url = Url::parse(location)
        .map_err(|e| DriverError::InvalidResponse(format!("Bad location {}: {}", location, e)))?;
    match url.host() {
        // `host_str` keeps the brackets around IPv6 literals
        Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
        Some(host) => Ok(host.to_string()),
        None => Err(DriverError::InvalidResponse(format!(
            "No host in location {}",
            location
        ))),
    }
}
