//! Mock transport, protocol client and factory shared by the integration tests.
//!
//! The mocks record every call they receive and can be told to fail, so tests can assert
//! both the traffic the driver generates and how it reacts to failures.

#![allow(dead_code)]

use async_trait::async_trait;
use heos_renderer::{
    ClientFactory, DeviceDescription, DeviceDescriptor, DiscoveryTransport, Driver,
    DriverConfig, DriverError, DriverEvent, Notification, NotificationReceiver, PairedDevice,
    PlayState, PlayerInfo, ProbeResponse, ProtocolClient, ProtocolFamily, Result,
    ServiceDescription, SsdpHeaders, StateReceiver, TrackMetadata, TransportInfo,
    TransportState, AV_TRANSPORT_SERVICE_ID,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "heos_renderer=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run; with a paused clock this also advances time by 10 ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Drain every event currently queued
pub fn drain(events: &mut StateReceiver) -> Vec<DriverEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Wait (in virtual time) for the first event matching `pred`
pub async fn wait_for(
    events: &mut StateReceiver,
    pred: impl Fn(&DriverEvent) -> bool,
) -> DriverEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Ordered record of calls across every client created by one factory
pub type Journal = Arc<Mutex<Vec<String>>>;

// ---------------------------------------------------------------------------
// Discovery transport
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Description {
    Ready(DeviceDescription),
    Fail,
}

pub struct MockTransport {
    responses: broadcast::Sender<ProbeResponse>,
    descriptions: Mutex<HashMap<String, Description>>,
    description_delay: Mutex<Duration>,
    fail_search: AtomicBool,
    pub searches: AtomicUsize,
    pub stops: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (responses, _) = broadcast::channel(64);
        Arc::new(Self {
            responses,
            descriptions: Mutex::new(HashMap::new()),
            description_delay: Mutex::new(Duration::ZERO),
            fail_search: AtomicBool::new(false),
            searches: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        })
    }

    /// Serve a description at `location`
    pub fn describe(&self, location: &str, udn: &str, name: &str, services: &[&str]) {
        let services: BTreeMap<String, ServiceDescription> = services
            .iter()
            .map(|id| (id.to_string(), ServiceDescription::default()))
            .collect();
        self.descriptions.lock().insert(
            location.to_string(),
            Description::Ready(DeviceDescription {
                udn: udn.to_string(),
                friendly_name: name.to_string(),
                services,
            }),
        );
    }

    pub fn fail_description(&self, location: &str) {
        self.descriptions
            .lock()
            .insert(location.to_string(), Description::Fail);
    }

    pub fn set_description_delay(&self, delay: Duration) {
        *self.description_delay.lock() = delay;
    }

    pub fn set_fail_search(&self, fail: bool) {
        self.fail_search.store(fail, Ordering::SeqCst);
    }

    /// Broadcast a probe response
    pub fn respond(&self, usn: &str, location: &str, st: &str) {
        self.respond_with_status(usn, location, st, 200);
    }

    pub fn respond_with_status(&self, usn: &str, location: &str, st: &str, status_code: u16) {
        let _ = self.responses.send(ProbeResponse {
            headers: SsdpHeaders {
                usn: usn.to_string(),
                location: location.to_string(),
                st: st.to_string(),
            },
            status_code,
        });
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryTransport for MockTransport {
    async fn search(&self, _search_target: &str) -> Result<()> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("search failed".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn responses(&self) -> broadcast::Receiver<ProbeResponse> {
        self.responses.subscribe()
    }

    async fn device_description(&self, location: &str) -> Result<DeviceDescription> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.description_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.descriptions.lock().get(location).cloned() {
            Some(Description::Ready(description)) => Ok(description),
            Some(Description::Fail) => Err(DriverError::Transport("fetch failed".to_string())),
            None => Err(DriverError::InvalidResponse(format!("no description at {}", location))),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol client
// ---------------------------------------------------------------------------

pub struct MockClient {
    family: ProtocolFamily,
    address: String,
    journal: Journal,
    players: Mutex<Vec<PlayerInfo>>,
    volume: Mutex<u8>,
    play_state: Mutex<PlayState>,
    transport_state: Mutex<TransportState>,
    position: AtomicU64,
    muted: AtomicBool,
    notifications: Mutex<Option<broadcast::Sender<Notification>>>,
    fail_connect: AtomicBool,
    fail_polls: AtomicBool,
    fail_commands: AtomicBool,
    fail_load: AtomicBool,
    close_on_command: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl MockClient {
    pub fn new(family: ProtocolFamily, address: &str, journal: Journal) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            family,
            address: address.to_string(),
            journal,
            players: Mutex::new(Vec::new()),
            volume: Mutex::new(0),
            play_state: Mutex::new(PlayState::Stop),
            transport_state: Mutex::new(TransportState::Stopped),
            position: AtomicU64::new(0),
            muted: AtomicBool::new(false),
            notifications: Mutex::new(Some(tx)),
            fail_connect: AtomicBool::new(false),
            fail_polls: AtomicBool::new(false),
            fail_commands: AtomicBool::new(false),
            fail_load: AtomicBool::new(false),
            close_on_command: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Report a player for this client's own address
    pub fn with_player(self, player_id: &str, group_id: Option<&str>) -> Self {
        let address = self.address.clone();
        self.with_remote_player(&address, player_id, group_id)
    }

    /// Report a player at another address (HEOS lists the whole system)
    pub fn with_remote_player(self, address: &str, player_id: &str, group_id: Option<&str>) -> Self {
        self.players.lock().push(PlayerInfo {
            address: address.to_string(),
            player_id: player_id.to_string(),
            group_id: group_id.map(str::to_string),
        });
        self
    }

    pub fn with_volume(self, level: u8) -> Self {
        *self.volume.lock() = level;
        self
    }

    pub fn with_play_state(self, state: PlayState) -> Self {
        *self.play_state.lock() = state;
        self
    }

    pub fn set_group(&self, player_id: &str, group_id: Option<&str>) {
        for player in self.players.lock().iter_mut() {
            if player.player_id == player_id {
                player.group_id = group_id.map(str::to_string);
            }
        }
    }

    pub fn set_transport_state(&self, state: TransportState) {
        *self.transport_state.lock() = state;
    }

    pub fn set_position(&self, secs: u64) {
        self.position.store(secs, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    /// Make every following command fail as if the socket had dropped
    pub fn set_close_on_command(&self, close: bool) {
        self.close_on_command.store(close, Ordering::SeqCst);
    }

    /// Push a notification to every subscriber
    pub fn notify(&self, notification: Notification) {
        if let Some(tx) = self.notifications.lock().as_ref() {
            let _ = tx.send(notification);
        }
    }

    /// Close the notification stream, as a dropped socket would
    pub fn close(&self) {
        self.notifications.lock().take();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.journal.lock().push(format!("{} {}", self.address, call));
        self.calls.lock().push(call);
    }

    fn command(&self, call: String) -> Result<()> {
        self.record(call);
        if self.close_on_command.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("command failed".to_string()));
        }
        Ok(())
    }

    fn poll(&self, call: &str) -> Result<()> {
        self.record(call.to_string());
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(DriverError::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    fn family(&self) -> ProtocolFamily {
        self.family
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.record(format!("connect {}", address));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.record("disconnect".to_string());
    }

    async fn players(&self) -> Result<Vec<PlayerInfo>> {
        self.record("players".to_string());
        Ok(self.players.lock().clone())
    }

    async fn player_info(&self, player_id: &str) -> Result<PlayerInfo> {
        self.record(format!("player_info {}", player_id));
        self.players
            .lock()
            .iter()
            .find(|p| p.player_id == player_id)
            .cloned()
            .ok_or_else(|| DriverError::InvalidResponse(format!("no player {}", player_id)))
    }

    async fn volume(&self, player_id: &str) -> Result<u8> {
        self.poll(&format!("volume {}", player_id))?;
        Ok(*self.volume.lock())
    }

    async fn set_volume(&self, player_id: &str, level: u8) -> Result<()> {
        self.command(format!("set_volume {} {}", player_id, level))?;
        *self.volume.lock() = level;
        Ok(())
    }

    async fn play_state(&self, player_id: &str) -> Result<PlayState> {
        self.poll(&format!("play_state {}", player_id))?;
        Ok(*self.play_state.lock())
    }

    async fn set_play_state(&self, target: &str, state: PlayState) -> Result<()> {
        self.command(format!("set_play_state {} {:?}", target, state))?;
        *self.play_state.lock() = state;
        Ok(())
    }

    async fn play_previous(&self, target: &str) -> Result<()> {
        self.command(format!("play_previous {}", target))
    }

    async fn play_next(&self, target: &str) -> Result<()> {
        self.command(format!("play_next {}", target))
    }

    fn subscribe(&self) -> NotificationReceiver {
        match self.notifications.lock().as_ref() {
            Some(tx) => NotificationReceiver::new(tx.subscribe()),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                NotificationReceiver::new(rx)
            }
        }
    }

    async fn load(&self, url: &str, metadata: &TrackMetadata) -> Result<()> {
        self.record(format!("load {} {}", url, metadata.title));
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(DriverError::Transport("load failed".to_string()));
        }
        Ok(())
    }

    async fn seek(&self, position_secs: u64) -> Result<()> {
        self.command(format!("seek {}", position_secs))
    }

    async fn position(&self) -> Result<u64> {
        self.poll("position")?;
        Ok(self.position.load(Ordering::SeqCst))
    }

    async fn transport_info(&self) -> Result<TransportInfo> {
        self.poll("transport_info")?;
        Ok(TransportInfo {
            state: *self.transport_state.lock(),
        })
    }

    async fn mute(&self) -> Result<bool> {
        self.poll("mute")?;
        Ok(self.muted.load(Ordering::SeqCst))
    }

    async fn set_mute(&self, mute: bool) -> Result<()> {
        self.command(format!("set_mute {}", mute))?;
        self.muted.store(mute, Ordering::SeqCst);
        Ok(())
    }
}

/// Renderer-style client that leaves every renderer-only operation at its default
pub struct BareClient {
    pub inner: Arc<MockClient>,
}

#[async_trait]
impl ProtocolClient for BareClient {
    fn family(&self) -> ProtocolFamily {
        self.inner.family()
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.inner.connect(address).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    async fn players(&self) -> Result<Vec<PlayerInfo>> {
        self.inner.players().await
    }

    async fn player_info(&self, player_id: &str) -> Result<PlayerInfo> {
        self.inner.player_info(player_id).await
    }

    async fn volume(&self, player_id: &str) -> Result<u8> {
        self.inner.volume(player_id).await
    }

    async fn set_volume(&self, player_id: &str, level: u8) -> Result<()> {
        self.inner.set_volume(player_id, level).await
    }

    async fn play_state(&self, player_id: &str) -> Result<PlayState> {
        self.inner.play_state(player_id).await
    }

    async fn set_play_state(&self, target: &str, state: PlayState) -> Result<()> {
        self.inner.set_play_state(target, state).await
    }

    async fn play_previous(&self, target: &str) -> Result<()> {
        self.inner.play_previous(target).await
    }

    async fn play_next(&self, target: &str) -> Result<()> {
        self.inner.play_next(target).await
    }

    fn subscribe(&self) -> NotificationReceiver {
        self.inner.subscribe()
    }
}

/// Client whose `connect` takes `delay` to complete, for overlapping a re-bind with it
pub struct SlowConnectClient {
    pub inner: Arc<MockClient>,
    pub delay: Duration,
}

#[async_trait]
impl ProtocolClient for SlowConnectClient {
    fn family(&self) -> ProtocolFamily {
        self.inner.family()
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.inner.record(format!("connect {}", address));
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    async fn players(&self) -> Result<Vec<PlayerInfo>> {
        self.inner.players().await
    }

    async fn player_info(&self, player_id: &str) -> Result<PlayerInfo> {
        self.inner.player_info(player_id).await
    }

    async fn volume(&self, player_id: &str) -> Result<u8> {
        self.inner.volume(player_id).await
    }

    async fn set_volume(&self, player_id: &str, level: u8) -> Result<()> {
        self.inner.set_volume(player_id, level).await
    }

    async fn play_state(&self, player_id: &str) -> Result<PlayState> {
        self.inner.play_state(player_id).await
    }

    async fn set_play_state(&self, target: &str, state: PlayState) -> Result<()> {
        self.inner.set_play_state(target, state).await
    }

    async fn play_previous(&self, target: &str) -> Result<()> {
        self.inner.play_previous(target).await
    }

    async fn play_next(&self, target: &str) -> Result<()> {
        self.inner.play_next(target).await
    }

    fn subscribe(&self) -> NotificationReceiver {
        self.inner.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Client factory
// ---------------------------------------------------------------------------

/// Hands out prepared clients by device address
pub struct MockFactory {
    family: ProtocolFamily,
    pub journal: Journal,
    prepared: Mutex<HashMap<String, Vec<Arc<dyn ProtocolClient>>>>,
    pub created: AtomicUsize,
}

impl MockFactory {
    pub fn new(family: ProtocolFamily) -> Arc<Self> {
        Arc::new(Self {
            family,
            journal: Arc::new(Mutex::new(Vec::new())),
            prepared: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        })
    }

    /// Build a client for `address` sharing this factory's journal
    pub fn client(&self, address: &str) -> MockClient {
        MockClient::new(self.family, address, self.journal.clone())
    }

    /// Queue `client` for the next bind at `address`
    pub fn prepare(&self, address: &str, client: MockClient) -> Arc<MockClient> {
        let client = Arc::new(client);
        self.prepare_dyn(address, client.clone());
        client
    }

    pub fn prepare_dyn(&self, address: &str, client: Arc<dyn ProtocolClient>) {
        self.prepared
            .lock()
            .entry(address.to_string())
            .or_default()
            .push(client);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }
}

impl ClientFactory for MockFactory {
    fn create(&self, descriptor: &DeviceDescriptor) -> Arc<dyn ProtocolClient> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut prepared = self.prepared.lock();
        match prepared.get_mut(&descriptor.address) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Arc::new(MockClient::new(
                descriptor.family,
                &descriptor.address,
                self.journal.clone(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn location(address: &str) -> String {
    format!("http://{}:60006/upnp/desc/aios_device/aios_device.xml", address)
}

/// A driver wired to mock collaborators
pub struct Harness {
    pub driver: Driver,
    pub transport: Arc<MockTransport>,
    pub factory: Arc<MockFactory>,
    pub config: DriverConfig,
}

impl Harness {
    pub fn heos() -> Self {
        Self::with_config(DriverConfig::heos())
    }

    pub fn renderer() -> Self {
        Self::with_config(DriverConfig::media_renderer())
    }

    pub fn with_config(config: DriverConfig) -> Self {
        init_tracing();
        let transport = MockTransport::new();
        let factory = MockFactory::new(config.family);
        let driver = Driver::new(config.clone(), transport.clone(), factory.clone());
        Self {
            driver,
            transport,
            factory,
            config,
        }
    }

    /// Pair and bind each `(id, address, client)` and wait until all are available
    pub async fn start(&self, devices: Vec<(&str, &str, MockClient)>) -> Vec<Arc<MockClient>> {
        let mut events = self.driver.subscribe();
        let mut clients = Vec::new();
        let mut paired = Vec::new();
        for (id, address, client) in devices {
            clients.push(self.factory.prepare(address, client));
            paired.push((id.to_string(), address.to_string()));
        }

        self.driver
            .init(paired.iter().map(|(id, _)| PairedDevice::new(id.clone())).collect())
            .await
            .unwrap();
        for (id, address) in &paired {
            self.announce(&format!("USN-{}", id), id, address, &format!("Speaker {}", id));
        }

        let mut waiting: Vec<String> = paired.into_iter().map(|(id, _)| id).collect();
        while !waiting.is_empty() {
            if let DriverEvent::Available(id) =
                wait_for(&mut events, |e| matches!(e, DriverEvent::Available(_))).await
            {
                waiting.retain(|w| *w != id);
            }
        }
        clients
    }

    /// Serve a description for `udn` at `address` and answer a probe for it
    pub fn announce(&self, usn: &str, udn: &str, address: &str, name: &str) {
        let location = location(address);
        self.transport
            .describe(&location, udn, name, &[AV_TRANSPORT_SERVICE_ID]);
        self.transport
            .respond(usn, &location, &self.config.scan.search_target);
    }
}
