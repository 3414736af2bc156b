use crate::protocol::ProtocolClient;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A device's live protocol client plus the background tasks bound to it
///
/// Every bind mints a new session id. Continuations that captured an older session find a
/// different id on the record and drop their result. Dropping the connection aborts its
/// tasks so no listener outlives the client it was subscribed to.
pub(crate) struct DeviceConnection {
    session: Uuid,
    address: String,
    client: Arc<dyn ProtocolClient>,
    listener: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl DeviceConnection {
    /// Create a connection with a fresh session id
    pub fn new(client: Arc<dyn ProtocolClient>, address: impl Into<String>) -> Self {
        Self {
            session: Uuid::new_v4(),
            address: address.into(),
            client,
            listener: None,
            poller: None,
        }
    }

    /// Id that tells this binding apart from any later one for the same device
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Address the client was created for
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Shared handle to the protocol client
    pub fn client(&self) -> Arc<dyn ProtocolClient> {
        self.client.clone()
    }

    /// Install the notification dispatch loop
    pub fn attach_listener(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.listener.replace(handle) {
            old.abort();
        }
    }

    /// Install or clear the active-speaker poll task
    pub fn set_poller(&mut self, handle: Option<JoinHandle<()>>) {
        if let Some(old) = std::mem::replace(&mut self.poller, handle) {
            old.abort();
        }
    }

    /// Whether an active-speaker poll task is installed
    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    /// Abort every background task and hand back the client for disconnecting
    pub fn release(mut self) -> Arc<dyn ProtocolClient> {
        self.abort_tasks();
        self.client.clone()
    }

    fn abort_tasks(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Disconnect a released client
pub(crate) async fn disconnect(client: Arc<dyn ProtocolClient>, address: &str) {
    tracing::debug!("Disconnecting client for {}", address);
    client.disconnect().await;
}
