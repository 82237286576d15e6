//! Process-wide directory of voice connections, keyed by server id.
//!
//! Besides live connections the registry tracks connects in flight. A
//! pending entry holds one-shot slots for the two signaling events a connect
//! waits for; each slot is filled at most once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::{ConnectionShared, VoiceConnection};
use crate::error::{Result, VoiceError};

/// Our own voice state as reported by the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VoiceStateInfo {
    // ---
    pub(crate) user_id: u64,
    pub(crate) session_id: String,
}

/// The voice server assignment reported by the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VoiceServerInfo {
    // ---
    pub(crate) token: String,
    /// `None` while the relay is being reallocated
    pub(crate) endpoint: Option<String>,
}

struct PendingConnection {
    // ---
    state: Option<oneshot::Sender<VoiceStateInfo>>,
    server: Option<oneshot::Sender<VoiceServerInfo>>,
}

/// Receivers handed to the connect call that registered a pending entry.
pub(crate) struct PendingReceivers {
    // ---
    pub(crate) state: oneshot::Receiver<VoiceStateInfo>,
    pub(crate) server: oneshot::Receiver<VoiceServerInfo>,
}

#[derive(Default)]
struct RegistryInner {
    // ---
    connections: DashMap<u64, Arc<VoiceConnection>>,
    pending: DashMap<u64, PendingConnection>,
}

/// Shared handle to the connection directory. Clones see the same entries.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    // ---
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    pub fn get(&self, server_id: u64) -> Option<Arc<VoiceConnection>> {
        // ---
        self.inner
            .connections
            .get(&server_id)
            .map(|c| Arc::clone(c.value()))
    }

    /// True if a connection exists or is being established.
    pub fn contains(&self, server_id: u64) -> bool {
        // ---
        self.inner.connections.contains_key(&server_id) || self.inner.pending.contains_key(&server_id)
    }

    pub fn server_ids(&self) -> Vec<u64> {
        // ---
        self.inner.connections.iter().map(|c| *c.key()).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        // ---
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.inner.connections.is_empty()
    }

    pub fn is_pending(&self, server_id: u64) -> bool {
        // ---
        self.inner.pending.contains_key(&server_id)
    }

    /// Registers a connect in flight for `server_id`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Configuration`] if the server already has a
    /// connection or a pending connect.
    pub(crate) fn begin_pending(&self, server_id: u64) -> Result<PendingReceivers> {
        // ---
        if self.inner.connections.contains_key(&server_id) {
            return Err(VoiceError::configuration(format!(
                "already connected to server {server_id}"
            )));
        }

        match self.inner.pending.entry(server_id) {
            Entry::Occupied(_) => Err(VoiceError::configuration(format!(
                "a connection to server {server_id} is already pending"
            ))),
            Entry::Vacant(slot) => {
                let (state_tx, state) = oneshot::channel();
                let (server_tx, server) = oneshot::channel();
                slot.insert(PendingConnection {
                    state: Some(state_tx),
                    server: Some(server_tx),
                });
                Ok(PendingReceivers { state, server })
            }
        }
    }

    pub(crate) fn end_pending(&self, server_id: u64) {
        // ---
        self.inner.pending.remove(&server_id);
    }

    /// Fills the voice-state slot. False if nothing was waiting for it.
    pub(crate) fn fulfil_state(&self, server_id: u64, info: VoiceStateInfo) -> bool {
        // ---
        let sender = self
            .inner
            .pending
            .get_mut(&server_id)
            .and_then(|mut p| p.state.take());
        match sender {
            Some(tx) => tx.send(info).is_ok(),
            None => false,
        }
    }

    /// Fills the voice-server slot. False if nothing was waiting for it.
    pub(crate) fn fulfil_server(&self, server_id: u64, info: VoiceServerInfo) -> bool {
        // ---
        let sender = self
            .inner
            .pending
            .get_mut(&server_id)
            .and_then(|mut p| p.server.take());
        match sender {
            Some(tx) => tx.send(info).is_ok(),
            None => false,
        }
    }

    pub(crate) fn insert(&self, connection: Arc<VoiceConnection>) {
        // ---
        let server_id = connection.server_id();
        debug!("Registry: connection {} registered", server_id);
        self.inner.connections.insert(server_id, connection);
    }

    /// Removes the entry for `server_id` if it still belongs to `shared`.
    pub(crate) fn remove_connection(&self, server_id: u64, shared: &ConnectionShared) {
        // ---
        let removed = self
            .inner
            .connections
            .remove_if(&server_id, |_, c| std::ptr::eq(Arc::as_ptr(&c.shared), shared));
        if removed.is_some() {
            debug!("Registry: connection {} removed", server_id);
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    // ---
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("SessionRegistry")
            .field("connections", &self.server_ids())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}
