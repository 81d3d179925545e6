//! Client handle definition
//!
//! The part of a connection that other tasks may hold: identity, the
//! bounded outbound queue, the termination signal and the map of direct
//! channels. The read and write loops themselves live in `multiplexer`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, warn};

use crate::channel::{Channel, Participant};
use crate::error::ChatError;
use crate::message::ServerMessage;
use crate::types::{username_key, ClientId};

#[derive(Debug)]
struct ClientInner {
    id: ClientId,
    username: String,
    key: String,
    sender: mpsc::Sender<ServerMessage>,
    terminate: Notify,
    /// Direct channels by peer username key; `None` once the client has left
    direct_channels: RwLock<Option<HashMap<String, Channel>>>,
}

/// Shared handle to a connected client
///
/// Cheap to clone. Equality is by connection id.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ClientHandle {}

impl ClientHandle {
    /// Create a handle for a newly admitted connection
    pub fn new(username: String, sender: mpsc::Sender<ServerMessage>) -> Self {
        let key = username_key(&username);
        Self {
            inner: Arc::new(ClientInner {
                id: ClientId::new(),
                username,
                key,
                sender,
                terminate: Notify::new(),
                direct_channels: RwLock::new(Some(HashMap::new())),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Case-folded username used as a map key
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn participant(&self) -> Participant {
        Participant {
            id: self.inner.id,
            username: self.inner.username.clone(),
        }
    }

    /// Queue a message without waiting
    ///
    /// A full queue means the consumer is too slow; the caller decides
    /// what to do about it.
    pub fn try_send(&self, msg: ServerMessage) -> Result<(), ChatError> {
        self.inner.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChatError::SlowConsumer,
            mpsc::error::TrySendError::Closed(_) => ChatError::ChannelClosed,
        })
    }

    /// Queue a message to ourselves, tearing down on overflow
    pub fn notify(&self, msg: ServerMessage) {
        if let Err(e) = self.try_send(msg) {
            warn!("Dropping notification for {}: {}", self.username(), e);
            if matches!(e, ChatError::SlowConsumer) {
                self.terminate();
            }
        }
    }

    /// Ask the connection to shut down
    ///
    /// Stores a permit, so a read loop that is not currently waiting
    /// still observes it on its next wait.
    pub fn terminate(&self) {
        debug!("Terminating connection for {}", self.username());
        self.inner.terminate.notify_one();
    }

    /// Resolves once `terminate` has been called
    pub async fn terminated(&self) {
        self.inner.terminate.notified().await
    }

    /// Existing, still open direct channel to a peer
    pub async fn direct_channel(&self, peer_key: &str) -> Option<Channel> {
        self.inner
            .direct_channels
            .read()
            .await
            .as_ref()?
            .get(peer_key)
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    /// Get or create the direct channel shared with `peer`
    ///
    /// Both maps are write-locked in ascending key order and updated
    /// together, so concurrent mutual requests agree on one instance.
    pub async fn open_direct_channel(&self, peer: &ClientHandle) -> Result<Channel, ChatError> {
        if self == peer || self.key() == peer.key() {
            return Err(ChatError::DirectToSelf);
        }

        let (mut mine, mut theirs) = if self.key() < peer.key() {
            let mine = self.inner.direct_channels.write().await;
            let theirs = peer.inner.direct_channels.write().await;
            (mine, theirs)
        } else {
            let theirs = peer.inner.direct_channels.write().await;
            let mine = self.inner.direct_channels.write().await;
            (mine, theirs)
        };

        let Some(mine) = mine.as_mut() else {
            return Err(ChatError::ChannelClosed);
        };
        let Some(theirs) = theirs.as_mut() else {
            return Err(ChatError::UserNotFound(peer.username().to_string()));
        };

        if let Some(existing) = mine.get(peer.key()).filter(|c| !c.is_closed()) {
            let existing = existing.clone();
            theirs.insert(self.key().to_string(), existing.clone());
            return Ok(existing);
        }

        let channel = Channel::direct(self.participant(), peer.participant());
        mine.insert(peer.key().to_string(), channel.clone());
        theirs.insert(self.key().to_string(), channel.clone());
        debug!(
            "Direct channel {} opened between {} and {}",
            channel.id(),
            self.username(),
            peer.username()
        );

        Ok(channel)
    }

    /// Drop the entry for a peer if it still points at `channel`
    pub async fn forget_direct_channel(&self, peer_key: &str, channel: &Channel) {
        let mut guard = self.inner.direct_channels.write().await;
        if let Some(map) = guard.as_mut() {
            if map.get(peer_key).is_some_and(|c| c.id() == channel.id()) {
                map.remove(peer_key);
            }
        }
    }

    /// Remove and return every direct channel this client owns
    ///
    /// Afterwards nobody can open a new direct channel with this client.
    pub async fn take_direct_channels(&self) -> Vec<(String, Channel)> {
        self.inner
            .direct_channels
            .write()
            .await
            .take()
            .map(|map| map.into_iter().collect())
            .unwrap_or_default()
    }
}
