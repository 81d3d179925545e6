//! Channel actor implementation
//!
//! Each channel runs in its own task and is the only owner of its
//! subscriber set. Handles talk to it through a single ordered event
//! queue, so registrations, unregistrations and broadcasts are
//! serialized without any locking.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::client::ClientHandle;
use crate::error::ChatError;
use crate::message::ServerMessage;
use crate::types::{ChannelId, ClientId};

/// One side of a direct channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ClientId,
    pub username: String,
}

/// Channel variant
#[derive(Debug)]
pub enum ChannelKind {
    /// Named channel open to anyone
    Multi { name: String },
    /// Unnamed channel restricted to exactly two connections
    Direct { pair: [Participant; 2] },
}

/// Events processed by the channel actor, in arrival order
#[derive(Debug)]
enum ChannelEvent {
    Register {
        client: ClientHandle,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Unregister {
        client_id: ClientId,
        reply: oneshot::Sender<()>,
    },
    Broadcast {
        message: ServerMessage,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
    Close,
}

/// Handle to a running channel actor
///
/// Cloning does not create a new channel; all clones address the same actor.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    kind: Arc<ChannelKind>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Channel {
    /// Spawn a named channel
    pub fn multi(name: String) -> Self {
        Self::spawn(ChannelKind::Multi { name })
    }

    /// Spawn a direct channel for exactly `a` and `b`
    pub fn direct(a: Participant, b: Participant) -> Self {
        Self::spawn(ChannelKind::Direct { pair: [a, b] })
    }

    fn spawn(kind: ChannelKind) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            id: ChannelId::new(),
            kind: Arc::new(kind),
            events,
        };

        let actor = ChannelActor {
            id: channel.id,
            kind: Arc::clone(&channel.kind),
            subscribers: HashMap::new(),
            events: receiver,
        };
        tokio::spawn(actor.run());

        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Name of a multi channel; `None` for direct channels
    pub fn name(&self) -> Option<&str> {
        match &*self.kind {
            ChannelKind::Multi { name } => Some(name),
            ChannelKind::Direct { .. } => None,
        }
    }

    /// Label shown to `client_id`: `#name` or `@peer`
    pub fn display_name_for(&self, client_id: ClientId) -> String {
        self.kind.display_name_for(client_id)
    }

    /// Join the channel and wait until the actor has processed it
    ///
    /// On success the client has already been sent a `switchedChannel`
    /// notification.
    pub async fn register(&self, client: ClientHandle) -> Result<(), ChatError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(ChannelEvent::Register { client, reply })
            .map_err(|_| ChatError::ChannelClosed)?;
        response.await.map_err(|_| ChatError::ChannelClosed)?
    }

    /// Leave the channel and wait until the actor has processed it
    ///
    /// Leaving a channel one is not in, or one that is closed, does nothing.
    pub async fn unregister(&self, client: &ClientHandle) {
        let (reply, response) = oneshot::channel();
        let event = ChannelEvent::Unregister {
            client_id: client.id(),
            reply,
        };
        if self.events.send(event).is_ok() {
            let _ = response.await;
        }
    }

    /// Submit a message for fan-out without waiting for delivery
    pub fn broadcast(&self, message: ServerMessage) -> Result<(), ChatError> {
        self.events
            .send(ChannelEvent::Broadcast { message })
            .map_err(|_| ChatError::ChannelClosed)
    }

    /// Number of subscribers as seen by the actor
    pub async fn subscriber_count(&self) -> Result<usize, ChatError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(ChannelEvent::SubscriberCount { reply })
            .map_err(|_| ChatError::ChannelClosed)?;
        response.await.map_err(|_| ChatError::ChannelClosed)
    }

    /// Stop the actor after everything queued before this call
    ///
    /// Requests queued after the close are rejected with `ChannelClosed`.
    pub fn close(&self) {
        let _ = self.events.send(ChannelEvent::Close);
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves once the actor has stopped
    pub async fn closed(&self) {
        self.events.closed().await
    }
}

impl ChannelKind {
    fn peer_of(&self, client_id: ClientId) -> Option<&Participant> {
        match self {
            ChannelKind::Multi { .. } => None,
            ChannelKind::Direct { pair: [a, b] } => {
                if a.id == client_id {
                    Some(b)
                } else if b.id == client_id {
                    Some(a)
                } else {
                    None
                }
            }
        }
    }

    fn allows(&self, client_id: ClientId) -> bool {
        match self {
            ChannelKind::Multi { .. } => true,
            ChannelKind::Direct { pair } => pair.iter().any(|p| p.id == client_id),
        }
    }

    fn display_name_for(&self, client_id: ClientId) -> String {
        match self {
            ChannelKind::Multi { name } => format!("#{}", name),
            ChannelKind::Direct { .. } => match self.peer_of(client_id) {
                Some(peer) => format!("@{}", peer.username),
                None => "@".to_string(),
            },
        }
    }
}

/// Actor state, owned by the channel task
struct ChannelActor {
    id: ChannelId,
    kind: Arc<ChannelKind>,
    subscribers: HashMap<ClientId, ClientHandle>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelActor {
    async fn run(mut self) {
        debug!("Channel {} ({}) started", self.id, self.label());

        while let Some(event) = self.events.recv().await {
            match event {
                ChannelEvent::Register { client, reply } => {
                    let _ = reply.send(self.handle_register(client));
                }
                ChannelEvent::Unregister { client_id, reply } => {
                    self.subscribers.remove(&client_id);
                    let _ = reply.send(());
                }
                ChannelEvent::Broadcast { message } => {
                    self.handle_broadcast(message);
                }
                ChannelEvent::SubscriberCount { reply } => {
                    let _ = reply.send(self.subscribers.len());
                }
                ChannelEvent::Close => break,
            }
        }

        self.events.close();
        debug!("Channel {} ({}) stopped", self.id, self.label());
    }

    fn label(&self) -> String {
        match &*self.kind {
            ChannelKind::Multi { name } => format!("#{}", name),
            ChannelKind::Direct { pair: [a, b] } => format!("{} <-> {}", a.username, b.username),
        }
    }

    fn handle_register(&mut self, client: ClientHandle) -> Result<(), ChatError> {
        if !self.kind.allows(client.id()) {
            warn!(
                "{} tried to join direct channel {} without being a participant",
                client.username(),
                self.id
            );
            return Err(ChatError::NotParticipant);
        }

        let notification = ServerMessage::switched_channel(self.kind.display_name_for(client.id()));
        if let Err(e) = client.try_send(notification) {
            if matches!(e, ChatError::SlowConsumer) {
                client.terminate();
            }
            self.subscribers.remove(&client.id());
            return Err(e);
        }

        debug!("{} joined {}", client.username(), self.label());
        self.subscribers.insert(client.id(), client);
        Ok(())
    }

    fn handle_broadcast(&mut self, message: ServerMessage) {
        let label = self.label();
        self.subscribers
            .retain(|_, client| match client.try_send(message.clone()) {
                Ok(()) => true,
                Err(ChatError::SlowConsumer) => {
                    warn!("Slow consumer {} evicted from {}", client.username(), label);
                    client.terminate();
                    false
                }
                Err(_) => false,
            });
    }
}
