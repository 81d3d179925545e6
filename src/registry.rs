//! Registry of channels and users
//!
//! One instance per process, shared as `Arc<Registry>` by the accept loop
//! and every connection. Each map has its own lock, held only for the map
//! operation itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::channel::Channel;
use crate::client::ClientHandle;
use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::message::ServerMessage;
use crate::types::username_key;
use crate::validation::{generate_anonymous_username, validate_channel_name};

/// Process-wide lookup of channels by name and users by username
#[derive(Debug)]
pub struct Registry {
    config: ServerConfig,
    /// Multi channels: name (case-sensitive) -> Channel
    channels: RwLock<HashMap<String, Channel>>,
    /// Live users: username key -> ClientHandle
    users: RwLock<HashMap<String, ClientHandle>>,
}

impl Registry {
    /// Create the registry for a server
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Look up a multi channel, creating and starting it on first use
    pub async fn get_or_create_channel(&self, name: &str) -> Result<Channel, ChatError> {
        if let Some(channel) = self.live_channel(name).await {
            return Ok(channel);
        }

        validate_channel_name(name)?;

        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(name).filter(|c| !c.is_closed()) {
            return Ok(channel.clone());
        }

        let channel = Channel::multi(name.to_string());
        channels.insert(name.to_string(), channel.clone());
        info!("Channel #{} created ({} total)", name, channels.len());

        Ok(channel)
    }

    async fn live_channel(&self, name: &str) -> Option<Channel> {
        self.channels
            .read()
            .await
            .get(name)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// The channel every client starts in
    pub async fn welcome_channel(&self) -> Result<Channel, ChatError> {
        self.get_or_create_channel(&self.config.welcome_channel).await
    }

    /// Add a live user, rejecting a name that is already connected
    pub async fn add_user(&self, client: ClientHandle) -> Result<(), ChatError> {
        let mut users = self.users.write().await;
        if users.contains_key(client.key()) {
            return Err(ChatError::InvalidUsername(
                "Username is already in use".to_string(),
            ));
        }

        debug!("User {} added ({} online)", client.username(), users.len() + 1);
        users.insert(client.key().to_string(), client);
        Ok(())
    }

    /// Admit a user under a freshly generated `Anonymous#NNNN` name
    pub async fn add_anonymous_user(&self, sender: mpsc::Sender<ServerMessage>) -> ClientHandle {
        let mut users = self.users.write().await;
        let username = generate_anonymous_username(|name| users.contains_key(&username_key(name)));
        let client = ClientHandle::new(username, sender);

        debug!("User {} added ({} online)", client.username(), users.len() + 1);
        users.insert(client.key().to_string(), client.clone());
        client
    }

    /// Remove a user, but only if the entry is still this connection
    pub async fn remove_user(&self, client: &ClientHandle) {
        let mut users = self.users.write().await;
        if users.get(client.key()).is_some_and(|c| c == client) {
            users.remove(client.key());
            debug!("User {} removed ({} online)", client.username(), users.len());
        }
    }

    /// Case-insensitive lookup of a live user
    pub async fn get_user(&self, username: &str) -> Option<ClientHandle> {
        self.users.read().await.get(&username_key(username)).cloned()
    }
}
