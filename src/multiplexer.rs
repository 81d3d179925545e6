//! Connection multiplexer
//!
//! Bridges one WebSocket to the channel fabric with two loops:
//! - the read loop decodes commands and dispatches them (this task)
//! - the write loop drains the outbound queue onto the socket (spawned task)
//!
//! The only state the two share is the outbound queue.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::client::ClientHandle;
use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::message::{ClientCommand, ServerMessage, ServerMessages};
use crate::registry::Registry;
use crate::types::username_key;

/// Per-connection state owned by the read loop
pub struct Multiplexer {
    registry: Arc<Registry>,
    client: ClientHandle,
    current: Channel,
}

impl Multiplexer {
    /// `current` must be a channel `client` has already registered with
    pub fn new(registry: Arc<Registry>, client: ClientHandle, current: Channel) -> Self {
        Self {
            registry,
            client,
            current,
        }
    }

    /// Run both loops until the connection ends, then tear down
    pub async fn run<S>(mut self, socket: S, outbound: mpsc::Receiver<ServerMessage>)
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let config = self.registry.config().clone();
        let (sink, stream) = socket.split();

        let mut writer = tokio::spawn(write_loop(sink, outbound, config.clone()));

        let writer_done = self.read_loop(stream, &mut writer, config.pong_wait).await;
        self.teardown().await;

        // Every sender is gone now, so the writer is flushing its close frame
        if !writer_done && timeout(config.write_wait, &mut writer).await.is_err() {
            debug!("Write loop did not finish in time, aborting");
            writer.abort();
        }
    }

    /// Returns whether the write loop has already finished
    async fn read_loop<R>(&mut self, mut stream: R, writer: &mut JoinHandle<()>, pong_wait: Duration) -> bool
    where
        R: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let client = self.client.clone();

        loop {
            let frame = tokio::select! {
                _ = client.terminated() => {
                    debug!("Connection for {} terminated", client.username());
                    return false;
                }
                _ = &mut *writer => {
                    debug!("Write loop for {} ended", client.username());
                    return true;
                }
                frame = timeout(pong_wait, stream.next()) => frame,
            };

            let message = match frame {
                Err(_) => {
                    warn!("No frame from {} within {:?}, closing", client.username(), pong_wait);
                    return false;
                }
                Ok(None) => return false,
                Ok(Some(Err(e))) => {
                    match e {
                        WsError::ConnectionClosed | WsError::Protocol(_) => {
                            debug!("Connection for {} closed: {}", client.username(), e)
                        }
                        e => error!("WebSocket error for {}: {}", client.username(), e),
                    }
                    return false;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => match ClientCommand::parse(&text) {
                    Ok(command) => self.dispatch(command).await,
                    Err(e) => warn!("Failed to parse message from {}: {}", client.username(), e),
                },
                Message::Close(_) => {
                    debug!("Client {} sent close frame", client.username());
                    return false;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // Pongs are answered by tungstenite; any frame resets the deadline
                }
                Message::Binary(_) | Message::Frame(_) => {
                    debug!("Ignoring non-text frame from {}", client.username());
                }
            }
        }
    }

    async fn dispatch(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::SendMessage { text } => self.send_message(text).await,
            ClientCommand::SwitchMultiChannel { name, message } => {
                match self.registry.get_or_create_channel(&name).await {
                    Ok(channel) => self.switch_and_post(channel, message).await,
                    Err(e) => self.client.notify(ServerMessage::from(&e)),
                }
            }
            ClientCommand::SwitchDirectChannel { peer, message } => {
                match self.resolve_direct_channel(&peer).await {
                    Ok(channel) => self.switch_and_post(channel, message).await,
                    Err(e) => self.client.notify(ServerMessage::from(&e)),
                }
            }
            ClientCommand::Ping => {}
            ClientCommand::Unknown { kind } => {
                self.client
                    .notify(ServerMessage::from(&ChatError::UnknownCommand(kind)));
            }
        }
    }

    async fn send_message(&mut self, text: String) {
        if text.is_empty() {
            return;
        }

        debug!(
            "{} -> {}: {} bytes",
            self.client.username(),
            self.current.display_name_for(self.client.id()),
            text.len()
        );

        let message = ServerMessage::user(self.client.username(), text);
        if let Err(e) = self.current.broadcast(message) {
            self.client.notify(ServerMessage::from(&e));
            self.return_to_welcome().await;
        }
    }

    async fn switch_and_post(&mut self, channel: Channel, message: Option<String>) {
        match self.switch_to(channel).await {
            Ok(()) => {
                if let Some(text) = message {
                    self.send_message(text).await;
                }
            }
            Err(e) => self.client.notify(ServerMessage::from(&e)),
        }
    }

    /// Leave the current channel, then join `target`
    ///
    /// If `target` refuses the join, the client goes back to the channel
    /// it came from.
    async fn switch_to(&mut self, target: Channel) -> Result<(), ChatError> {
        self.current.unregister(&self.client).await;
        let previous = std::mem::replace(&mut self.current, target);

        if let Err(e) = self.current.register(self.client.clone()).await {
            warn!(
                "{} could not join {}: {}",
                self.client.username(),
                self.current.display_name_for(self.client.id()),
                e
            );
            self.current = previous;
            if let Err(e) = self.current.register(self.client.clone()).await {
                debug!("{} could not rejoin previous channel: {}", self.client.username(), e);
            }
            return Err(e);
        }

        Ok(())
    }

    async fn return_to_welcome(&mut self) {
        match self.registry.welcome_channel().await {
            Ok(welcome) => {
                if let Err(e) = self.switch_to(welcome).await {
                    warn!("{} could not return to welcome: {}", self.client.username(), e);
                }
            }
            Err(e) => error!("Welcome channel unavailable: {}", e),
        }
    }

    async fn resolve_direct_channel(&self, peer: &str) -> Result<Channel, ChatError> {
        let peer_key = username_key(peer);
        if peer_key == self.client.key() {
            return Err(ChatError::DirectToSelf);
        }

        if let Some(channel) = self.client.direct_channel(&peer_key).await {
            return Ok(channel);
        }

        let peer_client = self
            .registry
            .get_user(peer)
            .await
            .ok_or_else(|| ChatError::UserNotFound(peer.to_string()))?;

        self.client.open_direct_channel(&peer_client).await
    }

    /// Leave every channel and drop out of the registry
    async fn teardown(self) {
        self.current.unregister(&self.client).await;

        // Direct channels go before the username is released
        let farewell = format!("{} has disconnected", self.client.username());
        for (peer_key, channel) in self.client.take_direct_channels().await {
            let _ = channel.broadcast(ServerMessage::server(farewell.clone()));
            channel.close();
            if let Some(peer) = self.registry.get_user(&peer_key).await {
                peer.forget_direct_channel(self.client.key(), &channel).await;
            }
        }

        self.registry.remove_user(&self.client).await;

        info!("Client {} ({}) disconnected", self.client.username(), self.client.id());
    }
}

/// Drain what is queued right now into one envelope
///
/// Counts the queue once and takes that many; anything arriving later
/// goes into the next envelope.
pub fn drain_batch(first: ServerMessage, outbound: &mut mpsc::Receiver<ServerMessage>) -> ServerMessages {
    let queued = outbound.len();
    let mut messages = Vec::with_capacity(queued + 1);
    messages.push(first);

    for _ in 0..queued {
        match outbound.try_recv() {
            Ok(message) => messages.push(message),
            Err(_) => break,
        }
    }

    ServerMessages { messages }
}

async fn write_loop<W>(mut sink: W, mut outbound: mpsc::Receiver<ServerMessage>, config: ServerConfig)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + config.ping_period(), config.ping_period());

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(first) = next else {
                    debug!("Outbound queue closed, sending close frame");
                    let _ = send_frame(&mut sink, Message::Close(None), config.write_wait).await;
                    break;
                };

                let batch = drain_batch(first, &mut outbound);
                match serde_json::to_string(&batch) {
                    Ok(json) => {
                        if !send_frame(&mut sink, Message::Text(json.into()), config.write_wait).await {
                            break;
                        }
                    }
                    // Don't break on serialization errors
                    Err(e) => error!("Failed to serialize messages: {}", e),
                }
            }
            _ = ticker.tick() => {
                if !send_frame(&mut sink, Message::Ping(Vec::new().into()), config.write_wait).await {
                    break;
                }
            }
        }
    }

    debug!("Write loop ended");
}

/// Send one frame within the write deadline; `false` means the socket is dead
async fn send_frame<W>(sink: &mut W, message: Message, write_wait: Duration) -> bool
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("WebSocket send failed: {}", e);
            false
        }
        Err(_) => {
            warn!("WebSocket write timed out after {:?}", write_wait);
            false
        }
    }
}
