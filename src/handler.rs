//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, user
//! admission, and handing the socket over to the multiplexer.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::client::ClientHandle;
use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::message::ServerMessage;
use crate::multiplexer::Multiplexer;
use crate::registry::Registry;
use crate::validation::{is_anonymous_request, validate_username};

/// Path clients upgrade on
pub const WS_PATH: &str = "/ws";

/// Accept connections forever, one task per connection
pub async fn serve(listener: TcpListener, registry: Arc<Registry>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let registry = Arc::clone(&registry);

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, admits the user into the registry and
/// the welcome channel, then runs the multiplexer until the connection ends.
pub async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) -> Result<(), ChatError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let config = registry.config();
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);

    let mut requested = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        requested = check_request(request, config)?;
        Ok(response)
    };

    let mut ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

    // Create the bounded outbound queue for this connection
    let (sender, outbound) = mpsc::channel(config.outbound_capacity);

    let admitted = if is_anonymous_request(&requested) {
        Ok(registry.add_anonymous_user(sender).await)
    } else {
        admit_named(&registry, requested, sender).await
    };

    let client = match admitted {
        Ok(client) => client,
        Err(e) => {
            warn!("Rejected login from {}: {}", peer_addr, e);
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            let _ = ws_stream.close(Some(frame)).await;
            return Ok(());
        }
    };

    info!("Client {} ({}) connected from {}", client.username(), client.id(), peer_addr);

    let welcome = match registry.welcome_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            registry.remove_user(&client).await;
            return Err(e);
        }
    };
    if let Err(e) = welcome.register(client.clone()).await {
        registry.remove_user(&client).await;
        return Err(e);
    }

    Multiplexer::new(Arc::clone(&registry), client, welcome)
        .run(ws_stream, outbound)
        .await;

    Ok(())
}

async fn admit_named(
    registry: &Registry,
    username: String,
    sender: mpsc::Sender<ServerMessage>,
) -> Result<ClientHandle, ChatError> {
    validate_username(&username)?;
    let client = ClientHandle::new(username, sender);
    registry.add_user(client.clone()).await?;
    Ok(client)
}

/// Validate the upgrade request and extract the requested username
fn check_request(request: &Request, config: &ServerConfig) -> Result<String, ErrorResponse> {
    if request.uri().path() != WS_PATH {
        return Err(error_response(StatusCode::NOT_FOUND, "Not found"));
    }

    let origin = request
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok());
    if !config.origin_allowed(origin) {
        return Err(error_response(StatusCode::FORBIDDEN, "Invalid origin"));
    }

    query_param(request.uri().query(), "username")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Missing username"))
}

fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Value of `key` in a URL query string, form-decoded
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.into_owned())
}
