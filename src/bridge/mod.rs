//! Loopback bridge between tenant wrappers and the host.
//!
//! Each guest wrapper opens one TCP connection, announces itself with
//! `hello`, and then exchanges newline-delimited JSON with the host. Inbound
//! messages become [`HostEffectSink`] calls; outbound events are routed to the
//! connections of enabled tenants, or queued until the first wrapper
//! connects.

mod message;
mod rate_limit;
mod registry;
mod tokens;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use message::{BridgeMessage, InboundChatMessage, encode_event};
pub use rate_limit::{RateLimitKey, ReplyRateLimiter};
pub use registry::{ConnectionId, ConnectionRegistry, Delivery};
pub use tokens::HelloTokens;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::host::{HostEffectSink, TenantRegistry};
use crate::sandbox::sanitize_alias;

/// TCP bridge server.
pub struct BridgeServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    limiter: ReplyRateLimiter,
    tokens: Arc<HelloTokens>,
    tenants: Arc<dyn TenantRegistry>,
    effects: Arc<dyn HostEffectSink>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl BridgeServer {
    /// Bind the listener described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::BindFailed` if the address cannot be bound.
    pub async fn bind(
        config: &BridgeConfig,
        tenants: Arc<dyn TenantRegistry>,
        effects: Arc<dyn HostEffectSink>,
    ) -> Result<Arc<Self>> {
        let address = format!("{}:{}", config.bind_address, config.port);
        let bind_failed = |error: std::io::Error| BridgeError::BindFailed {
            address: address.clone(),
            message: error.to_string(),
        };
        let listener = TcpListener::bind(&address).await.map_err(bind_failed)?;
        let local_addr = listener.local_addr().map_err(bind_failed)?;
        tracing::info!(address = %local_addr, "bridge listening");

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            connections: ConnectionRegistry::default(),
            limiter: ReplyRateLimiter::new(Duration::from_millis(config.reply_interval_ms)),
            tokens: Arc::new(HelloTokens::default()),
            tenants,
            effects,
            shutdown,
        }))
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handshake tokens checked on `hello`. The executor launching tenants
    /// must issue from the same table.
    #[must_use]
    pub fn hello_tokens(&self) -> Arc<HelloTokens> {
        Arc::clone(&self.tokens)
    }

    /// Spawn the accept loop. Calling it again returns a task that exits
    /// immediately.
    pub fn serve(self: &Arc<Self>) -> JoinHandle<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let Some(listener) = listener else {
                tracing::warn!("bridge accept loop already running");
                return;
            };
            server.accept_loop(listener).await;
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "bridge connection accepted");
                        tokio::spawn(Arc::clone(&self).handle_connection(stream));
                    }
                    Err(error) => tracing::warn!(error = %error, "failed to accept bridge connection"),
                },
                () = wait_stopped(&mut shutdown) => break,
            }
        }
        tracing::info!("bridge accept loop stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (reader, mut writer) = stream.into_split();
        let (outbound, mut inbox) = mpsc::unbounded_channel::<String>();
        let (close, mut closed) = oneshot::channel();
        let id = self.connections.register(outbound, close);

        let writer_task = tokio::spawn(async move {
            while let Some(mut line) = inbox.recv().await {
                line.push('\n');
                if let Err(error) = writer.write_all(line.as_bytes()).await {
                    tracing::debug!(error = %error, "bridge writer stopped");
                    break;
                }
            }
            if let Err(error) = writer.shutdown().await {
                tracing::debug!(error = %error, "bridge writer shutdown failed");
            }
        });

        let mut shutdown = self.shutdown.subscribe();
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            tokio::select! {
                read = reader.read_until(b'\n', &mut buffer) => match read {
                    Ok(0) => break,
                    Ok(_) => self.handle_line(id, &buffer),
                    Err(error) => {
                        tracing::debug!(error = %error, "bridge reader stopped");
                        break;
                    }
                },
                _ = &mut closed => break,
                () = wait_stopped(&mut shutdown) => break,
            }
        }

        let alias = self.connections.alias_of(id);
        self.connections.remove(id);
        if let Err(error) = writer_task.await {
            tracing::debug!(error = %error, "bridge writer task failed");
        }
        tracing::debug!(alias = ?alias, "bridge connection closed");
    }

    fn handle_line(&self, id: ConnectionId, raw: &[u8]) {
        if raw.trim_ascii().is_empty() {
            return;
        }
        let message = match BridgeMessage::parse_bytes(raw.trim_ascii_end()) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(error = %error, "dropping bridge line");
                return;
            }
        };

        if let BridgeMessage::Hello { bot_id, token } = &message {
            let alias = sanitize_alias(bot_id);
            if !self.tokens.verify(&alias, token.as_deref()) {
                tracing::warn!(alias = %alias, "rejecting hello without a matching token");
                return;
            }
            let flushed = self.connections.hello(id, &alias);
            tracing::info!(alias = %alias, flushed, "bridge hello");
            return;
        }

        let Some(alias) = self.connections.alias_of(id) else {
            tracing::warn!(?message, "dropping bridge message sent before hello");
            return;
        };
        self.dispatch(&alias, message);
    }

    fn dispatch(&self, alias: &str, message: BridgeMessage) {
        match message {
            BridgeMessage::Hello { .. } => {}
            BridgeMessage::RegisterCommand { command } => {
                tracing::debug!(alias = %alias, command = %command, "command registered");
            }
            BridgeMessage::SetPrefix { prefixes } => {
                tracing::debug!(alias = %alias, ?prefixes, "prefixes changed");
            }
            BridgeMessage::Toast { message } => self.effects.toast(alias, &message),
            BridgeMessage::Vibrate { duration } => self.effects.vibrate(alias, duration),
            BridgeMessage::Notification { title, body } => {
                self.effects.notification(alias, &title, &body);
            }
            BridgeMessage::Reply { room, message } => {
                let key = RateLimitKey {
                    alias: String::from(alias),
                    room,
                    message,
                };
                if self.limiter.allow(key.clone()) {
                    self.effects.reply(alias, &key.room, &key.message);
                } else {
                    tracing::debug!(alias = %alias, room = %key.room, "suppressed duplicate reply");
                }
            }
        }
    }

    fn enabled_aliases(&self) -> HashSet<String> {
        match self.tenants.tenants() {
            Ok(tenants) => tenants
                .iter()
                .filter(|tenant| tenant.enabled)
                .map(crate::host::Tenant::alias)
                .collect(),
            Err(error) => {
                tracing::warn!(error = %error, "tenant lookup failed; broadcasting");
                HashSet::new()
            }
        }
    }

    /// Send `{type, data}` to enabled tenants' connections, to every
    /// connection if none match, or queue it if nothing is connected.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Encode` if `data` cannot be serialised.
    pub fn deliver<T: Serialize>(&self, event_type: &str, data: &T) -> Result<Delivery> {
        let line = encode_event(event_type, data)?;
        let delivery = self.connections.deliver(&line, &self.enabled_aliases());
        tracing::debug!(event_type, ?delivery, "bridge event delivered");
        Ok(delivery)
    }

    /// Forward a chat message to the guests as a `message` event.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Encode` if the payload cannot be serialised.
    pub fn forward_inbound_event(
        &self,
        room: &str,
        sender: &str,
        message: &str,
        is_group: bool,
    ) -> Result<Delivery> {
        self.deliver(
            "message",
            &InboundChatMessage {
                room,
                sender,
                message,
                is_group,
            },
        )
    }

    /// Close the connection announced as `alias`.
    pub fn disconnect(&self, alias: &str) -> bool {
        self.connections.disconnect(alias)
    }

    /// Aliases with a live connection, sorted.
    #[must_use]
    pub fn connected_aliases(&self) -> Vec<String> {
        self.connections.connected_aliases()
    }

    /// Lines waiting for the first connection.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.connections.pending_len()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.connections.close_all();
    }
}

async fn wait_stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopped| *stopped).await.is_err() {
        tracing::debug!("bridge shutdown channel closed");
    }
}
