// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! The flag ingestion WebSocket server: one [actor] per accepted
//! connection, all of them tracked by the [Registry].

mod actor;

use crate::auth::TokenVerifier;
use crate::collector::FlagCollector;
use dashmap::DashMap;
use plunder_common::models::{unix_now, SharedConfig};
use plunder_common::proto::{Event, FlagReceipt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// How long we will await a pong response before declaring the peer dead
    pub pong_wait: Duration,
    /// Time allowed to write a single frame to the peer
    pub write_wait: Duration,
    /// Hard cap on connection age; clients reconnect past it
    pub lifetime: Duration,
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
}

impl KeepaliveConfig {
    /// Pings must go out faster than `pong_wait` or we would declare peers
    /// dead before giving them a chance to answer. 90% by convention.
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            lifetime: Duration::from_secs(24 * 60 * 60),
            max_message_size: 1024,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(&'static str),
    #[error("flag buffering failed")]
    Collector(#[from] crate::collector::CollectorError),
}

/// Per-connection handle owned by the registry. The actor tasks themselves
/// only hold the pieces they need; the registry exclusively owns the
/// lifetime of its entries.
pub(crate) struct ClientHandle {
    egress: flume::Sender<String>,
    closing: CancellationToken,
}

/// Tracks live client connections, routes their inbound events and fans
/// outbound events out to all of them.
pub struct Registry {
    clients: DashMap<u64, ClientHandle>,
    next_id: AtomicU64,
    collector: Arc<FlagCollector>,
    keepalive: KeepaliveConfig,
}

impl Registry {
    pub fn new(collector: Arc<FlagCollector>, keepalive: KeepaliveConfig) -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
            collector,
            keepalive,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn add_client(&self) -> (u64, flume::Receiver<String>, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (egress_tx, egress_rx) = flume::bounded(64);
        let closing = CancellationToken::new();
        self.clients.insert(
            id,
            ClientHandle {
                egress: egress_tx,
                closing: closing.clone(),
            },
        );
        (id, egress_rx, closing)
    }

    /// Deregisters a client and signals its pumps to wind down. Safe to
    /// call from either pump, the lifetime timer or an administrative
    /// shutdown; only the first call has any effect.
    pub(crate) fn close_client(&self, id: u64, reason: &str) {
        if let Some((_, handle)) = self.clients.remove(&id) {
            warn! {
                client = id,
                reason,
                active_clients = self.clients.len(),
                "closing client connection"
            }
            handle.closing.cancel();
        }
    }

    /// Closes every live connection. Used during orderly shutdown, after
    /// the collector has taken its final flush.
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.clients.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.close_client(id, "server shutting down");
        }
    }

    /// Pushes a new shared configuration to every connected client.
    pub fn broadcast_config(&self, config: &SharedConfig) {
        let frame = match Event::Config(config.clone()).encode() {
            Ok(frame) => frame,
            Err(error) => {
                warn! {
                    ?error,
                    "unable to encode the config event"
                }
                return;
            }
        };
        for entry in self.clients.iter() {
            if entry.value().egress.try_send(frame.clone()).is_err() {
                warn!(client = entry.key(), "egress full, config event not sent");
            }
        }
        info!(clients = self.clients.len(), "configuration broadcast");
    }

    /// Dispatches one decoded inbound event. The server only consumes flag
    /// events; anything else is an error the caller logs without closing
    /// the connection.
    pub(crate) async fn route_event(&self, event: Event, client_id: u64) -> Result<(), RouteError> {
        match event {
            Event::Flag(flag) => {
                info! {
                    client = client_id,
                    flag = %flag.flag_code,
                    team = flag.team_id,
                    service = %flag.service_name,
                    port = flag.port_service,
                    "flag received"
                }
                self.collector.add_flag(flag).await?;

                // best-effort receipt, dropped if the egress is full
                if let Some(handle) = self.clients.get(&client_id) {
                    let receipt = Event::FlagResponse(FlagReceipt {
                        received_at: unix_now(),
                    });
                    if let Ok(frame) = receipt.encode() {
                        let _ = handle.egress.try_send(frame);
                    }
                }
                Ok(())
            }
            Event::Config(_) => Err(RouteError::UnsupportedEvent("config")),
            Event::FlagResponse(_) => Err(RouteError::UnsupportedEvent("flag_response")),
        }
    }
}

/// Accept loop for the flag ingestion listener. Returns once the
/// cancellation token fires.
pub async fn listen(
    listener: TcpListener,
    registry: Arc<Registry>,
    verifier: Arc<dyn TokenVerifier>,
    cancellation_token: CancellationToken,
) -> color_eyre::eyre::Result<()> {
    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                return Ok(());
            }
            res = listener.accept() => {
                let (stream, client_socket): (TcpStream, SocketAddr) = res?;
                debug! {
                    ?client_socket,
                    "accepted a client"
                }
                let registry = registry.clone();
                let verifier = verifier.clone();
                spawn(async move {
                    if let Err(error) = actor::serve(stream, registry, verifier).await {
                        warn! {
                            ?error,
                            "connection handling error"
                        }
                    }
                });
            }
        }
    }
}
