// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! One actor per accepted connection: a read pump enforcing the keepalive
//! deadline and a write pump multiplexing pings with application frames.
//! Either pump failing tears the whole connection down exactly once.

use crate::auth::TokenVerifier;
use crate::ws::{Registry, RouteError};
use color_eyre::eyre;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use plunder_common::proto::{Event, ProtoError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio::{join, select, spawn};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Upgrades an accepted TCP stream, registers the client and runs its
/// pumps until the connection dies or is closed.
pub(crate) async fn serve(
    stream: TcpStream,
    registry: Arc<Registry>,
    verifier: Arc<dyn TokenVerifier>,
) -> eyre::Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(registry.keepalive.max_message_size),
        max_frame_size: Some(registry.keepalive.max_message_size),
        ..Default::default()
    };

    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let token = token_from_request(req);
        match verifier.verify(token.as_deref().unwrap_or_default()) {
            Ok(()) => Ok(response),
            Err(error) => {
                warn! {
                    ?error,
                    "rejecting unauthenticated connection"
                }
                let mut response = ErrorResponse::new(None);
                *response.status_mut() = StatusCode::UNAUTHORIZED;
                Err(response)
            }
        }
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let (id, egress_rx, closing) = registry.add_client();
    info!(client = id, active_clients = registry.client_count(), "client connected");

    let (sink, source) = ws.split();
    let keepalive = registry.keepalive.clone();

    let read = spawn(read_pump(
        source,
        registry.clone(),
        id,
        closing.clone(),
        keepalive.pong_wait,
    ));
    let write = spawn(write_pump(
        sink,
        egress_rx,
        registry.clone(),
        id,
        closing.clone(),
        keepalive.ping_interval(),
        keepalive.write_wait,
    ));

    select! {
        _ = closing.cancelled() => {}
        _ = tokio::time::sleep(keepalive.lifetime) => {
            registry.close_client(id, "connection lifetime exceeded");
        }
    }

    let _ = join!(read, write);
    Ok(())
}

/// Pulls the pre-shared token out of the upgrade request's cookies.
fn token_from_request(req: &Request) -> Option<String> {
    let cookies = req.headers().get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "token").then(|| value.to_string())
    })
}

/// Decodes inbound frames and routes them. The deadline is refreshed by
/// pongs only; a peer that stops answering pings is declared dead within
/// one `pong_wait` of the missed deadline.
async fn read_pump(
    mut source: WsSource,
    registry: Arc<Registry>,
    id: u64,
    closing: CancellationToken,
    pong_wait: Duration,
) {
    let mut deadline = Instant::now() + pong_wait;
    loop {
        let res = select! {
            _ = closing.cancelled() => return,
            res = timeout_at(deadline, source.next()) => res,
        };
        let message = match res {
            Err(_) => {
                registry.close_client(id, "keepalive deadline exceeded");
                return;
            }
            Ok(None) => {
                registry.close_client(id, "connection closed by peer");
                return;
            }
            Ok(Some(Err(error))) => {
                debug!(client = id, ?error, "read error");
                registry.close_client(id, "read error");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Pong(_) => {
                debug!(client = id, "received pong");
                deadline = Instant::now() + pong_wait;
            }
            // tungstenite queues the response pong on its own
            Message::Ping(_) => {}
            Message::Close(_) => {
                registry.close_client(id, "client requested close");
                return;
            }
            Message::Text(raw) => match Event::decode(&raw) {
                Ok(event) => match registry.route_event(event, id).await {
                    Ok(()) => {}
                    Err(RouteError::UnsupportedEvent(kind)) => {
                        warn!(client = id, kind, "unsupported event, ignoring");
                    }
                    Err(error) => {
                        warn! {
                            client = id,
                            ?error,
                            "unable to handle event"
                        }
                    }
                },
                // an unknown type tag is not malformed, newer clients may
                // speak events this server does not
                Err(ProtoError::UnsupportedEvent(kind)) => {
                    warn!(client = id, kind = %kind, "unknown event type, ignoring");
                }
                Err(error) => {
                    warn! {
                        client = id,
                        ?error,
                        "malformed event, terminating connection"
                    }
                    registry.close_client(id, "malformed event");
                    return;
                }
            },
            Message::Binary(_) => {
                registry.close_client(id, "unexpected binary frame");
                return;
            }
            _ => {}
        }
    }
}

/// Multiplexes the egress channel with the ping ticker so pings do not
/// starve application writes and vice versa. Every write is bounded by
/// `write_wait`. Owns the sink, so the best-effort close frame on the way
/// out is written exactly once.
async fn write_pump(
    mut sink: WsSink,
    egress_rx: flume::Receiver<String>,
    registry: Arc<Registry>,
    id: u64,
    closing: CancellationToken,
    ping_interval: Duration,
    write_wait: Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        select! {
            _ = closing.cancelled() => break,
            _ = ticker.tick() => {
                debug!(client = id, "sending ping");
                match timeout(write_wait, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        registry.close_client(id, "ping write failed");
                        break;
                    }
                }
            }
            res = egress_rx.recv_async() => {
                let frame = match res {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                match timeout(write_wait, sink.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        registry.close_client(id, "write error");
                        break;
                    }
                }
            }
        }
    }

    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
}
