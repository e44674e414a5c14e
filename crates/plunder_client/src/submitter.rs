// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! The connection loop: dial, run one session, reconnect when it dies.
//! The write side of a session drains the flag channel onto the socket;
//! the read side dispatches configuration pushes and acknowledgements.
//! A flag whose write failed is held back and resent on the next link.

use crate::dialer::{DialError, Dialer, WsStream};
use crate::monitor::ConnectionMonitor;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use plunder_common::models::{Flag, SharedConfig};
use plunder_common::proto::{Event, ProtoError};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
enum SessionError {
    #[error("write timed out")]
    Timeout,
    #[error("websocket write failed")]
    Write(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("envelope encoding failed")]
    Encode(#[source] ProtoError),
    #[error("read side closed")]
    ReadClosed,
}

pub struct Submitter {
    dialer: Dialer,
    monitor: Arc<ConnectionMonitor>,
    write_wait: Duration,
    retry_pause: Duration,
}

impl Submitter {
    pub fn new(dialer: Dialer, monitor: Arc<ConnectionMonitor>) -> Self {
        Self {
            dialer,
            monitor,
            write_wait: Duration::from_secs(10),
            retry_pause: Duration::from_secs(5),
        }
    }

    pub fn with_retry_pause(mut self, retry_pause: Duration) -> Self {
        self.retry_pause = retry_pause;
        self
    }

    /// Runs until cancelled. `probe_rx` carries ping requests from the
    /// health task; `config_tx` publishes configurations pushed by the
    /// server.
    pub async fn run(
        &self,
        flags_rx: flume::Receiver<Flag>,
        probe_rx: flume::Receiver<()>,
        config_tx: watch::Sender<Option<SharedConfig>>,
        cancellation_token: CancellationToken,
    ) {
        let mut pending: Option<Flag> = None;

        loop {
            let ws = select! {
                _ = cancellation_token.cancelled() => return,
                result = self.dialer.connect() => match result {
                    Ok(ws) => ws,
                    Err(DialError::CircuitOpen) => {
                        debug!("circuit open, waiting before the next dial");
                        select! {
                            _ = cancellation_token.cancelled() => return,
                            _ = tokio::time::sleep(self.retry_pause) => continue,
                        }
                    }
                    Err(error) => {
                        warn! {
                            ?error,
                            "dial cycle failed"
                        }
                        select! {
                            _ = cancellation_token.cancelled() => return,
                            _ = tokio::time::sleep(self.retry_pause) => continue,
                        }
                    }
                }
            };

            let ended = self
                .session(
                    ws,
                    &flags_rx,
                    &probe_rx,
                    &config_tx,
                    &mut pending,
                    &cancellation_token,
                )
                .await;
            match ended {
                Some(error) => self.monitor.record_disconnect(Some(&error.to_string())),
                None => self.monitor.record_disconnect(None),
            }

            if cancellation_token.is_cancelled() {
                return;
            }
            info!("connection lost, reconnecting");
        }
    }

    /// One established connection. Returns the error that ended it, or
    /// `None` for an orderly shutdown.
    async fn session(
        &self,
        ws: WsStream,
        flags_rx: &flume::Receiver<Flag>,
        probe_rx: &flume::Receiver<()>,
        config_tx: &watch::Sender<Option<SharedConfig>>,
        pending: &mut Option<Flag>,
        cancellation_token: &CancellationToken,
    ) -> Option<SessionError> {
        let (mut sink, stream) = ws.split();
        let session_token = CancellationToken::new();
        let (pong_tx, pong_rx) = flume::bounded::<Vec<u8>>(8);

        let reader = tokio::spawn(read_pump(
            stream,
            self.monitor.clone(),
            pong_tx,
            config_tx.clone(),
            session_token.clone(),
        ));

        let ended = loop {
            // the flag that was in flight when the previous link died
            if let Some(flag) = pending.take() {
                if let Err(error) = self.send_flag(&mut sink, &flag).await {
                    *pending = Some(flag);
                    break Some(error);
                }
                continue;
            }

            select! {
                _ = cancellation_token.cancelled() => break None,
                _ = session_token.cancelled() => break Some(SessionError::ReadClosed),
                data = pong_rx.recv_async() => {
                    let Ok(data) = data else { break Some(SessionError::ReadClosed) };
                    if let Err(error) = self.send(&mut sink, Message::Pong(data)).await {
                        break Some(error);
                    }
                }
                _ = probe_rx.recv_async() => {
                    self.monitor.record_ping_sent();
                    if let Err(error) = self.send(&mut sink, Message::Ping(Vec::new())).await {
                        break Some(error);
                    }
                }
                flag = flags_rx.recv_async() => {
                    // a closed channel means every producer is gone
                    let Ok(flag) = flag else { break None };
                    if let Err(error) = self.send_flag(&mut sink, &flag).await {
                        *pending = Some(flag);
                        break Some(error);
                    }
                }
            }
        };

        session_token.cancel();
        // best effort, the peer may already be gone
        let _ = timeout(self.write_wait, sink.send(Message::Close(None))).await;
        let _ = reader.await;
        ended
    }

    async fn send_flag(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        flag: &Flag,
    ) -> Result<(), SessionError> {
        let text = Event::Flag(flag.clone())
            .encode()
            .map_err(SessionError::Encode)?;
        self.send(sink, Message::Text(text)).await?;
        self.monitor.record_message_sent();
        debug!(flag = %flag.flag_code, "flag sent");
        Ok(())
    }

    async fn send(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        message: Message,
    ) -> Result<(), SessionError> {
        match timeout(self.write_wait, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(SessionError::Write(error)),
            Err(_) => Err(SessionError::Timeout),
        }
    }
}

/// Consumes the read half until the connection dies or the session is
/// cancelled. Malformed events are dropped, never fatal; the server is
/// trusted enough to keep listening to.
async fn read_pump(
    mut stream: SplitStream<WsStream>,
    monitor: Arc<ConnectionMonitor>,
    pong_tx: flume::Sender<Vec<u8>>,
    config_tx: watch::Sender<Option<SharedConfig>>,
    session_token: CancellationToken,
) {
    loop {
        let message = select! {
            _ = session_token.cancelled() => return,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(raw))) => {
                monitor.record_message_received();
                match Event::decode(&raw) {
                    Ok(Event::Config(config)) => {
                        info!("received a configuration push");
                        let _ = config_tx.send(Some(config));
                    }
                    Ok(Event::FlagResponse(receipt)) => {
                        debug!(received_at = receipt.received_at, "flag acknowledged");
                    }
                    Ok(event) => {
                        warn! {
                            kind = event.kind(),
                            "dropping unexpected event from the server"
                        }
                    }
                    Err(error) => {
                        warn! {
                            ?error,
                            "dropping malformed event"
                        }
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = pong_tx.try_send(data);
            }
            Some(Ok(Message::Pong(_))) => monitor.record_pong(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                warn! {
                    ?error,
                    "websocket read failed"
                }
                break;
            }
        }
    }
    session_token.cancel();
}
