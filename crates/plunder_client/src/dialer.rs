// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! Establishes the WebSocket connection to the server: exponential backoff
//! between attempts, a dial timeout per attempt, token refresh when the
//! server answers 401 and the circuit breaker wrapped around all of it.

use crate::auth::{AuthError, TokenSource};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::monitor::ConnectionMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Error};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("handshake timed out")]
    Timeout,
    #[error("server rejected the token")]
    Unauthorized,
    #[error("token refresh failed")]
    Auth(#[source] AuthError),
    #[error("websocket handshake failed")]
    Handshake(#[source] tungstenite::Error),
    #[error("invalid dial request: {0}")]
    BadRequest(String),
}

pub struct Dialer {
    url: String,
    tokens: Arc<dyn TokenSource>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<ConnectionMonitor>,
    max_attempts: u32,
    dial_timeout: Duration,
    backoff_base: Duration,
}

impl Dialer {
    pub fn new(
        url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<ConnectionMonitor>,
    ) -> Self {
        Self {
            url: url.into(),
            tokens,
            breaker,
            monitor,
            max_attempts: 3,
            dial_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn with_timing(mut self, dial_timeout: Duration, backoff_base: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self.backoff_base = backoff_base;
        self
    }

    /// One dial cycle. Retries up to `max_attempts` times with exponential
    /// backoff; a half-open breaker admits a single probe attempt. The
    /// whole cycle counts as one result towards the breaker.
    pub async fn connect(&self) -> Result<WsStream, DialError> {
        if !self.breaker.is_allowed() {
            return Err(DialError::CircuitOpen);
        }
        let attempts = match self.breaker.state() {
            CircuitState::HalfOpen => 1,
            _ => self.max_attempts,
        };

        let mut token = self.tokens.token();
        let mut last = None;

        for attempt in 0..attempts {
            self.monitor.record_attempt();

            let error = match self.attempt(&token).await {
                Ok(ws) => {
                    self.breaker.record_success();
                    self.monitor.record_connect();
                    info!(url = %self.url, "connected");
                    return Ok(ws);
                }
                Err(DialError::Unauthorized) => {
                    warn!("token rejected, refreshing");
                    match self.tokens.refresh().await {
                        Ok(fresh) => token = fresh,
                        Err(error) => {
                            self.monitor.record_failed_connect("token refresh failed");
                            self.breaker.record_failure();
                            return Err(DialError::Auth(error));
                        }
                    }
                    DialError::Unauthorized
                }
                Err(error) => error,
            };

            warn! {
                attempt = attempt + 1,
                ?error,
                "dial attempt failed"
            }
            self.monitor.record_failed_connect(&error.to_string());
            last = Some(error);

            tokio::time::sleep(backoff_delay(self.backoff_base, attempt)).await;
        }

        self.breaker.record_failure();
        Err(last.unwrap_or(DialError::Timeout))
    }

    async fn attempt(&self, token: &str) -> Result<WsStream, DialError> {
        let request = build_request(&self.url, token)?;
        match timeout(self.dial_timeout, connect_async(request)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(Error::Http(response))) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(DialError::Unauthorized)
            }
            Ok(Err(error)) => Err(DialError::Handshake(error)),
            Err(_) => Err(DialError::Timeout),
        }
    }
}

fn build_request(url: &str, token: &str) -> Result<Request, DialError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| DialError::BadRequest(e.to_string()))?;
    let cookie = HeaderValue::from_str(&format!("token={token}"))
        .map_err(|e| DialError::BadRequest(e.to_string()))?;
    request.headers_mut().insert(COOKIE, cookie);
    Ok(request)
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn dialer(url: &str, breaker: Arc<CircuitBreaker>) -> (Dialer, Arc<ConnectionMonitor>) {
        let monitor = Arc::new(ConnectionMonitor::default());
        let dialer = Dialer::new(
            url,
            Arc::new(StaticToken::new("secret")),
            breaker,
            monitor.clone(),
        )
        .with_timing(Duration::from_millis(500), Duration::from_millis(10));
        (dialer, monitor)
    }

    #[test]
    fn should_double_the_backoff_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn should_not_dial_when_the_circuit_is_open() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(30)));
        breaker.record_failure();

        // port 1 is never listening, but it must not even be tried
        let (dialer, monitor) = dialer("ws://127.0.0.1:1/ws", breaker);
        let err = dialer.connect().await.unwrap_err();
        assert!(matches!(err, DialError::CircuitOpen));
        assert_eq!(monitor.stats().connection_attempts, 0);
    }

    #[tokio::test]
    async fn should_back_off_between_failed_attempts() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
        let (dialer, monitor) = dialer("ws://127.0.0.1:1/ws", breaker.clone());

        let started = Instant::now();
        let err = dialer.connect().await.unwrap_err();
        assert!(matches!(err, DialError::Handshake(_)));

        // 10ms + 20ms + 40ms of backoff across the three attempts
        assert!(started.elapsed() >= Duration::from_millis(70));
        assert_eq!(monitor.stats().connection_attempts, 3);
        // the cycle counts as a single breaker failure
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn should_probe_once_when_half_open() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_millis(10)));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (dialer, monitor) = dialer("ws://127.0.0.1:1/ws", breaker.clone());
        dialer.connect().await.unwrap_err();

        assert_eq!(monitor.stats().connection_attempts, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    struct CountingTokens {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        fn token(&self) -> String {
            "stale".to_string()
        }

        async fn refresh(&self) -> Result<String, AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok("stale".to_string())
        }
    }

    async fn reject_with_401(listener: TcpListener) {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await;
        }
    }

    #[tokio::test]
    async fn should_refresh_the_token_on_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        tokio::spawn(reject_with_401(listener));

        let tokens = Arc::new(CountingTokens {
            refreshes: AtomicUsize::new(0),
        });
        let monitor = Arc::new(ConnectionMonitor::default());
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
        let dialer = Dialer::new(url, tokens.clone(), breaker, monitor)
            .with_timing(Duration::from_millis(500), Duration::from_millis(1));

        let err = dialer.connect().await.unwrap_err();
        assert!(matches!(err, DialError::Unauthorized));
        // every rejected attempt triggers a refresh before the next one
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 3);
    }
}
