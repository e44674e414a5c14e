// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! Connection health bookkeeping. Every pump records what it does here,
//! and a periodic task inspects the numbers, asks the writer to probe the
//! server and flags connections that have gone quiet.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub status: ConnectionStatus,
    pub connection_attempts: u64,
    pub successful_connects: u64,
    pub failed_connects: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub consecutive_errors: u64,
    pub last_connect: Option<Instant>,
    pub last_disconnect: Option<Instant>,
    pub last_send: Option<Instant>,
    pub last_receive: Option<Instant>,
    pub last_error: Option<String>,
    pub current_latency: Option<Duration>,
    pub average_latency: Option<Duration>,
    last_ping: Option<Instant>,
    total_latency: Duration,
    latency_samples: u32,
}

impl ConnectionStats {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connection_attempts: 0,
            successful_connects: 0,
            failed_connects: 0,
            messages_sent: 0,
            messages_received: 0,
            consecutive_errors: 0,
            last_connect: None,
            last_disconnect: None,
            last_send: None,
            last_receive: None,
            last_error: None,
            current_latency: None,
            average_latency: None,
            last_ping: None,
            total_latency: Duration::ZERO,
            latency_samples: 0,
        }
    }

    /// The most recent traffic in either direction.
    fn last_activity(&self) -> Option<Instant> {
        match (self.last_send, self.last_receive) {
            (Some(s), Some(r)) => Some(s.max(r)),
            (s, r) => s.or(r),
        }
    }
}

pub struct ConnectionMonitor {
    stats: RwLock<ConnectionStats>,
    health_interval: Duration,
    inactivity_window: Duration,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(5 * 60))
    }
}

impl ConnectionMonitor {
    pub fn new(health_interval: Duration, inactivity_window: Duration) -> Self {
        Self {
            stats: RwLock::new(ConnectionStats::new()),
            health_interval,
            inactivity_window,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.stats.read().unwrap().status
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().unwrap().clone()
    }

    pub fn record_attempt(&self) {
        let mut stats = self.stats.write().unwrap();
        stats.connection_attempts += 1;
        stats.status = if stats.successful_connects > 0 {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
    }

    pub fn record_connect(&self) {
        let mut stats = self.stats.write().unwrap();
        stats.successful_connects += 1;
        stats.consecutive_errors = 0;
        stats.status = ConnectionStatus::Connected;
        stats.last_connect = Some(Instant::now());
        stats.last_error = None;
    }

    pub fn record_failed_connect(&self, error: &str) {
        let mut stats = self.stats.write().unwrap();
        stats.failed_connects += 1;
        stats.consecutive_errors += 1;
        stats.status = ConnectionStatus::Failed;
        stats.last_error = Some(error.to_string());
    }

    pub fn record_disconnect(&self, error: Option<&str>) {
        let mut stats = self.stats.write().unwrap();
        stats.status = ConnectionStatus::Disconnected;
        stats.last_disconnect = Some(Instant::now());
        if let Some(error) = error {
            stats.consecutive_errors += 1;
            stats.last_error = Some(error.to_string());
        }
    }

    pub fn record_message_sent(&self) {
        let mut stats = self.stats.write().unwrap();
        stats.messages_sent += 1;
        stats.last_send = Some(Instant::now());
    }

    pub fn record_message_received(&self) {
        let mut stats = self.stats.write().unwrap();
        stats.messages_received += 1;
        stats.last_receive = Some(Instant::now());
    }

    pub fn record_ping_sent(&self) {
        let mut stats = self.stats.write().unwrap();
        stats.last_ping = Some(Instant::now());
        stats.last_send = Some(Instant::now());
    }

    /// Updates the latency figures from a pong answering the most recent
    /// ping. Unsolicited pongs only count as activity.
    pub fn record_pong(&self) {
        let mut stats = self.stats.write().unwrap();
        stats.last_receive = Some(Instant::now());
        if let Some(ping) = stats.last_ping.take() {
            let rtt = ping.elapsed();
            stats.current_latency = Some(rtt);
            stats.total_latency += rtt;
            stats.latency_samples += 1;
            stats.average_latency = Some(stats.total_latency / stats.latency_samples);
        }
    }

    /// Runs until cancelled. Each tick asks the writer (through `probe_tx`)
    /// to ping the server, then checks whether a nominally connected link
    /// has seen any traffic within the inactivity window.
    pub async fn run_health_task(
        self: Arc<Self>,
        probe_tx: flume::Sender<()>,
        cancellation_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            select! {
                _ = cancellation_token.cancelled() => return,
                _ = ticker.tick() => {
                    if self.status() == ConnectionStatus::Connected {
                        // best effort, the writer may be mid-reconnect
                        let _ = probe_tx.try_send(());
                    }
                    self.check_inactivity();

                    let stats = self.stats();
                    debug! {
                        status = ?stats.status,
                        sent = stats.messages_sent,
                        received = stats.messages_received,
                        latency = ?stats.current_latency,
                        "connection health"
                    }
                }
            }
        }
    }

    /// A connected link with no traffic at all inside the window is
    /// presumed dead and marked disconnected so the dial loop replaces it.
    pub(crate) fn check_inactivity(&self) {
        let mut stats = self.stats.write().unwrap();
        if stats.status != ConnectionStatus::Connected {
            return;
        }
        let idle_since = stats.last_activity().or(stats.last_connect);
        if let Some(at) = idle_since {
            if at.elapsed() >= self.inactivity_window {
                warn! {
                    idle = ?at.elapsed(),
                    "no traffic within the inactivity window, marking connection dead"
                }
                stats.status = ConnectionStatus::Disconnected;
                stats.last_disconnect = Some(Instant::now());
                stats.last_error = Some("inactivity window exceeded".to_string());
            }
        }
    }
}
