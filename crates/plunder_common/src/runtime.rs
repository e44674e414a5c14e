// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Creates a cancellation token that is cancelled once the process receives
/// SIGTERM or SIGINT. Components select on this token for orderly shutdown.
pub fn create_shutdown_cancellation_token() -> CancellationToken {
    let cancellation_token = CancellationToken::new();
    let signal_cancellation_token = cancellation_token.clone();

    spawn(async move {
        let mut terminate = match signal::unix::signal(SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(error) => {
                warn! {
                    ?error,
                    "unable to listen for SIGTERM, only SIGINT will be handled"
                }
                None
            }
        };

        select! {
            _ = signal::ctrl_c() => {}
            _ = async {
                match terminate.as_mut() {
                    Some(signal) => { signal.recv().await; }
                    None => std::future::pending().await,
                }
            } => {}
        }

        info!("shutdown signal received");
        signal_cancellation_token.cancel();
    });
    cancellation_token
}
