// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

pub mod auth;
pub mod breaker;
pub mod config;
pub mod dialer;
pub mod monitor;
pub mod parser;
pub mod submitter;

use crate::auth::{PasswordSession, StaticToken, TokenSource};
use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::dialer::Dialer;
use crate::monitor::ConnectionMonitor;
use crate::parser::FlagParser;
use crate::submitter::Submitter;
use color_eyre::eyre::{bail, Context, Result};
use plunder_common::models::{Flag, SharedConfig};
use plunder_common::runtime::create_shutdown_cancellation_token;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn main(config: Config) -> Result<()> {
    let cancellation_token = create_shutdown_cancellation_token();
    run(config, cancellation_token).await
}

pub async fn run(config: Config, cancellation_token: CancellationToken) -> Result<()> {
    info!("starting client");

    let tokens: Arc<dyn TokenSource> = match (&config.token, &config.password) {
        (Some(token), _) => Arc::new(StaticToken::new(token.as_str())),
        (None, Some(password)) => {
            let login_url = config
                .login_url
                .clone()
                .unwrap_or_else(|| format!("http://{}/login", config.server_addr));
            let session = PasswordSession::new(login_url, password.as_str());
            session
                .refresh()
                .await
                .context("initial password login failed")?;
            Arc::new(session)
        }
        (None, None) => bail!("either a token or a password is required"),
    };

    let breaker = Arc::new(CircuitBreaker::default());
    let monitor = Arc::new(ConnectionMonitor::default());
    let dialer = Dialer::new(
        format!("ws://{}/ws", config.server_addr),
        tokens,
        breaker,
        monitor.clone(),
    );
    let submitter = Submitter::new(dialer, monitor.clone());

    let (flags_tx, flags_rx) = flume::bounded::<Flag>(1024);
    let (probe_tx, probe_rx) = flume::bounded::<()>(1);
    let (config_tx, config_rx) = watch::channel::<Option<SharedConfig>>(None);

    tokio::spawn(
        monitor
            .clone()
            .run_health_task(probe_tx, cancellation_token.clone()),
    );
    tokio::spawn(feed_stdin(
        config,
        flags_tx,
        config_rx,
        cancellation_token.clone(),
    ));

    submitter
        .run(flags_rx, probe_rx, config_tx, cancellation_token)
        .await;

    info!("client stopped");
    Ok(())
}

/// Reads exploit output from stdin and queues every flag it finds. The
/// parser is rebuilt when the server pushes a configuration with a
/// different flag format; a broken pushed format keeps the current parser.
async fn feed_stdin(
    config: Config,
    flags_tx: flume::Sender<Flag>,
    mut config_rx: watch::Receiver<Option<SharedConfig>>,
    cancellation_token: CancellationToken,
) {
    let mut parser = match FlagParser::new(
        &config.flag_format,
        config.service_name.as_str(),
        config.service_port,
    ) {
        Ok(parser) => parser,
        Err(error) => {
            error! {
                ?error,
                "invalid flag format, no flags will be parsed"
            }
            return;
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            _ = cancellation_token.cancelled() => return,
            changed = config_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let Some(pushed) = config_rx.borrow_and_update().clone() else {
                    continue;
                };
                match FlagParser::new(
                    &pushed.client.flag_format,
                    config.service_name.as_str(),
                    config.service_port,
                ) {
                    Ok(rebuilt) => {
                        info! {
                            format = %pushed.client.flag_format,
                            "flag format updated"
                        }
                        parser = rebuilt;
                    }
                    Err(error) => {
                        warn! {
                            ?error,
                            "pushed flag format does not compile, keeping the current one"
                        }
                    }
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        for flag in parser.parse_line(&line, config.team_id) {
                            info!(flag = %flag.flag_code, "flag captured");
                            if flags_tx.send_async(flag).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        // keep the sender alive so the connection stays up
                        // for configuration pushes
                        info!("stdin closed, no more flags will be read");
                        cancellation_token.cancelled().await;
                        return;
                    }
                    Err(error) => {
                        warn! {
                            ?error,
                            "failed to read from stdin"
                        }
                        cancellation_token.cancelled().await;
                        return;
                    }
                }
            }
        }
    }
}
