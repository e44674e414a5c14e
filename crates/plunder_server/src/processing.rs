// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! The periodic submission job: reads unsubmitted flags from storage,
//! forwards them to the configured checker protocol and writes the
//! verdicts back. There is no separate retry queue; flags that could not
//! be submitted simply stay unsubmitted and are picked up next tick.

use crate::storage::{FlagStore, StorageError};
use crate::ws::Registry;
use plunder_checker::{Checker, CheckerError, Verdict};
use plunder_common::models::{unix_now, FlagStatus, ServerConfig, SharedConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ProcessingError {
    #[error("storage error")]
    Storage(#[from] StorageError),
    #[error("checker submission failed")]
    Checker(#[from] CheckerError),
}

/// Ensures exactly one processing loop runs at a time. Applying a new
/// configuration cancels the previous loop, starts a fresh one and pushes
/// the configuration out to connected clients. An in-flight submission may
/// still complete after the switch; its verdicts are applied regardless.
pub struct ProcessingManager {
    store: Arc<dyn FlagStore>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
}

impl ProcessingManager {
    pub fn new(
        store: Arc<dyn FlagStore>,
        registry: Arc<Registry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            shutdown,
            current: Mutex::new(None),
        }
    }

    pub fn apply(&self, config: SharedConfig) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self
            .current
            .lock()
            .unwrap()
            .replace(token.clone())
        {
            previous.cancel();
        }

        self.registry.broadcast_config(&config);
        spawn(run_loop(self.store.clone(), config.server, token));
    }
}

/// The loop itself. A protocol name with no compiled-in implementation is
/// fatal to this loop only; the rest of the system keeps running.
pub async fn run_loop(
    store: Arc<dyn FlagStore>,
    config: ServerConfig,
    cancellation_token: CancellationToken,
) {
    let Some(checker) = plunder_checker::resolve(&config.protocol) else {
        error! {
            protocol = %config.protocol,
            "unknown checker protocol, the flag processing loop will not run"
        }
        return;
    };

    info! {
        protocol = %config.protocol,
        interval = config.submit_interval,
        batch_size = config.max_flag_batch_size,
        "starting flag processing loop"
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(config.submit_interval.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        select! {
            _ = cancellation_token.cancelled() => {
                info!("flag processing loop terminated");
                return;
            }
            _ = ticker.tick() => {
                // errors leave flags unsubmitted; the next tick retries them
                if let Err(error) = process_tick(store.as_ref(), checker.as_ref(), &config).await {
                    error! {
                        ?error,
                        "flag submission round failed"
                    }
                }
            }
        }
    }
}

pub(crate) async fn process_tick(
    store: &dyn FlagStore,
    checker: &dyn Checker,
    config: &ServerConfig,
) -> Result<(), ProcessingError> {
    let codes = store
        .unsubmitted_flag_codes(config.max_flag_batch_size)
        .await?;
    if codes.is_empty() {
        debug!("no flags to submit");
        return Ok(());
    }

    info!(count = codes.len(), "submitting flags to checker");
    let verdicts = checker
        .submit(&config.checker_host, &config.team_token, &codes)
        .await?;

    apply_verdicts(store, verdicts).await
}

/// Groups verdicts by status and batch-updates storage per group.
/// Verdicts with a status the system does not recognize are dropped with a
/// log; recording them under a guessed status would corrupt the data.
pub(crate) async fn apply_verdicts(
    store: &dyn FlagStore,
    verdicts: Vec<Verdict>,
) -> Result<(), ProcessingError> {
    let mut groups: HashMap<FlagStatus, Vec<String>> = HashMap::new();
    let mut dropped = 0usize;

    for verdict in verdicts {
        match verdict.status.as_flag_status() {
            Some(status) => groups.entry(status).or_default().push(verdict.flag_code),
            None => {
                dropped += 1;
                warn! {
                    flag = %verdict.flag_code,
                    status = ?verdict.status,
                    "dropping verdict with unrecognized status"
                }
            }
        }
    }

    let response_time = unix_now();
    let count_of = |status| groups.get(&status).map_or(0, Vec::len);
    let (accepted, denied, errored) = (
        count_of(FlagStatus::Accepted),
        count_of(FlagStatus::Denied),
        count_of(FlagStatus::Error),
    );

    for (status, codes) in groups {
        store
            .update_flags_status(&codes, status, response_time)
            .await?;
    }

    info! {
        accepted,
        denied,
        errored,
        dropped,
        "flag verdicts applied"
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryFlagStore;
    use async_trait::async_trait;
    use plunder_checker::VerdictStatus;
    use plunder_common::models::Flag;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedChecker {
        // one entry per expected submission round
        rounds: Mutex<Vec<Result<Vec<Verdict>, CheckerError>>>,
        submissions: AtomicUsize,
    }

    impl ScriptedChecker {
        fn new(rounds: Vec<Result<Vec<Verdict>, CheckerError>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
                submissions: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Checker for ScriptedChecker {
        async fn submit(
            &self,
            _host: &str,
            _team_token: &str,
            _flag_codes: &[String],
        ) -> Result<Vec<Verdict>, CheckerError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            self.rounds.lock().unwrap().remove(0)
        }
    }

    fn verdict(code: &str, status: VerdictStatus) -> Verdict {
        Verdict {
            flag_code: code.to_string(),
            status,
            msg: String::new(),
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            submit_interval: 1,
            max_flag_batch_size: 10,
            checker_host: "checker:8080".to_string(),
            team_token: "tt".to_string(),
            protocol: "http".to_string(),
        }
    }

    #[tokio::test]
    async fn should_apply_verdicts_from_a_successful_round() {
        let store = MemoryFlagStore::new();
        store
            .insert_flags(&[
                Flag::captured("a", "notes", 1337, 1),
                Flag::captured("b", "notes", 1337, 2),
                Flag::captured("c", "notes", 1337, 3),
            ])
            .await
            .unwrap();

        let checker = ScriptedChecker::new(vec![Ok(vec![
            verdict("a", VerdictStatus::Accepted),
            verdict("b", VerdictStatus::Denied),
            verdict("c", VerdictStatus::Error),
        ])]);

        process_tick(&store, &checker, &config()).await.unwrap();

        let a = store.get("a").unwrap();
        assert_eq!(a.status, FlagStatus::Accepted);
        assert!(a.response_time > 0);
        assert_eq!(store.get("b").unwrap().status, FlagStatus::Denied);
        assert_eq!(store.get("c").unwrap().status, FlagStatus::Error);
        assert!(store.unsubmitted_flag_codes(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_leave_flags_unsubmitted_when_the_round_fails() {
        let store = MemoryFlagStore::new();
        store
            .insert_flags(&[Flag::captured("a", "notes", 1337, 1)])
            .await
            .unwrap();

        let checker = ScriptedChecker::new(vec![
            Err(CheckerError::BadStatus(503)),
            Ok(vec![verdict("a", VerdictStatus::Accepted)]),
        ]);

        let cfg = config();
        let err = process_tick(&store, &checker, &cfg).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Checker(_)));
        assert_eq!(
            store.unsubmitted_flag_codes(10).await.unwrap(),
            vec!["a".to_string()]
        );

        // the next tick retries the same flag
        process_tick(&store, &checker, &cfg).await.unwrap();
        assert_eq!(store.get("a").unwrap().status, FlagStatus::Accepted);
        assert_eq!(checker.submissions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_drop_unknown_verdicts_without_mutating_the_flag() {
        let store = MemoryFlagStore::new();
        store
            .insert_flags(&[Flag::captured("a", "notes", 1337, 1)])
            .await
            .unwrap();

        apply_verdicts(
            &store,
            vec![verdict("a", VerdictStatus::Unknown("RESUBMIT".to_string()))],
        )
        .await
        .unwrap();

        let stored = store.get("a").unwrap();
        assert_eq!(stored.status, FlagStatus::Unsubmitted);
        assert_eq!(stored.response_time, 0);
    }

    #[tokio::test]
    async fn should_not_submit_when_nothing_is_pending() {
        let store = MemoryFlagStore::new();
        let checker = ScriptedChecker::new(vec![]);

        process_tick(&store, &checker, &config()).await.unwrap();
        assert_eq!(checker.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_respect_the_batch_size_limit() {
        let store = MemoryFlagStore::new();
        let flags: Vec<Flag> = (0..5)
            .map(|n| Flag::captured(format!("f{n}"), "notes", 1337, 1))
            .collect();
        store.insert_flags(&flags).await.unwrap();

        let checker = ScriptedChecker::new(vec![Ok(vec![
            verdict("f0", VerdictStatus::Accepted),
            verdict("f1", VerdictStatus::Accepted),
        ])]);

        let cfg = ServerConfig {
            max_flag_batch_size: 2,
            ..config()
        };
        process_tick(&store, &checker, &cfg).await.unwrap();

        let remaining = store.unsubmitted_flag_codes(10).await.unwrap();
        assert_eq!(remaining.len(), 3);
    }

    #[tokio::test]
    async fn should_exit_the_loop_when_the_protocol_cannot_be_resolved() {
        let store: Arc<dyn FlagStore> = Arc::new(MemoryFlagStore::new());
        let cfg = ServerConfig {
            protocol: "no_such_protocol".to_string(),
            ..config()
        };

        // returns immediately instead of ticking forever
        tokio::time::timeout(
            Duration::from_secs(1),
            run_loop(store, cfg, CancellationToken::new()),
        )
        .await
        .expect("loop should exit on resolution failure");
    }

    #[tokio::test]
    async fn should_stop_the_loop_on_cancellation() {
        let store: Arc<dyn FlagStore> = Arc::new(MemoryFlagStore::new());
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(store, config(), token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit on cancellation")
            .unwrap();
    }
}
