// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! Buffered flag ingestion. Incoming flags accumulate in a bounded
//! in-memory buffer and are flushed to storage either when the buffer is
//! full or on a timer. The buffer lock is never held across storage I/O so
//! producers are not blocked by a slow flush.

use crate::storage::{FlagStore, StorageError};
use plunder_common::models::{unix_now, Flag};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// The buffer never holds more than this many flags
    pub max_buffer_size: usize,
    /// How often the background task flushes the buffer
    pub flush_interval: Duration,
    /// Upper bound on a single persistence call
    pub flush_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            flush_interval: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStats {
    pub flags_received: u64,
    pub flush_attempts: u64,
    pub successful_flushes: u64,
    pub failed_flushes: u64,
    pub flags_flushed: u64,
    /// Flags lost because the buffer had no room to take a failed batch
    /// back. The one place genuine data loss is possible by design.
    pub flags_dropped: u64,
    /// Unix timestamp of the last flush attempt, 0 if none yet
    pub last_flush_time: u64,
    /// Unix timestamp of the last successful flush, 0 if none yet
    pub last_successful_flush: u64,
    pub last_error: Option<String>,
}

impl CollectorStats {
    /// Flushed flags per flush attempt, for observability.
    pub fn efficiency(&self) -> f64 {
        if self.flush_attempts == 0 {
            return 0.0;
        }
        self.flags_flushed as f64 / self.flush_attempts as f64
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error("storage error")]
    Storage(#[from] StorageError),
    #[error("flush timed out")]
    Timeout,
    #[error("collector is stopped")]
    Stopped,
    #[error("background flusher failed")]
    FlusherFailed,
}

pub struct FlagCollector {
    store: Arc<dyn FlagStore>,
    config: CollectorConfig,
    inner: Mutex<Inner>,
    stop: CancellationToken,
}

#[derive(Default)]
struct Inner {
    buffer: Vec<Flag>,
    stats: CollectorStats,
    running: bool,
    stopped: bool,
    flusher: Option<JoinHandle<Result<(), CollectorError>>>,
}

impl FlagCollector {
    pub fn new(store: Arc<dyn FlagStore>, config: CollectorConfig) -> Self {
        Self {
            store,
            config,
            inner: Mutex::new(Inner::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Appends a flag to the buffer, lazily starting the background flusher
    /// on first use. Reaching the configured maximum synchronously drains
    /// the buffer to storage; a persistence failure there is returned to
    /// the caller (the flags are re-buffered if capacity allows).
    pub async fn add_flag(self: &Arc<Self>, flag: Flag) -> Result<(), CollectorError> {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                return Err(CollectorError::Stopped);
            }
            inner.stats.flags_received += 1;
            inner.buffer.push(flag);

            if inner.buffer.len() >= self.config.max_buffer_size {
                Some(std::mem::take(&mut inner.buffer))
            } else {
                None
            }
        };
        self.start();

        if let Some(batch) = drained {
            debug!("flushing flag buffer due to size limit");
            self.persist(batch, self.config.flush_timeout).await?;
        }
        Ok(())
    }

    /// Starts the background flusher. Idempotent.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.running || inner.stopped {
                return;
            }
            inner.running = true;
        }

        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                select! {
                    _ = collector.stop.cancelled() => {
                        debug!("flushing flag buffer before shutdown");
                        return collector.flush().await.map(|_| ());
                    }
                    _ = ticker.tick() => {
                        if let Err(error) = collector.flush().await {
                            error! {
                                ?error,
                                "unable to flush flag buffer on timer"
                            }
                        }
                    }
                }
            }
        });
        self.inner.lock().unwrap().flusher = Some(handle);

        info! {
            max_buffer = self.config.max_buffer_size,
            flush_interval = ?self.config.flush_interval,
            "flag collector started"
        }
    }

    /// Drains the buffer to storage. A flush of an empty buffer is a no-op
    /// that does not touch the flush counters. Returns the number of flags
    /// flushed.
    pub async fn flush(&self) -> Result<usize, CollectorError> {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.buffer)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        self.persist(batch, self.config.flush_timeout).await?;
        Ok(count)
    }

    /// Signals the background flusher to stop, waits for its final flush to
    /// complete, and returns the final flush result.
    pub async fn stop(&self) -> Result<(), CollectorError> {
        let (first, handle) = {
            let mut inner = self.inner.lock().unwrap();
            let first = !inner.stopped;
            inner.stopped = true;
            inner.running = false;
            (first, inner.flusher.take())
        };
        self.stop.cancel();

        let result = match handle {
            Some(handle) => handle.await.unwrap_or(Err(CollectorError::FlusherFailed)),
            // never started, flush whatever is buffered inline
            None if first => self.flush().await.map(|_| ()),
            None => Ok(()),
        };

        if first {
            let stats = self.stats();
            info! {
                flags_flushed = stats.flags_flushed,
                flags_dropped = stats.flags_dropped,
                buffer_remaining = self.buffer_size(),
                successful_flushes = stats.successful_flushes,
                failed_flushes = stats.failed_flushes,
                "flag collector stopped"
            }
        }
        result
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    pub fn stats(&self) -> CollectorStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Persists a drained batch without holding the buffer lock across the
    /// storage call. On failure the batch is merged back into the buffer if
    /// capacity allows; otherwise the flags are dropped and counted.
    async fn persist(&self, batch: Vec<Flag>, timeout: Duration) -> Result<(), CollectorError> {
        self.inner.lock().unwrap().stats.flush_attempts += 1;

        let result = match tokio::time::timeout(timeout, self.store.insert_flags(&batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(CollectorError::Storage(error)),
            Err(_) => Err(CollectorError::Timeout),
        };

        let mut inner = self.inner.lock().unwrap();
        inner.stats.last_flush_time = unix_now();
        match result {
            Ok(()) => {
                inner.stats.successful_flushes += 1;
                inner.stats.last_successful_flush = inner.stats.last_flush_time;
                inner.stats.flags_flushed += batch.len() as u64;
                debug! {
                    flag_count = batch.len(),
                    total_flushed = inner.stats.flags_flushed,
                    "flushed flags to storage"
                }
                Ok(())
            }
            Err(error) => {
                inner.stats.failed_flushes += 1;
                inner.stats.last_error = Some(error.to_string());
                if inner.buffer.len() + batch.len() <= self.config.max_buffer_size {
                    // re-merge order is append; a failed batch may be
                    // retried after flags that arrived later
                    inner.buffer.extend(batch);
                } else {
                    inner.stats.flags_dropped += batch.len() as u64;
                    error! {
                        dropped_flags = batch.len(),
                        "buffer overflow, dropped flags after failed flush"
                    }
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts inserts and fails on demand.
    #[derive(Default)]
    struct ScriptedStore {
        failing: AtomicBool,
        inserts: AtomicUsize,
        flags_persisted: AtomicUsize,
    }

    #[async_trait]
    impl FlagStore for ScriptedStore {
        async fn insert_flags(&self, flags: &[Flag]) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("scripted failure".to_string()));
            }
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.flags_persisted.fetch_add(flags.len(), Ordering::SeqCst);
            Ok(())
        }

        async fn unsubmitted_flag_codes(
            &self,
            _limit: usize,
        ) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }

        async fn update_flags_status(
            &self,
            _flag_codes: &[String],
            _status: plunder_common::models::FlagStatus,
            _response_time: u64,
        ) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn collector_with(
        max_buffer_size: usize,
        store: Arc<ScriptedStore>,
    ) -> Arc<FlagCollector> {
        Arc::new(FlagCollector::new(
            store,
            CollectorConfig {
                max_buffer_size,
                // long enough that timer flushes never interfere with tests
                flush_interval: Duration::from_secs(3600),
                flush_timeout: Duration::from_secs(1),
            },
        ))
    }

    fn flag(n: usize) -> Flag {
        Flag::captured(format!("FLAG{{{n}}}"), "notes", 1337, 2)
    }

    #[tokio::test]
    async fn should_flush_synchronously_when_buffer_fills() {
        let store = Arc::new(ScriptedStore::default());
        let collector = collector_with(3, store.clone());

        for n in 0..3 {
            collector.add_flag(flag(n)).await.unwrap();
        }
        // the insert that filled the buffer has already drained it
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(store.flags_persisted.load(Ordering::SeqCst), 3);
        assert_eq!(collector.buffer_size(), 0);

        collector.add_flag(flag(3)).await.unwrap();
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(collector.buffer_size(), 1);
    }

    #[tokio::test]
    async fn should_rebuffer_failed_batch_when_capacity_allows() {
        let store = Arc::new(ScriptedStore::default());
        let collector = collector_with(3, store.clone());

        store.failing.store(true, Ordering::SeqCst);
        collector.add_flag(flag(0)).await.unwrap();
        collector.add_flag(flag(1)).await.unwrap();
        let err = collector.add_flag(flag(2)).await.unwrap_err();
        assert!(matches!(err, CollectorError::Storage(_)));

        // the failed batch went back into the buffer, nothing was lost
        assert_eq!(collector.buffer_size(), 3);
        let stats = collector.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.flags_dropped, 0);
        assert!(stats.last_error.is_some());

        store.failing.store(false, Ordering::SeqCst);
        let flushed = collector.flush().await.unwrap();
        assert_eq!(flushed, 3);
        assert_eq!(collector.buffer_size(), 0);
    }

    #[tokio::test]
    async fn should_count_drops_and_preserve_flag_accounting() {
        let store = Arc::new(ScriptedStore::default());
        let collector = collector_with(2, store.clone());

        store.failing.store(true, Ordering::SeqCst);
        // fills the buffer and fails the synchronous flush; batch re-merged
        collector.add_flag(flag(0)).await.unwrap();
        let _ = collector.add_flag(flag(1)).await;
        assert_eq!(collector.buffer_size(), 2);

        // fills it again; the failed batch no longer fits and is dropped
        let _ = collector.add_flag(flag(2)).await;
        let stats = collector.stats();
        assert!(collector.buffer_size() <= 2);

        // received == persisted + buffered + dropped
        let persisted = store.flags_persisted.load(Ordering::SeqCst) as u64;
        assert_eq!(
            stats.flags_received,
            persisted + collector.buffer_size() as u64 + stats.flags_dropped
        );
        assert!(stats.flags_dropped > 0);
    }

    #[tokio::test]
    async fn should_not_count_empty_flushes() {
        let store = Arc::new(ScriptedStore::default());
        let collector = collector_with(10, store.clone());

        assert_eq!(collector.flush().await.unwrap(), 0);
        assert_eq!(collector.stats().flush_attempts, 0);
    }

    #[tokio::test]
    async fn should_flush_remaining_flags_on_stop() {
        let store = Arc::new(ScriptedStore::default());
        let collector = collector_with(10, store.clone());

        collector.add_flag(flag(0)).await.unwrap();
        collector.add_flag(flag(1)).await.unwrap();
        assert!(collector.is_running());

        collector.stop().await.unwrap();
        assert_eq!(store.flags_persisted.load(Ordering::SeqCst), 2);
        assert_eq!(collector.buffer_size(), 0);
        assert!(!collector.is_running());

        // stopped collectors reject new flags
        let err = collector.add_flag(flag(2)).await.unwrap_err();
        assert!(matches!(err, CollectorError::Stopped));
    }

    #[tokio::test]
    async fn should_flush_on_timer() {
        let store = Arc::new(ScriptedStore::default());
        let collector = Arc::new(FlagCollector::new(
            store.clone(),
            CollectorConfig {
                max_buffer_size: 100,
                flush_interval: Duration::from_millis(20),
                flush_timeout: Duration::from_secs(1),
            },
        ));

        collector.add_flag(flag(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.flags_persisted.load(Ordering::SeqCst), 1);
        assert_eq!(collector.buffer_size(), 0);
        collector.stop().await.unwrap();
    }

    #[test]
    fn should_compute_flush_efficiency() {
        let stats = CollectorStats {
            flush_attempts: 4,
            flags_flushed: 10,
            ..Default::default()
        };
        assert_eq!(stats.efficiency(), 2.5);
        assert_eq!(CollectorStats::default().efficiency(), 0.0);
    }
}
