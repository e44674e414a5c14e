// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! The storage collaborator consumed by the flag collector and the
//! processing loop. The relational layer behind it is not part of this
//! crate; a database-backed implementation plugs in through [FlagStore].

use async_trait::async_trait;
use plunder_common::models::{Flag, FlagStatus};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Batch-oriented flag persistence. Implementations must tolerate duplicate
/// inserts (idempotent on the flag code) and must never regress a flag's
/// status back to [FlagStatus::Unsubmitted].
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn insert_flags(&self, flags: &[Flag]) -> Result<(), StorageError>;

    /// Flag codes that have not yet received a verdict, oldest first,
    /// at most `limit` of them.
    async fn unsubmitted_flag_codes(&self, limit: usize) -> Result<Vec<String>, StorageError>;

    async fn update_flags_status(
        &self,
        flag_codes: &[String],
        status: FlagStatus,
        response_time: u64,
    ) -> Result<(), StorageError>;
}

/// An in-memory [FlagStore] for tests and single-node setups without a
/// database. Keeps insertion order so unsubmitted batches come out FIFO.
#[derive(Default)]
pub struct MemoryFlagStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    flags: HashMap<String, Flag>,
    order: Vec<String>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flag_code: &str) -> Option<Flag> {
        self.inner.lock().unwrap().flags.get(flag_code).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn insert_flags(&self, flags: &[Flag]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        for flag in flags {
            if inner.flags.contains_key(&flag.flag_code) {
                // duplicate submission, first write wins
                continue;
            }
            inner.order.push(flag.flag_code.clone());
            inner.flags.insert(flag.flag_code.clone(), flag.clone());
        }
        Ok(())
    }

    async fn unsubmitted_flag_codes(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let codes = inner
            .order
            .iter()
            .filter(|code| {
                inner
                    .flags
                    .get(*code)
                    .is_some_and(|flag| flag.status == FlagStatus::Unsubmitted)
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(codes)
    }

    async fn update_flags_status(
        &self,
        flag_codes: &[String],
        status: FlagStatus,
        response_time: u64,
    ) -> Result<(), StorageError> {
        if !status.is_verdict() {
            // status transitions are forward-only
            warn!(?status, "refusing to reset flags to a non-verdict status");
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap();
        for code in flag_codes {
            if let Some(flag) = inner.flags.get_mut(code) {
                flag.status = status;
                flag.response_time = response_time;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(code: &str) -> Flag {
        Flag::captured(code, "notes", 1337, 3)
    }

    #[tokio::test]
    async fn should_deduplicate_inserts_by_flag_code() {
        let store = MemoryFlagStore::new();
        store.insert_flags(&[flag("a"), flag("b")]).await.unwrap();
        store.insert_flags(&[flag("a")]).await.unwrap();

        assert_eq!(store.len(), 2);
        let codes = store.unsubmitted_flag_codes(10).await.unwrap();
        assert_eq!(codes, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn should_return_unsubmitted_codes_fifo_and_limited() {
        let store = MemoryFlagStore::new();
        store
            .insert_flags(&[flag("a"), flag("b"), flag("c")])
            .await
            .unwrap();

        let codes = store.unsubmitted_flag_codes(2).await.unwrap();
        assert_eq!(codes, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn should_exclude_judged_flags_from_unsubmitted() {
        let store = MemoryFlagStore::new();
        store.insert_flags(&[flag("a"), flag("b")]).await.unwrap();
        store
            .update_flags_status(&["a".to_string()], FlagStatus::Accepted, 123)
            .await
            .unwrap();

        let codes = store.unsubmitted_flag_codes(10).await.unwrap();
        assert_eq!(codes, vec!["b".to_string()]);

        let judged = store.get("a").unwrap();
        assert_eq!(judged.status, FlagStatus::Accepted);
        assert_eq!(judged.response_time, 123);
    }

    #[tokio::test]
    async fn should_never_regress_a_verdict_to_unsubmitted() {
        let store = MemoryFlagStore::new();
        store.insert_flags(&[flag("a")]).await.unwrap();
        store
            .update_flags_status(&["a".to_string()], FlagStatus::Denied, 5)
            .await
            .unwrap();
        store
            .update_flags_status(&["a".to_string()], FlagStatus::Unsubmitted, 9)
            .await
            .unwrap();

        let stored = store.get("a").unwrap();
        assert_eq!(stored.status, FlagStatus::Denied);
        assert_eq!(stored.response_time, 5);
    }
}
