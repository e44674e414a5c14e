// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! Pluggable checker protocols. A checker protocol knows how to forward a
//! batch of flag codes to a competition's flag-checking service and map its
//! responses back to per-flag verdicts.
//!
//! Implementations are compiled in and resolved by name through a static
//! registry. Duplicate submissions of an already-judged flag are expected
//! and must be tolerated by every implementation.

mod dummy;
mod http;

use async_trait::async_trait;
use plunder_common::models::FlagStatus;
use std::sync::Arc;

/// A checker's per-flag judgment.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub flag_code: String,
    pub status: VerdictStatus,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictStatus {
    Accepted,
    Denied,
    Error,
    /// A status string the protocol implementation did not recognize.
    /// The processing loop drops these rather than guessing.
    Unknown(String),
}

impl VerdictStatus {
    /// The flag status this verdict maps to, if it maps to one at all.
    pub fn as_flag_status(&self) -> Option<FlagStatus> {
        match self {
            VerdictStatus::Accepted => Some(FlagStatus::Accepted),
            VerdictStatus::Denied => Some(FlagStatus::Denied),
            VerdictStatus::Error => Some(FlagStatus::Error),
            VerdictStatus::Unknown(_) => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CheckerError {
    #[error("reqwest failed")]
    Reqwest(#[from] reqwest::Error),
    #[error("checker returned status {0}")]
    BadStatus(u16),
    /// The format of the response was not as expected
    #[error("format error")]
    FormatError(#[source] serde_json::Error),
}

/// A single submission round against the external checker. Implementations
/// must be safe to call repeatedly with overlapping batches.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn submit(
        &self,
        host: &str,
        team_token: &str,
        flag_codes: &[String],
    ) -> Result<Vec<Verdict>, CheckerError>;
}

/// Resolves a checker protocol by its configured name. Returns [None] for
/// names with no compiled-in implementation; callers treat that as fatal to
/// their processing loop.
pub fn resolve(name: &str) -> Option<Arc<dyn Checker>> {
    match name {
        "http" => Some(Arc::new(http::HttpChecker::new())),
        "dummy" => Some(Arc::new(dummy::DummyChecker)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_resolve_known_protocols() {
        assert!(resolve("http").is_some());
        assert!(resolve("dummy").is_some());
    }

    #[test]
    fn should_not_resolve_unknown_protocols() {
        assert!(resolve("cc_so_plugin").is_none());
        assert!(resolve("").is_none());
    }

    #[test]
    fn should_map_verdict_statuses() {
        assert_eq!(
            VerdictStatus::Accepted.as_flag_status(),
            Some(FlagStatus::Accepted)
        );
        assert_eq!(
            VerdictStatus::Denied.as_flag_status(),
            Some(FlagStatus::Denied)
        );
        assert_eq!(
            VerdictStatus::Error.as_flag_status(),
            Some(FlagStatus::Error)
        );
        assert_eq!(
            VerdictStatus::Unknown("HUH".to_string()).as_flag_status(),
            None
        );
    }
}
