// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

//! Shared models used across the transport, storage and processing layers.

use serde::{Deserialize, Serialize};

/// A captured flag and its submission metadata. Flags are created by the
/// client at exploit-output-parse time and persisted by the server once
/// received. Only the processing loop mutates a flag after that, and only
/// forward: [FlagStatus::Unsubmitted] never comes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub flag_code: String,
    pub service_name: String,
    pub port_service: u16,
    pub team_id: u16,
    /// Unix timestamp of when the flag was captured
    pub submit_time: u64,
    /// Unix timestamp of when a checker verdict arrived, 0 until then
    pub response_time: u64,
    pub status: FlagStatus,
    /// Message from the flag checker service, if any
    pub msg: String,
}

impl Flag {
    /// A freshly captured flag, not yet judged by the checker.
    pub fn captured(
        flag_code: impl Into<String>,
        service_name: impl Into<String>,
        port_service: u16,
        team_id: u16,
    ) -> Self {
        Self {
            flag_code: flag_code.into(),
            service_name: service_name.into(),
            port_service,
            team_id,
            submit_time: unix_now(),
            response_time: 0,
            status: FlagStatus::Unsubmitted,
            msg: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagStatus {
    Unsubmitted,
    Accepted,
    Denied,
    Error,
}

impl FlagStatus {
    /// A verdict status can only move away from [FlagStatus::Unsubmitted].
    pub fn is_verdict(&self) -> bool {
        !matches!(self, FlagStatus::Unsubmitted)
    }
}

/// Configuration shared between the server and all connected clients.
/// The server pushes this as a `config` event whenever an operator applies
/// a new configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interval between checker submission rounds, in seconds
    pub submit_interval: u64,
    /// Maximum number of flags to forward to the checker in one batch
    pub max_flag_batch_size: usize,
    /// Address of the external flag checker service
    pub checker_host: String,
    /// Team token presented to the checker
    pub team_token: String,
    /// Name of the checker protocol implementation to use
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// The regular expression for the flag format
    pub flag_format: String,
    /// Format string for generating team IP addresses
    pub team_ip_format: String,
    /// The IP address of our own team
    pub my_team_ip: String,
    /// Number of teams in the IP range
    pub team_range: u8,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub port: u16,
}

/// Current unix time in seconds. Timestamps on the wire are plain u64s.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_serialize_status_as_screaming_snake_case() {
        let json = serde_json::to_string(&FlagStatus::Unsubmitted).unwrap();
        assert_eq!(json, "\"UNSUBMITTED\"");
        let status: FlagStatus = serde_json::from_str("\"ACCEPTED\"").unwrap();
        assert_eq!(status, FlagStatus::Accepted);
    }

    #[test]
    fn should_create_captured_flag_as_unsubmitted() {
        let flag = Flag::captured("FLAG{abc}", "notes", 1337, 4);
        assert_eq!(flag.status, FlagStatus::Unsubmitted);
        assert_eq!(flag.response_time, 0);
        assert!(flag.submit_time > 0);
        assert!(flag.msg.is_empty());
    }
}
