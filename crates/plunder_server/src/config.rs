// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

use clap_derive::Parser;
use plunder_common::models::{ClientConfig, ServerConfig, SharedConfig};

#[derive(Parser, Debug)]
#[command(version, about)]
#[group(skip)]
pub struct Config {
    /// The socket address for the flag ingestion WebSocket listener
    #[arg(env, long, default_value = "[::]:8000")]
    pub ws_listen: String,

    /// The socket address for the operational HTTP surface
    #[arg(env, long, default_value = "[::]:8001")]
    pub ops_listen: String,

    /// The token clients must present when connecting
    #[arg(env, long)]
    pub auth_token: String,

    /// Interval between checker submission rounds, in seconds
    #[arg(env, long, default_value_t = 30)]
    pub submit_interval: u64,

    /// Maximum number of flags forwarded to the checker per round
    #[arg(env, long, default_value_t = 500)]
    pub max_flag_batch_size: usize,

    /// Address of the competition's flag checker service
    #[arg(env, long)]
    pub checker_host: String,

    /// Team token presented to the flag checker
    #[arg(env, long)]
    pub team_token: String,

    /// Name of the checker protocol implementation to use
    #[arg(env, long, default_value = "http")]
    pub protocol: String,

    /// The regular expression for the flag format, pushed to clients
    #[arg(env, long, default_value = "[A-Z0-9]{31}=")]
    pub flag_format: String,

    /// Format string for generating team IP addresses, pushed to clients
    #[arg(env, long, default_value = "10.60.{}.1")]
    pub team_ip_format: String,

    /// The IP address of our own team, pushed to clients
    #[arg(env, long, default_value = "")]
    pub my_team_ip: String,

    /// Number of teams in the IP range, pushed to clients
    #[arg(env, long, default_value_t = 0)]
    pub team_range: u8,
}

impl Config {
    /// The initial shared configuration. Operators can replace it at
    /// runtime through the operational surface.
    pub fn shared_config(&self) -> SharedConfig {
        SharedConfig {
            server: ServerConfig {
                submit_interval: self.submit_interval,
                max_flag_batch_size: self.max_flag_batch_size,
                checker_host: self.checker_host.clone(),
                team_token: self.team_token.clone(),
                protocol: self.protocol.clone(),
            },
            client: ClientConfig {
                flag_format: self.flag_format.clone(),
                team_ip_format: self.team_ip_format.clone(),
                my_team_ip: self.my_team_ip.clone(),
                team_range: self.team_range,
                services: Vec::new(),
            },
        }
    }
}
