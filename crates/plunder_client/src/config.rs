// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

use clap_derive::Parser;

#[derive(Parser, Debug)]
#[command(version, about)]
#[group(skip)]
pub struct Config {
    /// The host:port of the plunder server
    #[arg(env, long)]
    pub server_addr: String,

    /// The pre-shared token presented on connect
    #[arg(env, long)]
    pub token: Option<String>,

    /// A password to exchange for a session token instead of a pre-shared
    /// token
    #[arg(env, long)]
    pub password: Option<String>,

    /// The login endpoint for the password exchange; defaults to
    /// http://<server-addr>/login
    #[arg(env, long)]
    pub login_url: Option<String>,

    /// The flag format used until the server pushes its configuration
    #[arg(env, long, default_value = "[A-Z0-9]{31}=")]
    pub flag_format: String,

    /// The name of the service the exploit targets
    #[arg(env, long)]
    pub service_name: String,

    /// The port of the service the exploit targets
    #[arg(env, long, default_value_t = 0)]
    pub service_port: u16,

    /// The id of the team the exploit is pointed at
    #[arg(env, long, default_value_t = 0)]
    pub team_id: u16,
}
