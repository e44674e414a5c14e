use clap_derive::{Parser, Subcommand};

/// A flag farm for attack/defense CTFs
#[derive(Parser, Debug)]
#[command(version, about)]
#[command(propagate_version = true)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the flag ingestion and submission server
    Server(plunder_server::config::Config),
    /// Run the exploit-side agent
    Client(plunder_client::config::Config),
}
