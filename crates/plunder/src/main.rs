use clap::Parser;
use color_eyre::eyre::Result;

mod args;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = args::Args::parse();
    match args.command {
        args::Commands::Server(config) => plunder_server::main(config).await,
        args::Commands::Client(config) => plunder_client::main(config).await,
    }
}
