use anyhow::Result;
use clap::Parser;
use tracing::info;

use consult_relay::{
    cli::{self, Cli, Commands},
    config::ServerConfig,
    server, telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Probe(args)) = cli.command {
        telemetry::init_tracing("warn")?;
        return cli::run_probe(args).await;
    }

    let telemetry = telemetry::Telemetry::init()?;
    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        max_participants = config.relay.max_participants,
        booking = config.booking_url.is_some(),
        persistence = config.redis_url.is_some(),
        "starting consult-relay"
    );

    server::run(config, telemetry.metrics_handle()).await
}
