//! Daemon entry point: load configuration, authenticate, and run the
//! seeker loop until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tc_seeker::orchestrator::RunEnd;
use tc_seeker::{
    MoodleClient, MoodleReservationAgent, MoodleSlotSource, ResponseChannel, SeekerOrchestrator,
    Settings, TelegramChannel,
};

#[derive(Debug, Parser)]
#[command(name = "tc-seeker", about = "Exam-slot seeker and transfer daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "tc_seeker=debug,info"
    } else {
        "tc_seeker=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let settings = Settings::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    settings.validate().context("invalid configuration")?;

    let client = Arc::new(MoodleClient::new(&settings.moodle)?);
    client.login().await.context("initial Moodle login")?;

    let channel = Arc::new(TelegramChannel::connect(&settings.telegram)?);

    let mut orchestrator = SeekerOrchestrator::new(
        &settings,
        Arc::new(MoodleSlotSource::new(client.clone())),
        Arc::new(MoodleReservationAgent::new(client)),
        channel.clone(),
    );

    info!(
        "watching {} for '{}', {} transfer target(s) configured",
        settings.seeker.page_url,
        settings.seeker.test_name,
        settings.targets.len()
    );
    if let Err(e) = channel
        .notify("Seeker started. Watching for matching slots.")
        .await
    {
        warn!("startup notification lost: {}", e);
    }

    tokio::select! {
        end = orchestrator.run() => {
            let RunEnd::Escalated { reason } = end;
            error!("orchestrator escalated: {}", reason);
            // The operator was notified; stay alive so the message is not
            // followed by a silent exit, and wait for a manual stop.
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    Ok(())
}
