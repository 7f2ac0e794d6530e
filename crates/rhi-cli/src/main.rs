//! rhiexec - installs .rhi packages for Rhino

use anyhow::Result;
use clap::Parser;
use rhi_core::EngineConfig;
use rhi_schema::Phase;

use rhi_cli::{Cli, Commands, cmd, logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init(&cli.global) {
        eprintln!("rhiexec: {e:#}");
    }

    let phase = match run(&cli).await {
        Ok(phase) => phase,
        Err(e) => {
            tracing::error!("{e:#}");
            Phase::Exception
        }
    };

    if phase.should_report_error() && !cli.global.no_error_reports {
        tracing::warn!("Installation ended with {phase}; the log above describes the failure");
    }
    tracing::debug!("Exiting with return code {}", phase.code());
    std::process::exit(phase.code());
}

async fn run(cli: &Cli) -> Result<Phase> {
    let Some(command) = &cli.command else {
        tracing::error!("No package specified");
        return Ok(Phase::PackageNotSpecified);
    };

    match command {
        Commands::InspectHost { exe, workdir } => Ok(cmd::inspect::host(exe, workdir)),
        Commands::InspectPlugin { plugin } => Ok(cmd::inspect::plugin(plugin)),
        Commands::Install { package: None } => {
            tracing::error!("No package specified");
            Ok(Phase::PackageNotSpecified)
        }
        Commands::Install {
            package: Some(package),
        } => {
            let config = EngineConfig::load(cli.global.config.as_deref())?;
            cmd::install::install(package, &cli.global, config).await
        }
        Commands::InstallBundledPackages {
            folder,
            sdk_version,
        } => {
            let config = EngineConfig::load(cli.global.config.as_deref())?;
            cmd::bundled::install_bundled(folder, *sdk_version, &cli.global, &config)
        }
    }
}
