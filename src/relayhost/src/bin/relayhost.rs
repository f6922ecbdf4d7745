//! relayhost: provision this host as a TCP relay and keep the relay supervised.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relayhost::constants::{ADMIN_PORT, RELAY_CONFIG_PATH};
use relayhost::{
    AdminEndpointProbe, ConfigGenerator, Host, ProvisionOrchestrator, ProvisionSettings,
    SystemdSupervisor,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "relayhost",
    version,
    about = "Provision and supervise a high-concurrency TCP relay on this host"
)]
struct Args {
    /// Settings file (TOML). Defaults to /etc/relayhost/relayhost.toml when present.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tune the host, write the relay config, (re)start the relay and wait
    /// until it is healthy. Safe to re-run.
    Provision,
    /// Print the relay configuration document for the current settings.
    RenderConfig,
    /// Stop and unregister the relay and remove its configuration.
    /// Host tuning is left in place.
    Teardown,
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    match rt.block_on(run(args)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether the command reached its goal.
async fn run(args: Args) -> anyhow::Result<bool> {
    let settings =
        ProvisionSettings::load(args.config.as_deref()).context("Invalid relay settings")?;

    match args.command {
        Command::RenderConfig => {
            let document = ConfigGenerator::default().render(&settings)?;
            print!("{}", document);
            Ok(true)
        }
        Command::Provision => {
            eprintln!("╔════════════════════════════════════════════════════════════════╗");
            eprintln!("║  relayhost provision                                           ║");
            eprintln!("╚════════════════════════════════════════════════════════════════╝");
            eprintln!(
                "  Relay: :{} -> {}:{} ({} workers)",
                settings.listen_port(),
                settings.target_host(),
                settings.target_port(),
                settings.worker_concurrency()
            );
            eprintln!("  Image: {}", settings.relay_image_ref());
            eprintln!("  Config: {}", RELAY_CONFIG_PATH);

            let orchestrator = orchestrator(settings)?;
            let report = orchestrator.run().await;
            println!("{}", report);
            Ok(report.is_healthy())
        }
        Command::Teardown => {
            orchestrator(settings)?
                .teardown()
                .await
                .context("Teardown failed")?;
            eprintln!("  Relay service removed (host tuning left in place)");
            Ok(true)
        }
    }
}

fn orchestrator(settings: ProvisionSettings) -> anyhow::Result<ProvisionOrchestrator> {
    let host = Host::local();
    let supervisor = Arc::new(SystemdSupervisor::new(host.clone()));
    let probe = Arc::new(
        AdminEndpointProbe::new(ADMIN_PORT).context("Failed to build admin endpoint client")?,
    );
    Ok(ProvisionOrchestrator::new(host, settings, supervisor, probe))
}
