mod config;
mod gateway;

use clap::{Parser, Subcommand};
use mavlink::common::MavMessage;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay_fc::mav::FcLink;
use relay_uplink::CoordinatorClient;

use config::GatewayConfig;
use gateway::Gateway;

#[derive(Debug, Parser)]
#[command(name = "atc-relay", version, about = "MAVLink vehicle <-> ATC coordinator gateway")]
struct Cli {
    /// Optional TOML file; environment variables override it.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay telemetry and directives (default).
    Run,
    /// Validate the configuration and exit.
    Doctor,
}

#[derive(Debug, thiserror::Error)]
enum Fatal {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("mavlink link: {0:#}")]
    Link(anyhow::Error),
    #[error("no vehicle heartbeat within {0}s")]
    NoHeartbeat(u64),
}

impl Fatal {
    fn exit_code(&self) -> u8 {
        match self {
            Fatal::Config(_) => 2,
            Fatal::Link(_) | Fatal::NoHeartbeat(_) => 1,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let res = match config::load(cli.config.as_deref()) {
        Ok(cfg) => match cli.cmd.unwrap_or(Command::Run) {
            Command::Doctor => doctor(&cfg),
            Command::Run => run(cfg).await,
        },
        Err(e) => Err(Fatal::Config(e)),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn doctor(cfg: &GatewayConfig) -> Result<(), Fatal> {
    info!("doctor: starting");
    config::validate(cfg).map_err(Fatal::Config)?;
    info!(
        "doctor: coordinator={} drone_id={} mavlink={} env={}",
        cfg.coordinator.server_url, cfg.coordinator.drone_id, cfg.mavlink.endpoint, cfg.coordinator.environment
    );
    info!("doctor: OK");
    Ok(())
}

async fn run(cfg: GatewayConfig) -> Result<(), Fatal> {
    config::validate(&cfg).map_err(Fatal::Config)?;
    let client = CoordinatorClient::new(&cfg.coordinator).map_err(|e| Fatal::Config(e.into()))?;
    info!(
        "coordinator: {} drone_id={}",
        cfg.coordinator.server_url, cfg.coordinator.drone_id
    );

    let mut link = FcLink::open(&cfg.mavlink).map_err(Fatal::Link)?;
    let wait = cfg.mavlink.heartbeat_timeout_s;
    info!("fc: waiting up to {}s for vehicle heartbeat", wait);
    let Some((hdr, hb)) = link.wait_heartbeat(Duration::from_secs(wait)).await else {
        return Err(Fatal::NoHeartbeat(wait));
    };
    info!(
        "fc: heartbeat from sys={} comp={} ({:?}/{:?})",
        hdr.system_id, hdr.component_id, hb.autopilot, hb.mavtype
    );

    let mut gw = Gateway::new(link, client, &cfg.nav, &cfg.timing);
    gw.handle_message(&hdr, &MavMessage::HEARTBEAT(hb));
    gw.run().await;
    Ok(())
}
