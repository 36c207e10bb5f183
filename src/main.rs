use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{error, info};
use ota_agent::{
    config::AgentConfig,
    device_service_client::DeviceServiceClient,
    events::EventLatch,
    identity::IdentityProvider,
    orchestrator::Orchestrator,
    services::{AuthRetryGuard, DeploymentReporter},
    sink::AgentEventSink,
    update_client::UpdateServiceClient,
};
use std::{io::Write, sync::Arc};
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AgentConfig::load().context("failed to load agent configuration")?;

    let device = Arc::new(
        DeviceServiceClient::new(&config.device_service)
            .context("failed to create device service client")?,
    );
    let identity = Arc::new(IdentityProvider::new());
    let latch = EventLatch::new();

    let sink = Arc::new(AgentEventSink::new(
        device.clone(),
        identity.clone(),
        latch.clone(),
        DeploymentReporter::new(),
        AuthRetryGuard::new(config.retry.max_tries),
    ));

    let client = UpdateServiceClient::new(&config.update_service, sink)
        .context("failed to create update service client")?;

    let mut orchestrator = Orchestrator::new(device, client, latch, identity, config);

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let stop = async move {
        sigterm.recv().await;
    };

    let reason = orchestrator.run(stop).await?;
    info!("{reason}");

    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("agent version: {}", env!("CARGO_PKG_VERSION"));
}
