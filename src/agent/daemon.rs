use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::config::AgentConfig;
use crate::agent::heartbeat::Heartbeater;
use crate::agent::protocol::AgentProtocol;
use crate::agent::registry::TaskRegistry;
use crate::agent::status::{AgentStatus, OperationMode};
use crate::commands::{CommandExecutor, InMemoryImageCache, StandbyCommands};
use crate::hardware::{select_hardware_manager, GenericHardwareManager, HardwareManager};
use crate::transport::client::run_endpoint;
use crate::transport::controller::ControllerClient;

/// Build the command set for `mode`.
pub fn build_executor(config: &AgentConfig, registry: &Arc<TaskRegistry>) -> Result<CommandExecutor> {
    let executor = CommandExecutor::new();
    let executor = match config.mode {
        OperationMode::Standby => StandbyCommands::new(
            Arc::new(InMemoryImageCache::default()),
            Arc::clone(registry),
            Handle::current(),
            config.task_reporting_interval()?,
        )
        .register(executor),
        OperationMode::Decom => executor,
    };
    info!(mode = %config.mode, commands = ?executor.command_names(), "command set ready");
    Ok(executor)
}

pub async fn run(config: AgentConfig) -> Result<()> {
    config.validate()?;
    info!(mode = %config.mode, api_url = %config.api_url, "Agent daemon starting");

    let candidates: Vec<Arc<dyn HardwareManager>> = vec![Arc::new(GenericHardwareManager::new())];
    let hardware = select_hardware_manager(candidates)
        .context("no hardware manager supports this machine")?;

    let node_id = match &config.node_id {
        Some(id) => id.clone(),
        None => hardware
            .primary_mac_address()
            .context("determining node identity")?,
    };
    info!(node_id = %node_id, "node identity resolved");

    let controller = Arc::new(ControllerClient::new(&config.api_url)?);
    match controller.get_configuration(&node_id).await {
        Ok(remote) => info!(configuration = %remote, "fetched agent configuration"),
        Err(e) => warn!(error = %e, "could not fetch agent configuration, using local settings"),
    }

    let registry = TaskRegistry::new();
    let executor = Arc::new(build_executor(&config, &registry)?);
    let status = AgentStatus::new(config.mode);
    let protocol = Arc::new(AgentProtocol::new(
        node_id,
        status,
        executor,
        config.ping_interval(),
    ));

    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    let hardware_summary =
        serde_json::to_value(hardware.summary()).context("serializing hardware summary")?;
    let heartbeater = Heartbeater::new(controller, hardware_summary, config.mode, config.heartbeat);
    workers.push(tokio::spawn(heartbeater.run(shutdown.clone())));

    if config.endpoints.is_empty() {
        warn!("no RPC endpoints configured, running heartbeat only");
    }
    let backoff = config.backoff()?;
    for endpoint in &config.endpoints {
        workers.push(tokio::spawn(run_endpoint(
            endpoint.clone(),
            config.connection(),
            protocol.clone(),
            backoff,
            shutdown.clone(),
        )));
    }

    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping daemon");

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "worker ended abnormally");
        }
    }
    for task in registry.live() {
        info!(task_id = %task.id, task_name = %task.name, percent = task.percent, "stopping task still running at shutdown");
    }
    registry.stop_all();

    Ok(())
}
