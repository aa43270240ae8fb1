use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use node_agent::agent::{self, AgentConfig, OperationMode};
use node_agent::utils;

#[derive(Parser)]
#[command(name = "node-agent", version, about = "Bare-metal node agent")]
struct AppCli {
    /// Run in daemon mode (background)
    #[arg(long)]
    daemon: bool,

    /// Config file path; built-in defaults apply when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Controller API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// RPC endpoint (host:port); repeatable
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Operation mode: STANDBY or DECOM
    #[arg(long)]
    mode: Option<OperationMode>,
}

impl AppCli {
    fn load_config(&self) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)?,
            None => AgentConfig::default(),
        };
        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }
        if !self.endpoints.is_empty() {
            config.endpoints = self.endpoints.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        Ok(config)
    }
}

fn run_daemon() -> Result<()> {
    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file("node-agent.pid")
        .working_directory(".")
        .umask(0o027)
        .privileged_action(|| {
            info!("daemon started");
        });

    daemonize.start().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn main() -> Result<()> {
    utils::logging::init()?;

    let args = AppCli::parse();
    let config = args.load_config()?;

    // fork before any runtime threads exist
    if args.daemon {
        run_daemon()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(agent::daemon::run(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config() {
        let cli = AppCli::parse_from([
            "node-agent",
            "--api-url",
            "http://controller:8080",
            "--endpoint",
            "10.0.0.1:9999",
            "--endpoint",
            "10.0.0.2:9999",
            "--mode",
            "decom",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.api_url, "http://controller:8080");
        assert_eq!(config.endpoints, vec!["10.0.0.1:9999", "10.0.0.2:9999"]);
        assert_eq!(config.mode, OperationMode::Decom);
    }
}
