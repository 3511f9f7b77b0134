//! Command handlers for the confcheck CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};

use confcheck_core::{
    ClientPerformanceScenario, Clock, FaultInjector, FaultInjectorExt, HarnessConfig,
    HybridSessionFactory, MobileSessionFactory, PeerConnectionStatusScenario, PoolKind,
    ScenarioOutcome, ScenarioReport, SessionConfig, SessionFactory, SessionPool, SystemClock,
    WebSessionFactory,
};

use crate::cli::{Cli, Commands};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher {
    config: HarnessConfig,
    base_config: SessionConfig,
    clock: Arc<dyn Clock>,
    json: bool,
}

impl CommandDispatcher {
    pub fn new(cli: &Cli, config: HarnessConfig) -> Result<Self> {
        let mut base_config = config.base_session_config();
        for pair in &cli.overrides {
            base_config = base_config.with_override_str(pair)?;
        }
        Ok(Self {
            config,
            base_config,
            clock: Arc::new(SystemClock::new()),
            json: cli.json,
        })
    }

    /// Execute a CLI command
    pub async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::PeerStatus => self.handle_peer_status().await,
            Commands::Performance {
                hold_secs,
                participants,
            } => self.handle_performance(hold_secs, participants).await,
            Commands::BlockPort { port } => self.handle_block_port(&port).await,
            Commands::ClearRules => self.handle_clear_rules().await,
            Commands::ShowConfig => {
                let rendered = if self.json {
                    self.config.to_json_pretty()?
                } else {
                    self.config.to_toml_pretty()?
                };
                println!("{}", rendered);
                Ok(())
            }
        }
    }

    async fn handle_peer_status(&self) -> Result<()> {
        let injector = self
            .config
            .fault_injection
            .injector()?
            .map(|injector| Arc::new(injector) as Arc<dyn FaultInjector>);

        let report = match self.config.pool.kind {
            PoolKind::Web => {
                self.peer_status(WebSessionFactory::from_config(&self.config, self.clock.clone())?, injector)
                    .await
            }
            PoolKind::Mobile => {
                self.peer_status(MobileSessionFactory::from_config(&self.config, self.clock.clone())?, injector)
                    .await
            }
            PoolKind::Hybrid => {
                self.peer_status(HybridSessionFactory::from_config(&self.config, self.clock.clone())?, injector)
                    .await
            }
        };
        self.report(report)
    }

    async fn peer_status<F: SessionFactory>(
        &self,
        factory: F,
        injector: Option<Arc<dyn FaultInjector>>,
    ) -> ScenarioReport {
        let pool = SessionPool::with_base_config(factory, self.base_config.clone());
        PeerConnectionStatusScenario::new(pool, injector, self.clock.clone(), self.config.timing.clone())
            .with_interrupt(ctrl_c())
            .run()
            .await
    }

    async fn handle_performance(&self, hold_secs: Option<u64>, participants: u32) -> Result<()> {
        if participants == 0 {
            bail!("at least one participant is needed");
        }
        let hold = hold_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.timing.performance_hold());

        let report = match self.config.pool.kind {
            PoolKind::Web => {
                self.performance(WebSessionFactory::from_config(&self.config, self.clock.clone())?, hold, participants)
                    .await
            }
            PoolKind::Mobile => {
                self.performance(MobileSessionFactory::from_config(&self.config, self.clock.clone())?, hold, participants)
                    .await
            }
            PoolKind::Hybrid => {
                self.performance(HybridSessionFactory::from_config(&self.config, self.clock.clone())?, hold, participants)
                    .await
            }
        };
        self.report(report)
    }

    async fn performance<F: SessionFactory>(
        &self,
        factory: F,
        hold: Duration,
        participants: u32,
    ) -> ScenarioReport {
        let pool = SessionPool::with_base_config(factory, self.base_config.clone());
        ClientPerformanceScenario::new(pool, self.clock.clone(), hold)
            .with_participants(participants)
            .with_interrupt(ctrl_c())
            .run()
            .await
    }

    async fn handle_block_port(&self, port: &str) -> Result<()> {
        let injector = self.require_injector()?;
        let port = injector
            .block_port_checked(port)
            .await
            .with_context(|| format!("failed to block port {}", port))?;
        info!("Port {} is blocked; run `confcheck clear-rules` to lift it", port);
        Ok(())
    }

    async fn handle_clear_rules(&self) -> Result<()> {
        self.require_injector()?
            .clear_all_rules()
            .await
            .context("failed to clear firewall rules")?;
        info!("All firewall rules cleared");
        Ok(())
    }

    fn require_injector(&self) -> Result<confcheck_core::ScriptFaultInjector> {
        self.config
            .fault_injection
            .injector()?
            .ok_or_else(|| anyhow!("fault_injection.script_path is not configured"))
    }

    fn report(&self, report: ScenarioReport) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", report);
        }

        match &report.outcome {
            ScenarioOutcome::Passed => Ok(()),
            ScenarioOutcome::Skipped(reason) => {
                warn!("{} was skipped: {}", report.name, reason);
                Ok(())
            }
            ScenarioOutcome::Failed(reason) => bail!("{} failed: {}", report.name, reason),
        }
    }
}

/// Resolves on Ctrl-C so a scenario can clean up before exiting
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Ctrl-C received, cleaning up"),
        Err(e) => {
            // Without a handler the scenario simply runs to completion
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    }
}
