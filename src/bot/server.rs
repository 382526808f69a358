//! Process assembly: configuration in, running lanes out.
//!
//! [`BridgeBot::new`] builds every supervisor, lane router, outbound scheduler and the
//! message router from a validated [`Config`]. [`BridgeBot::run`] connects the lanes,
//! starts the read loops and the health ticker, and blocks until Ctrl-C.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::commands::{BuiltinCommands, LoggingNodeDatabase};
use crate::config::{parse_node_id, Config};
use crate::dedup::PacketDeduplicator;
use crate::identity::{ContactBook, ContactStore};
use crate::metrics;
use crate::packet::{NetworkTag, NodeId};
use crate::router::{
    choose_reader, start_scheduler, CommandHandler, MessageRouter, NodeDatabase, TransportRouter,
};
use crate::supervisor::health::HealthMonitor;
use crate::supervisor::{ConnectionSupervisor, PacketSink, StartOutcome, SupervisorRole};
use crate::transport::meshcore::{CompanionFactory, CompanionMode};
use crate::transport::meshtastic::MeshtasticFactory;
use crate::transport::{DeviceDescriptor, TransportFactory};

/// Failures that decide the process exit code.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("every configured network failed configuration; check the device settings")]
    AllNetworksUnavailable,
}

/// One transport to supervise, before roles are assigned.
pub struct LaneSpec {
    pub name: String,
    pub network: NetworkTag,
    pub device: DeviceDescriptor,
    pub factory: Arc<dyn TransportFactory>,
}

/// Lanes described by the enabled `[primary]` and `[companion]` sections.
pub fn lanes_from_config(config: &Config) -> Result<Vec<LaneSpec>> {
    let mut lanes = Vec::new();
    if config.primary.enabled {
        lanes.push(LaneSpec {
            name: "primary".to_string(),
            network: NetworkTag::Primary,
            device: config.primary_device()?,
            factory: Arc::new(MeshtasticFactory::new(Duration::from_secs(
                config.primary.connect_timeout_secs,
            ))),
        });
    }
    if config.companion.enabled {
        let timeout = Duration::from_secs(config.companion.connect_timeout_secs);
        let mode = config.companion.companion_mode()?;
        lanes.push(LaneSpec {
            name: mode.as_str().to_string(),
            network: NetworkTag::Companion,
            device: config.companion_device()?,
            factory: Arc::new(CompanionFactory::new(mode, timeout)),
        });
        if let Some(raw) = config.companion_raw_device()? {
            lanes.push(LaneSpec {
                name: CompanionMode::Frame.as_str().to_string(),
                network: NetworkTag::Companion,
                device: raw,
                factory: Arc::new(CompanionFactory::new(CompanionMode::Frame, timeout)),
            });
        }
    }
    Ok(lanes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneReport {
    pub name: String,
    pub network: NetworkTag,
    pub outcome: StartOutcome,
}

pub struct BridgeBot {
    config: Config,
    supervisors: Vec<ConnectionSupervisor>,
    router: Arc<MessageRouter>,
    dedup: Arc<PacketDeduplicator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeBot {
    /// Build from configuration with the real transports and default collaborators.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let lanes = lanes_from_config(&config)?;
        let contacts: Arc<dyn ContactStore> = Arc::new(
            ContactBook::open(config.storage.contacts_path())
                .map_err(|e| anyhow!("Failed to open contact book: {}", e))?,
        );
        let handler: Arc<dyn CommandHandler> = Arc::new(BuiltinCommands::new(config.bot.name.clone()));
        let node_db: Arc<dyn NodeDatabase> = Arc::new(LoggingNodeDatabase::new());
        Self::assemble(config, lanes, contacts, handler, node_db)
    }

    /// Build from explicit lanes and collaborators.
    pub fn assemble(
        config: Config,
        lanes: Vec<LaneSpec>,
        contacts: Arc<dyn ContactStore>,
        handler: Arc<dyn CommandHandler>,
        node_db: Arc<dyn NodeDatabase>,
    ) -> Result<Self> {
        let supervisor_config = config.supervisor_config();
        let dedup = Arc::new(PacketDeduplicator::with_capacity(
            config.dedup_window(),
            config.dedup.max_entries,
        ));
        let mut router = MessageRouter::new(dedup.clone(), contacts, handler, node_db);

        let mut by_network: BTreeMap<NetworkTag, Vec<LaneSpec>> = BTreeMap::new();
        for lane in lanes {
            by_network.entry(lane.network).or_default().push(lane);
        }

        let mut supervisors = Vec::new();
        for (network, mut specs) in by_network {
            if specs.len() > 2 {
                return Err(anyhow!("{} network has {} lanes; at most two are supported", network, specs.len()));
            }
            let caps: Vec<_> = specs.iter().map(|s| s.factory.capabilities()).collect();
            let reader_idx =
                choose_reader(&caps).ok_or_else(|| anyhow!("no lane on the {} network can decode packets", network))?;
            let reader_spec = specs.remove(reader_idx);
            let reader = ConnectionSupervisor::new(
                reader_spec.name,
                network,
                SupervisorRole::ReadWrite,
                reader_spec.device,
                reader_spec.factory,
                supervisor_config.clone(),
            );
            let send_only = specs.pop().map(|spec| {
                ConnectionSupervisor::new(
                    spec.name,
                    network,
                    SupervisorRole::SendOnly,
                    spec.device,
                    spec.factory,
                    supervisor_config.clone(),
                )
            });
            supervisors.push(reader.clone());
            if let Some(lane) = &send_only {
                supervisors.push(lane.clone());
            }

            let lanes = Arc::new(TransportRouter::new(network, reader, send_only)?);
            let outbound = start_scheduler(config.scheduler_config(), lanes.clone());
            router = router.with_network(lanes, outbound, configured_own_id(&config, network)?);
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            supervisors,
            router: Arc::new(router),
            dedup,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn supervisors(&self) -> &[ConnectionSupervisor] {
        &self.supervisors
    }

    /// Connect every lane, then start the read loops and the health ticker.
    ///
    /// All startups are awaited before the ticker exists, so health checks never race
    /// the startup retries.
    pub async fn start(&mut self) -> Result<Vec<LaneReport>> {
        let mut set = JoinSet::new();
        for (idx, sup) in self.supervisors.iter().enumerate() {
            let sup = sup.clone();
            set.spawn(async move { (idx, sup.start().await) });
        }
        let mut outcomes = vec![StartOutcome::Retrying; self.supervisors.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = outcome,
                Err(e) => warn!("Lane startup task failed: {}", e),
            }
        }
        let reports: Vec<LaneReport> = self
            .supervisors
            .iter()
            .zip(outcomes)
            .map(|(sup, outcome)| LaneReport {
                name: sup.name().to_string(),
                network: sup.network(),
                outcome,
            })
            .collect();

        let networks: Vec<NetworkTag> = self.router.networks().collect();
        let all_failed = !networks.is_empty()
            && networks.iter().all(|net| {
                reports
                    .iter()
                    .filter(|r| r.network == *net)
                    .all(|r| r.outcome == StartOutcome::ConfigurationFailed)
            });
        if all_failed {
            error!("No configured network is reachable");
            return Err(BotError::AllNetworksUnavailable.into());
        }
        for report in &reports {
            match report.outcome {
                StartOutcome::Connected => info!("[{}] lane up on {} network", report.name, report.network),
                StartOutcome::Retrying => warn!("[{}] lane down; retrying in the background", report.name),
                StartOutcome::ConfigurationFailed => {
                    warn!("[{}] lane misconfigured; retrying slowly", report.name)
                }
            }
        }

        let sink: Arc<dyn PacketSink> = self.router.clone();
        for sup in &self.supervisors {
            if sup.role() == SupervisorRole::ReadWrite {
                self.tasks.push(sup.spawn_read_loop(sink.clone())?);
            }
        }
        let monitor = HealthMonitor::new(
            self.supervisors.clone(),
            self.dedup.clone(),
            self.config.supervisor_config().health_check_interval,
        );
        self.tasks.push(monitor.spawn(self.shutdown_tx.subscribe()));
        Ok(reports)
    }

    /// Start, then serve until Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        info!("Bot '{}' starting", self.config.bot.name);
        self.start().await?;
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop the ticker and schedulers, then close every lane's transport.
    pub async fn shutdown(&mut self) {
        info!("Shutting down...");
        self.shutdown_tx.send_replace(true);
        self.router.shutdown().await;
        for sup in &self.supervisors {
            sup.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Task ended abnormally: {}", e);
            }
        }
        info!("Final stats: {}", metrics::snapshot());
        info!("Shutdown complete");
    }
}

fn configured_own_id(config: &Config, network: NetworkTag) -> Result<Option<NodeId>> {
    let raw = match network {
        NetworkTag::Primary => &config.primary.node_id,
        NetworkTag::Companion => &config.companion.node_id,
    };
    parse_node_id(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_companion_config_yields_two_lanes() {
        let mut cfg = Config::default();
        cfg.companion.enabled = true;
        cfg.companion.raw_device = Some("/dev/ttyACM1".into());
        let lanes = lanes_from_config(&cfg).unwrap();
        let names: Vec<_> = lanes.iter().map(|l| (l.network, l.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (NetworkTag::Primary, "primary"),
                (NetworkTag::Companion, "companion-client"),
                (NetworkTag::Companion, "companion-frame"),
            ]
        );
    }

    #[tokio::test]
    async fn assemble_gives_client_lane_the_read_loop() {
        let mut cfg = Config::default();
        cfg.primary.enabled = false;
        cfg.companion.enabled = true;
        cfg.companion.raw_device = Some("/dev/ttyACM1".into());
        let lanes = lanes_from_config(&cfg).unwrap();
        let bot = BridgeBot::assemble(
            cfg,
            lanes,
            Arc::new(ContactBook::in_memory()),
            Arc::new(BuiltinCommands::new("t")),
            Arc::new(LoggingNodeDatabase::new()),
        )
        .unwrap();
        let roles: Vec<_> = bot.supervisors().iter().map(|s| (s.name().to_string(), s.role())).collect();
        assert_eq!(
            roles,
            vec![
                ("companion-client".to_string(), SupervisorRole::ReadWrite),
                ("companion-frame".to_string(), SupervisorRole::SendOnly),
            ]
        );
    }
}
