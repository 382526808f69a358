//! Shared health ticker.
//!
//! One interval drives every supervisor's health check, the deduplicator sweep, link
//! keepalives and the periodic metrics line. Networks never share a supervisor, so a
//! reconnect on one lane cannot disturb the others.

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ConnectionSupervisor, HealthVerdict};
use crate::dedup::PacketDeduplicator;
use crate::metrics;

/// Ticks between keepalives (at the default 15s interval: every 5 minutes).
const KEEPALIVE_EVERY: u64 = 20;
/// Ticks between metrics log lines.
const STATS_EVERY: u64 = 40;

pub struct HealthMonitor {
    supervisors: Vec<ConnectionSupervisor>,
    dedup: Arc<PacketDeduplicator>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(supervisors: Vec<ConnectionSupervisor>, dedup: Arc<PacketDeduplicator>, interval: Duration) -> Self {
        Self {
            supervisors,
            dedup,
            interval,
        }
    }

    /// Run one round of checks. Returns each lane's verdict, in supervisor order.
    pub fn tick(&self) -> Vec<(String, HealthVerdict)> {
        let verdicts = self
            .supervisors
            .iter()
            .map(|sup| {
                let verdict = sup.health_check();
                if let HealthVerdict::ReconnectTriggered(reason) = verdict {
                    debug!("[{}] health: reconnect triggered ({:?})", sup.name(), reason);
                }
                (sup.name().to_string(), verdict)
            })
            .collect();
        let swept = self.dedup.sweep();
        if swept > 0 {
            debug!("Dedup sweep removed {} expired entries ({} live)", swept, self.dedup.len());
        }
        verdicts
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick fires immediately; the lanes were just started
            ticker.tick().await;
            info!(
                "Health monitor running every {}s for {} lane(s)",
                self.interval.as_secs(),
                self.supervisors.len()
            );
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait_for(|s| *s) => break,
                }
                ticks += 1;
                self.tick();
                if ticks % KEEPALIVE_EVERY == 0 {
                    for sup in &self.supervisors {
                        sup.keepalive();
                    }
                }
                if ticks % STATS_EVERY == 0 {
                    debug!("stats: {}", metrics::snapshot());
                }
            }
            debug!("Health monitor stopped");
        })
    }
}
