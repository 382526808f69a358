//! # Connection Supervision
//!
//! One [`ConnectionSupervisor`] per configured transport ("lane"). It owns the only
//! long-lived reference to the live transport and is the only thing that replaces it.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Degraded -> ReconnectScheduled -> Connecting ...
//!                                                     \-> Shutdown (deliberate close only)
//! ```
//!
//! Liveness is judged from traffic: every frame the read loop sees refreshes
//! `last_activity`, routable or not, and the shared health tick flags a lane whose
//! silence exceeds the threshold. A send-only lane has no read loop and so no traffic to
//! judge; it is reconnected only when its link fails. Reconnects run on a detached task
//! so a health tick never waits on a radio.

pub mod health;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::metrics;
use crate::packet::{NetworkTag, NodeId, RawPacket};
use crate::transport::{Capabilities, DeviceDescriptor, ReadEvent, Transport, TransportError, TransportFactory};

/// Timing inputs for a supervisor. Everything is configuration; nothing is hard-coded.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub health_check_interval: Duration,
    /// Longest tolerated gap since the last observed packet.
    pub silence_threshold: Duration,
    /// Pause between closing the old transport and opening the new one.
    pub settle_delay: Duration,
    /// Pause between opening the new transport and declaring it live.
    pub stabilize_delay: Duration,
    /// Delay between startup attempts.
    pub retry_delay: Duration,
    pub startup_attempts: u32,
    /// Retry cadence after a configuration error (missing device).
    pub config_retry: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(15),
            silence_threshold: Duration::from_secs(90),
            settle_delay: Duration::from_secs(2),
            stabilize_delay: Duration::from_secs(3),
            retry_delay: Duration::from_secs(5),
            startup_attempts: 3,
            config_retry: Duration::from_secs(300),
        }
    }
}

impl SupervisorConfig {
    /// A threshold shorter than four health intervals declares a healthy but quiet mesh
    /// dead between ticks.
    pub fn validate(&self) -> Result<(), String> {
        if self.health_check_interval.is_zero() {
            return Err("health_check_interval must be greater than zero".into());
        }
        if self.silence_threshold < self.health_check_interval * 4 {
            return Err(format!(
                "silence_threshold ({}s) must be at least 4x health_check_interval ({}s)",
                self.silence_threshold.as_secs_f32(),
                self.health_check_interval.as_secs_f32()
            ));
        }
        if self.startup_attempts == 0 {
            return Err("startup_attempts must be at least 1".into());
        }
        if self.config_retry.is_zero() {
            return Err("config_retry must be greater than zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    ReconnectScheduled,
    Shutdown,
}

/// Whether a lane owns its network's read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorRole {
    ReadWrite,
    SendOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Connected,
    /// Startup attempts exhausted; health checks keep retrying.
    Retrying,
    /// The device is missing or misnamed; retried at the slow configuration cadence.
    ConfigurationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Silence(Duration),
    LinkLost,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    ReconnectInProgress,
    WaitingForConfig,
    ShutDown,
    ReconnectTriggered(TriggerReason),
}

/// Where a read loop delivers packets.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn ingest(&self, packet: RawPacket);
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    last_activity: Instant,
    reconnect_attempts: u32,
    link_lost: bool,
    config_error_reported: bool,
    last_failure_was_config: bool,
    last_attempt: Option<Instant>,
}

struct Inner {
    name: String,
    network: NetworkTag,
    role: SupervisorRole,
    device: DeviceDescriptor,
    factory: Arc<dyn TransportFactory>,
    config: SupervisorConfig,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    status: Mutex<Status>,
    reconnect_in_progress: AtomicBool,
    generation: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(
        name: impl Into<String>,
        network: NetworkTag,
        role: SupervisorRole,
        device: DeviceDescriptor,
        factory: Arc<dyn TransportFactory>,
        config: SupervisorConfig,
    ) -> Self {
        let (generation, _) = watch::channel(0u64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                network,
                role,
                device,
                factory,
                config,
                transport: RwLock::new(None),
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    last_activity: Instant::now(),
                    reconnect_attempts: 0,
                    link_lost: false,
                    config_error_reported: false,
                    last_failure_was_config: false,
                    last_attempt: None,
                }),
                reconnect_in_progress: AtomicBool::new(false),
                generation,
                shutdown,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn network(&self) -> NetworkTag {
        self.inner.network
    }

    pub fn role(&self) -> SupervisorRole {
        self.inner.role
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.inner.device
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Capabilities of the transports this lane builds, known before connecting.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.factory.capabilities()
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        match self.inner.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.status().reconnect_attempts
    }

    pub fn last_activity(&self) -> Instant {
        self.status().last_activity
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnect_in_progress.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Live and usable for sends.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected | ConnectionState::Degraded) && self.current().is_some()
    }

    /// Clone of the live transport reference, if any.
    pub fn current(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.read().ok().and_then(|t| t.clone())
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.current().and_then(|t| t.local_node_id())
    }

    /// Establish the first transport, retrying `startup_attempts` times.
    pub async fn start(&self) -> StartOutcome {
        let attempts = self.inner.config.startup_attempts.max(1);
        for attempt in 1..=attempts {
            if self.is_shut_down() {
                return StartOutcome::Retrying;
            }
            self.set_connecting();
            info!(
                "[{}] Connecting to {} (attempt {}/{})",
                self.inner.name, self.inner.device, attempt, attempts
            );
            match self.inner.factory.connect(&self.inner.device, self.inner.role).await {
                Ok(transport) => {
                    self.install(transport);
                    return StartOutcome::Connected;
                }
                Err(e) if e.is_configuration() => {
                    self.record_failure(&e);
                    return StartOutcome::ConfigurationFailed;
                }
                Err(e) => {
                    self.record_failure(&e);
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.retry_delay).await;
                    }
                }
            }
        }
        warn!(
            "[{}] Could not connect after {} attempts; health checks will keep retrying",
            self.inner.name, attempts
        );
        StartOutcome::Retrying
    }

    /// Record liveness. Called for every inbound frame before any filtering.
    pub fn on_packet_observed(&self) {
        self.status().last_activity = Instant::now();
    }

    /// Decide whether this lane needs a reconnect and kick one off if so.
    /// Never waits for the reconnect itself.
    pub fn health_check(&self) -> HealthVerdict {
        if self.is_shut_down() {
            return HealthVerdict::ShutDown;
        }
        if self.is_reconnecting() {
            return HealthVerdict::ReconnectInProgress;
        }
        let now = Instant::now();
        let reason = {
            let mut status = self.status();
            let reason = match status.state {
                ConnectionState::Shutdown => return HealthVerdict::ShutDown,
                ConnectionState::Disconnected if status.last_failure_was_config => {
                    let due = status
                        .last_attempt
                        .map(|t| now.saturating_duration_since(t) >= self.inner.config.config_retry)
                        .unwrap_or(true);
                    if !due {
                        return HealthVerdict::WaitingForConfig;
                    }
                    TriggerReason::Scheduled
                }
                ConnectionState::ReconnectScheduled | ConnectionState::Disconnected => TriggerReason::Scheduled,
                ConnectionState::Connecting => return HealthVerdict::ReconnectInProgress,
                ConnectionState::Connected | ConnectionState::Degraded => {
                    let silence = now.saturating_duration_since(status.last_activity);
                    if status.link_lost {
                        TriggerReason::LinkLost
                    } else if self.inner.role == SupervisorRole::ReadWrite
                        && silence > self.inner.config.silence_threshold
                    {
                        TriggerReason::Silence(silence)
                    } else {
                        return HealthVerdict::Healthy;
                    }
                }
            };
            if status.state == ConnectionState::Connected {
                status.state = ConnectionState::Degraded;
            }
            reason
        };

        match reason {
            TriggerReason::Silence(gap) => warn!(
                "[{}] No traffic for {}s (threshold {}s); reconnecting",
                self.inner.name,
                gap.as_secs(),
                self.inner.config.silence_threshold.as_secs()
            ),
            TriggerReason::LinkLost => warn!("[{}] Link lost; reconnecting", self.inner.name),
            TriggerReason::Scheduled => debug!("[{}] Retrying connection", self.inner.name),
        }
        self.reconnect();
        HealthVerdict::ReconnectTriggered(reason)
    }

    /// Start a reconnect on a detached task. Returns false if one is already running or
    /// the supervisor is shut down.
    pub fn reconnect(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        if self.inner.reconnect_in_progress.swap(true, Ordering::SeqCst) {
            debug!("[{}] Reconnect already in progress", self.inner.name);
            return false;
        }
        metrics::inc_reconnects_started();
        let this = self.clone();
        tokio::spawn(async move {
            this.run_reconnect().await;
            this.inner.reconnect_in_progress.store(false, Ordering::SeqCst);
        });
        true
    }

    async fn run_reconnect(&self) {
        let old = self.inner.transport.write().ok().and_then(|mut t| t.take());
        if let Some(old) = old {
            debug!("[{}] Closing previous transport", self.inner.name);
            old.close().await;
        }
        tokio::time::sleep(self.inner.config.settle_delay).await;
        if self.is_shut_down() {
            return;
        }

        self.set_connecting();
        info!("[{}] Reconnecting to {}", self.inner.name, self.inner.device);
        match self.inner.factory.connect(&self.inner.device, self.inner.role).await {
            Ok(transport) => {
                tokio::time::sleep(self.inner.config.stabilize_delay).await;
                if self.is_shut_down() {
                    transport.close().await;
                    return;
                }
                self.install(transport);
                metrics::inc_reconnects_succeeded();
            }
            Err(e) => self.record_failure(&e),
        }
    }

    fn set_connecting(&self) {
        let mut status = self.status();
        status.state = ConnectionState::Connecting;
        status.last_attempt = Some(Instant::now());
    }

    fn install(&self, transport: Arc<dyn Transport>) {
        if let Ok(mut slot) = self.inner.transport.write() {
            *slot = Some(transport);
        }
        {
            let mut status = self.status();
            status.state = ConnectionState::Connected;
            status.last_activity = Instant::now();
            status.reconnect_attempts = 0;
            status.link_lost = false;
            status.last_failure_was_config = false;
        }
        self.inner.generation.send_modify(|g| *g += 1);
        info!("[{}] Connected to {}", self.inner.name, self.inner.device);
    }

    fn record_failure(&self, e: &TransportError) {
        let mut status = self.status();
        status.reconnect_attempts = status.reconnect_attempts.saturating_add(1);
        if e.is_configuration() {
            status.state = ConnectionState::Disconnected;
            status.last_failure_was_config = true;
            if !status.config_error_reported {
                status.config_error_reported = true;
                error!(
                    "[{}] Configuration error for {}: {}. Retrying every {}s",
                    self.inner.name,
                    self.inner.device,
                    e,
                    self.inner.config.config_retry.as_secs()
                );
            } else {
                debug!("[{}] Still unavailable: {}", self.inner.name, e);
            }
        } else {
            status.state = ConnectionState::ReconnectScheduled;
            status.last_failure_was_config = false;
            warn!(
                "[{}] Connection to {} failed (attempt {}): {}",
                self.inner.name, self.inner.device, status.reconnect_attempts, e
            );
        }
    }

    /// Flag the transport of `generation` as dead. Ignored if it was already replaced.
    pub fn mark_link_lost(&self, generation: u64) {
        if *self.inner.generation.borrow() != generation {
            return;
        }
        let mut status = self.status();
        if !status.link_lost {
            status.link_lost = true;
            debug!("[{}] Read loop reported link loss", self.inner.name);
        }
    }

    /// Flag the link dead after a write on `transport` failed, unless that transport was
    /// already replaced. This is the only link-loss signal a send-only lane gets.
    pub fn on_write_failed(&self, transport: &Arc<dyn Transport>, err: &TransportError) {
        if !err.is_link_failure() {
            return;
        }
        let is_current = self
            .current()
            .map(|live| std::ptr::addr_eq(Arc::as_ptr(&live), Arc::as_ptr(transport)))
            .unwrap_or(false);
        if !is_current {
            return;
        }
        let mut status = self.status();
        if !status.link_lost {
            status.link_lost = true;
            warn!("[{}] Write failed ({}); link marked lost", self.inner.name, err);
        }
    }

    fn current_with_generation(&self) -> (Option<Arc<dyn Transport>>, u64) {
        let generation = *self.inner.generation.borrow();
        (self.current(), generation)
    }

    /// True when the transport of `generation` is gone or known dead and has not been
    /// replaced yet.
    fn awaiting_replacement(&self, generation: u64) -> bool {
        if *self.inner.generation.borrow() != generation {
            return false;
        }
        self.current().is_none() || self.status().link_lost
    }

    /// Ask the live transport for a keepalive without waiting on it.
    pub fn keepalive(&self) {
        if self.is_reconnecting() {
            return;
        }
        if let Some(transport) = self.current() {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.keepalive().await {
                    debug!("[{}] Keepalive failed: {}", this.inner.name, e);
                    this.on_write_failed(&transport, &e);
                }
            });
        }
    }

    /// Spawn the network's read loop. Only a read-owning lane may do this.
    pub fn spawn_read_loop(&self, sink: Arc<dyn PacketSink>) -> Result<JoinHandle<()>, SupervisorError> {
        if self.inner.role != SupervisorRole::ReadWrite {
            return Err(SupervisorError::SendOnly(self.inner.name.clone()));
        }
        let this = self.clone();
        Ok(tokio::spawn(async move { this.read_loop(sink).await }))
    }

    async fn read_loop(&self, sink: Arc<dyn PacketSink>) {
        let mut generation_rx = self.inner.generation.subscribe();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        debug!("[{}] Read loop started", self.inner.name);
        loop {
            if self.is_shut_down() {
                break;
            }
            let (transport, generation) = self.current_with_generation();
            let Some(transport) = transport else {
                tokio::select! {
                    _ = generation_rx.wait_for(|g| *g != generation) => continue,
                    _ = shutdown_rx.wait_for(|s| *s) => break,
                }
            };
            match transport.read_next().await {
                Ok(Some(event)) => {
                    self.on_packet_observed();
                    if let ReadEvent::Packet(packet) = event {
                        sink.ingest(packet).await;
                    }
                }
                Ok(None) => {
                    warn!("[{}] Link closed by peer", self.inner.name);
                    self.mark_link_lost(generation);
                }
                Err(TransportError::Closed) => {
                    // Closed by us: shutdown or a reconnect swapping the transport
                    debug!("[{}] Transport closed", self.inner.name);
                }
                Err(e) => {
                    warn!("[{}] Read failed: {}", self.inner.name, e);
                    self.mark_link_lost(generation);
                }
            }
            if self.awaiting_replacement(generation) {
                // Wait for a replacement transport instead of spinning on a dead one
                tokio::select! {
                    _ = generation_rx.wait_for(|g| *g != generation) => {}
                    _ = shutdown_rx.wait_for(|s| *s) => break,
                }
            }
        }
        debug!("[{}] Read loop stopped", self.inner.name);
    }

    /// Close the live transport and stop all further activity.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.status().state = ConnectionState::Shutdown;
        let transport = self.inner.transport.write().ok().and_then(|mut t| t.take());
        if let Some(transport) = transport {
            transport.close().await;
        }
        info!("[{}] Shut down", self.inner.name);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor '{0}' is send-only and cannot own a read loop")]
    SendOnly(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_enforces_four_intervals() {
        let mut cfg = SupervisorConfig {
            health_check_interval: Duration::from_secs(15),
            silence_threshold: Duration::from_secs(59),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.silence_threshold = Duration::from_secs(60);
        assert!(cfg.validate().is_ok());
        cfg.health_check_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
