//! Outbound dispatch scheduler.
//!
//! Every reply leaves through one scheduler per network. Submitting never blocks the
//! caller: [`OutboundHandle::enqueue`] hands the envelope to the scheduler task and
//! returns. The completion callback is mandatory and is the only way to learn how a
//! send ended; it is used for logging and metrics, never for control flow.
//!
//! Scheduling rules:
//! * Direct messages outrank broadcasts (`Priority::High` vs `Normal`).
//! * A minimum gap between sends keeps the radio duty cycle sane.
//! * Bounded queue; on overflow the lowest-priority, oldest envelope is dropped.
//! * Waiting envelopes age one priority step after `aging_threshold`.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::transport_router::TransportRouter;
use crate::logutil::truncate_for_log;
use crate::packet::NetworkTag;
use crate::transport::DirectTarget;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    High,
    Normal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Broadcast { channel: u32 },
    Direct(DirectTarget),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub network: NetworkTag,
    pub destination: Destination,
    pub text: String,
}

impl OutboundMessage {
    pub fn priority(&self) -> Priority {
        match self.destination {
            Destination::Direct(_) => Priority::High,
            Destination::Broadcast { .. } => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent,
    Failed(String),
    /// Never attempted (queue overflow or scheduler shut down).
    Dropped(&'static str),
}

pub type CompletionCallback = Box<dyn FnOnce(SendOutcome) + Send + 'static>;

pub struct MessageEnvelope {
    pub priority: Priority,
    pub earliest: Instant,
    pub enqueued_at: Instant,
    pub msg: OutboundMessage,
    on_complete: CompletionCallback,
}

impl MessageEnvelope {
    pub fn new(msg: OutboundMessage, delay: Duration, on_complete: CompletionCallback) -> Self {
        let now = Instant::now();
        Self {
            priority: msg.priority(),
            earliest: now + delay,
            enqueued_at: now,
            msg,
            on_complete,
        }
    }

    fn complete(self, outcome: SendOutcome) {
        (self.on_complete)(outcome)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub min_send_gap: Duration,
    pub max_queue: usize,
    pub aging_threshold: Duration,
    pub stats_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_send_gap: Duration::from_millis(2000),
            max_queue: 64,
            aging_threshold: Duration::from_secs(30),
            stats_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub dispatched_total: u64,
    pub failed_total: u64,
    pub dropped_total: u64,
    pub dropped_overflow: u64,
    pub escalations: u64,
}

enum ScheduleCommand {
    Enqueue(MessageEnvelope),
    Snapshot(oneshot::Sender<SchedulerStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct OutboundHandle {
    network: NetworkTag,
    tx: mpsc::UnboundedSender<ScheduleCommand>,
}

impl std::fmt::Debug for ScheduleCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleCommand::Enqueue(env) => write!(f, "Enqueue({:?})", env.msg),
            ScheduleCommand::Snapshot(_) => f.write_str("Snapshot"),
            ScheduleCommand::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl OutboundHandle {
    pub fn network(&self) -> NetworkTag {
        self.network
    }

    /// Submit and detach. The callback runs exactly once, possibly on another task.
    pub fn enqueue(&self, msg: OutboundMessage, on_complete: CompletionCallback) {
        self.enqueue_after(msg, Duration::ZERO, on_complete)
    }

    pub fn enqueue_after(&self, msg: OutboundMessage, delay: Duration, on_complete: CompletionCallback) {
        let env = MessageEnvelope::new(msg, delay, on_complete);
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(ScheduleCommand::Enqueue(env)) {
            if let ScheduleCommand::Enqueue(env) = cmd {
                env.complete(SendOutcome::Dropped("dispatcher stopped"));
            }
        }
    }

    pub async fn snapshot(&self) -> Option<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ScheduleCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop the scheduler. Envelopes still queued complete as dropped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ScheduleCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn pick_overflow_victim(queue: &[MessageEnvelope]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .max_by(|(ai, a), (bi, b)| {
            a.priority
                .cmp(&b.priority)
                .then(b.enqueued_at.cmp(&a.enqueued_at))
                .then(bi.cmp(ai))
        })
        .map(|(i, _)| i)
}

async fn deliver(router: &TransportRouter, msg: &OutboundMessage) -> SendOutcome {
    let result = match &msg.destination {
        Destination::Broadcast { channel } => router.send_broadcast(*channel, &msg.text).await,
        Destination::Direct(target) => router.send_direct(target, &msg.text).await,
    };
    match result {
        Ok(()) => SendOutcome::Sent,
        Err(e) => SendOutcome::Failed(e.to_string()),
    }
}

pub fn start_scheduler(cfg: SchedulerConfig, router: Arc<TransportRouter>) -> OutboundHandle {
    let network = router.network();
    let (tx, mut rx) = mpsc::unbounded_channel::<ScheduleCommand>();
    let handle = OutboundHandle { network, tx };

    tokio::spawn(async move {
        let mut last_sent: Option<Instant> = None;
        let mut queue: Vec<MessageEnvelope> = Vec::new();
        let mut stats = SchedulerStats::default();
        const TICK: Duration = Duration::from_millis(50);
        let mut last_stats_log = Instant::now();
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(ScheduleCommand::Enqueue(env)) => {
                            if queue.len() >= cfg.max_queue.max(1) {
                                if let Some(victim) = pick_overflow_victim(&queue) {
                                    let dropped = queue.remove(victim);
                                    stats.dropped_total += 1;
                                    stats.dropped_overflow += 1;
                                    warn!("[{}] outbound queue full; dropping one message", network);
                                    dropped.complete(SendOutcome::Dropped("queue overflow"));
                                }
                            }
                            queue.push(env);
                        }
                        Some(ScheduleCommand::Snapshot(resp)) => {
                            let _ = resp.send(SchedulerStats { queued: queue.len(), ..stats.clone() });
                        }
                        Some(ScheduleCommand::Shutdown(done)) => {
                            for env in queue.drain(..) {
                                env.complete(SendOutcome::Dropped("dispatcher stopped"));
                            }
                            let _ = done.send(());
                            break;
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(TICK) => {}
            }
            if queue.is_empty() {
                continue;
            }
            let now = Instant::now();

            if !cfg.stats_interval.is_zero() && now.duration_since(last_stats_log) >= cfg.stats_interval {
                debug!(
                    "[{}] outbound stats: queued={} dispatched={} failed={} dropped={} overflow={} escalations={}",
                    network,
                    queue.len(),
                    stats.dispatched_total,
                    stats.failed_total,
                    stats.dropped_total,
                    stats.dropped_overflow,
                    stats.escalations
                );
                last_stats_log = now;
            }

            for env in queue.iter_mut() {
                if env.priority == Priority::Normal && now.duration_since(env.enqueued_at) >= cfg.aging_threshold {
                    env.priority = Priority::High;
                    stats.escalations += 1;
                }
            }

            queue.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.earliest.cmp(&b.earliest)));

            let Some(pos) = queue.iter().position(|e| e.earliest <= now) else {
                continue;
            };
            if let Some(last) = last_sent {
                if now < last + cfg.min_send_gap {
                    continue;
                }
            }
            let ready = queue.remove(pos);
            debug!(
                "[{}] sending {:?}: '{}'",
                network,
                ready.msg.destination,
                truncate_for_log(&ready.msg.text, 80)
            );
            let outcome = deliver(&router, &ready.msg).await;
            match &outcome {
                SendOutcome::Sent => stats.dispatched_total += 1,
                _ => stats.failed_total += 1,
            }
            last_sent = Some(Instant::now());
            ready.complete(outcome);
        }
        for env in queue.drain(..) {
            env.complete(SendOutcome::Dropped("dispatcher stopped"));
        }
        debug!("[{}] outbound scheduler terminated", network);
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(priority: Priority, dest: Destination, at: Instant) -> MessageEnvelope {
        let mut e = MessageEnvelope::new(
            OutboundMessage {
                network: NetworkTag::Primary,
                destination: dest,
                text: "x".into(),
            },
            Duration::ZERO,
            Box::new(|_| {}),
        );
        e.priority = priority;
        e.enqueued_at = at;
        e
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_victim_is_lowest_priority_oldest() {
        let t0 = Instant::now();
        let queue = vec![
            env(Priority::High, Destination::Broadcast { channel: 0 }, t0),
            env(Priority::Normal, Destination::Broadcast { channel: 0 }, t0 + Duration::from_secs(1)),
            env(Priority::Normal, Destination::Broadcast { channel: 0 }, t0),
            env(Priority::Normal, Destination::Broadcast { channel: 0 }, t0 + Duration::from_secs(2)),
        ];
        assert_eq!(pick_overflow_victim(&queue), Some(2));
    }

    #[test]
    fn direct_outranks_broadcast() {
        let direct = OutboundMessage {
            network: NetworkTag::Companion,
            destination: Destination::Direct(DirectTarget {
                node_id: 1,
                key_prefix: None,
            }),
            text: String::new(),
        };
        assert_eq!(direct.priority(), Priority::High);
        assert!(Priority::High < Priority::Normal);
    }
}
