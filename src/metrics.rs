//! Process-wide counters for the intake pipeline and connection supervisors.
//! Logged periodically at debug level and once at shutdown.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static PACKETS_OBSERVED: AtomicU64 = AtomicU64::new(0);
static DUPLICATES_DROPPED: AtomicU64 = AtomicU64::new(0);
static DECODE_ERRORS: AtomicU64 = AtomicU64::new(0);
static UNRESOLVED_SENDERS: AtomicU64 = AtomicU64::new(0);
static SELF_DM_DROPPED: AtomicU64 = AtomicU64::new(0);
static OFF_TARGET_DROPPED: AtomicU64 = AtomicU64::new(0);
static REPLIES_SENT: AtomicU64 = AtomicU64::new(0);
static REPLIES_FAILED: AtomicU64 = AtomicU64::new(0);
static REPLIES_DROPPED: AtomicU64 = AtomicU64::new(0);
static RECONNECTS_STARTED: AtomicU64 = AtomicU64::new(0);
static RECONNECTS_SUCCEEDED: AtomicU64 = AtomicU64::new(0);

pub fn inc_packets_observed() {
    PACKETS_OBSERVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicates_dropped() {
    DUPLICATES_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decode_errors() {
    DECODE_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_unresolved_senders() {
    UNRESOLVED_SENDERS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_self_dm_dropped() {
    SELF_DM_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_off_target_dropped() {
    OFF_TARGET_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_sent() {
    REPLIES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_failed() {
    REPLIES_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_dropped() {
    REPLIES_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnects_started() {
    RECONNECTS_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnects_succeeded() {
    RECONNECTS_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub packets_observed: u64,
    pub duplicates_dropped: u64,
    pub decode_errors: u64,
    pub unresolved_senders: u64,
    pub self_dm_dropped: u64,
    pub off_target_dropped: u64,
    pub replies_sent: u64,
    pub replies_failed: u64,
    pub replies_dropped: u64,
    pub reconnects_started: u64,
    pub reconnects_succeeded: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        packets_observed: PACKETS_OBSERVED.load(Ordering::Relaxed),
        duplicates_dropped: DUPLICATES_DROPPED.load(Ordering::Relaxed),
        decode_errors: DECODE_ERRORS.load(Ordering::Relaxed),
        unresolved_senders: UNRESOLVED_SENDERS.load(Ordering::Relaxed),
        self_dm_dropped: SELF_DM_DROPPED.load(Ordering::Relaxed),
        off_target_dropped: OFF_TARGET_DROPPED.load(Ordering::Relaxed),
        replies_sent: REPLIES_SENT.load(Ordering::Relaxed),
        replies_failed: REPLIES_FAILED.load(Ordering::Relaxed),
        replies_dropped: REPLIES_DROPPED.load(Ordering::Relaxed),
        reconnects_started: RECONNECTS_STARTED.load(Ordering::Relaxed),
        reconnects_succeeded: RECONNECTS_SUCCEEDED.load(Ordering::Relaxed),
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets={} dup={} decode_err={} unresolved={} self_dm={} off_target={} \
             replies sent={} failed={} dropped={} reconnects {}/{}",
            self.packets_observed,
            self.duplicates_dropped,
            self.decode_errors,
            self.unresolved_senders,
            self.self_dm_dropped,
            self.off_target_dropped,
            self.replies_sent,
            self.replies_failed,
            self.replies_dropped,
            self.reconnects_succeeded,
            self.reconnects_started
        )
    }
}
