//! Retransmission filter.
//!
//! Radios on both networks re-send a frame until they hear a rebroadcast or an ACK, and
//! the companion firmware happily hands every copy to the host. Copies carry the same
//! content but different signal metrics, so the filter keys on content only:
//! `(network, sender_raw, key_prefix, payload)`.
//!
//! The key prefix is part of the sender identity on the companion network where
//! `sender_raw` is usually the unknown sentinel; without it two different people
//! sending "ping" in the same window would collapse into one.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::packet::RawPacket;

/// Default time during which an identical payload counts as a retransmission.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

/// Default cap on tracked hashes. When reached, the oldest entries are evicted.
pub const DEFAULT_MAX_ENTRIES: usize = 4096;

type ContentHash = [u8; 32];

struct Cache {
    entries: HashMap<ContentHash, Instant>,
    last_sweep: Instant,
}

/// Content-hash cache with a fixed expiry window.
pub struct PacketDeduplicator {
    window: Duration,
    max_entries: usize,
    cache: Mutex<Cache>,
}

/// Hash of the fields that identify a logical message. Signal metrics and reception
/// time are not hashed.
pub fn content_hash(packet: &RawPacket) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update([packet.network.discriminant()]);
    hasher.update(packet.sender_raw.to_le_bytes());
    match &packet.key_prefix {
        Some(prefix) => {
            hasher.update([1u8]);
            hasher.update(prefix.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.update((packet.payload.len() as u32).to_le_bytes());
    hasher.update(&packet.payload);
    hasher.finalize().into()
}

impl PacketDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self::with_capacity(window, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries: max_entries.max(1),
            cache: Mutex::new(Cache {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns false if an identical packet was accepted within the window; otherwise
    /// records this one and returns true.
    pub fn should_process(&self, packet: &RawPacket) -> bool {
        self.should_process_at(packet, Instant::now())
    }

    pub fn should_process_at(&self, packet: &RawPacket, now: Instant) -> bool {
        let hash = content_hash(packet);
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(first_seen) = cache.entries.get(&hash) {
            if now.saturating_duration_since(*first_seen) < self.window {
                return false;
            }
        }

        if now.saturating_duration_since(cache.last_sweep) >= self.window {
            Self::evict_expired(&mut cache, now, self.window);
        }
        if cache.entries.len() >= self.max_entries {
            Self::evict_oldest(&mut cache, self.max_entries / 4 + 1);
        }
        cache.entries.insert(hash, now);
        true
    }

    /// Drop expired entries. Called from the periodic health tick.
    pub fn sweep(&self) -> usize {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::evict_expired(&mut cache, Instant::now(), self.window)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(cache: &mut Cache, now: Instant, window: Duration) -> usize {
        let before = cache.entries.len();
        cache
            .entries
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) < window);
        cache.last_sweep = now;
        before - cache.entries.len()
    }

    fn evict_oldest(cache: &mut Cache, count: usize) {
        let mut by_age: Vec<(ContentHash, Instant)> =
            cache.entries.iter().map(|(h, t)| (*h, *t)).collect();
        by_age.sort_by_key(|(_, t)| *t);
        for (hash, _) in by_age.into_iter().take(count) {
            cache.entries.remove(&hash);
        }
        log::debug!("dedup cache full; evicted {} oldest entries", count);
    }
}

impl Default for PacketDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
