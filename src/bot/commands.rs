//! Default collaborators behind the routing boundary.

use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::logutil::payload_preview;
use crate::packet::{node_label, ResolvedPacket, SignalMetrics};
use crate::router::{CommandHandler, NodeDatabase, Reply};

/// Answers `ping` and `test` with the link details of the request.
pub struct BuiltinCommands {
    name: String,
}

impl BuiltinCommands {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn describe_signal(signal: &SignalMetrics) -> String {
    let mut parts = Vec::new();
    if let Some(snr) = signal.snr {
        parts.push(format!("SNR {:.1}dB", snr));
    }
    if let Some(rssi) = signal.rssi {
        parts.push(format!("RSSI {}", rssi));
    }
    match signal.hops {
        Some(0) => parts.push("direct".to_string()),
        Some(h) => parts.push(format!("{} hop{}", h, if h == 1 { "" } else { "s" })),
        None => {}
    }
    if !signal.path.is_empty() {
        let path: Vec<String> = signal.path.iter().map(|n| node_label(*n)).collect();
        parts.push(format!("via {}", path.join(",")));
    }
    if parts.is_empty() {
        "no signal info".to_string()
    } else {
        parts.join(" ")
    }
}

#[async_trait]
impl CommandHandler for BuiltinCommands {
    async fn handle(&self, packet: &ResolvedPacket) -> Option<Reply> {
        let text = packet.display_text.trim();
        let word = text
            .trim_start_matches(['!', '/'])
            .split_whitespace()
            .next()?
            .to_ascii_lowercase();
        let head = match word.as_str() {
            "ping" => "pong",
            "test" => "ack",
            _ => return None,
        };
        Some(Reply::mirror(format!(
            "{} from {} [{}]: {}",
            head,
            self.name,
            packet.network(),
            describe_signal(&packet.raw.signal)
        )))
    }
}

/// Node database that only logs what it is given.
#[derive(Default)]
pub struct LoggingNodeDatabase {
    recorded: AtomicU64,
}

impl LoggingNodeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

impl NodeDatabase for LoggingNodeDatabase {
    fn record(&self, packet: &ResolvedPacket) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] {:?} from {}: {}",
            packet.network(),
            packet.raw.payload_kind,
            node_label(packet.resolved_sender_id),
            payload_preview(&packet.raw.payload)
        );
    }
}
