//! # Dual-network message routing
//!
//! [`MessageRouter`] is the single entry point for packets from every read loop. For
//! each packet it records liveness, drops retransmissions, resolves the sender,
//! classifies the packet and hands messages to the [`CommandHandler`]. Replies leave
//! through the outbound scheduler of the network the packet arrived on; a packet never
//! crosses networks.
//!
//! ```text
//! read loop -> ingest -> dedup -> identity -> classify -> handler -> outbound -> lanes
//! ```

pub mod outbound;
pub mod transport_router;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::dedup::PacketDeduplicator;
use crate::identity::{ContactStore, LocalIdentity, SenderIdentityResolver};
use crate::logutil::{escape_log, truncate_for_log};
use crate::metrics;
use crate::packet::{is_concrete, node_label, KeyPrefix, NetworkTag, NodeId, RawPacket, Resolution, ResolvedPacket};
use crate::supervisor::PacketSink;
use crate::transport::DirectTarget;

pub use outbound::{
    start_scheduler, Destination, OutboundHandle, OutboundMessage, Priority, SchedulerConfig, SchedulerStats,
    SendOutcome,
};
pub use transport_router::{choose_reader, Operation, RoutingError, TransportRouter};

/// Where a reply should go, relative to the packet that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyRoute {
    /// Same shape as the request: DM answered by DM, channel message on its channel.
    Mirror,
    /// Privately to the sender, whatever the request was.
    Direct,
    /// On the given channel of the originating network.
    Channel(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub route: ReplyRoute,
}

impl Reply {
    pub fn mirror(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            route: ReplyRoute::Mirror,
        }
    }

    pub fn direct(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            route: ReplyRoute::Direct,
        }
    }
}

/// Command-processing boundary.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, packet: &ResolvedPacket) -> Option<Reply>;
}

/// Sink for telemetry, position, node-info and routing packets. Write-only.
pub trait NodeDatabase: Send + Sync {
    fn record(&self, packet: &ResolvedPacket);
}

/// What [`MessageRouter::ingest`] did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    UnknownNetwork,
    Duplicate,
    NodeData,
    /// Direct message addressed to some other concrete node.
    OffTarget,
    /// Direct message the bot sent to itself.
    SelfDirectMessage,
    Handled,
    ReplyQueued,
    /// The handler answered but there was nobody to answer to.
    ReplyDropped,
}

struct NetworkPort {
    lanes: Arc<TransportRouter>,
    outbound: OutboundHandle,
    /// Own id from configuration; wins over what the radio reports.
    pinned_id: Option<NodeId>,
}

#[derive(Debug, Clone, Copy)]
struct Conversation {
    network: NetworkTag,
    key_prefix: Option<KeyPrefix>,
    /// Ingest order; the highest one is where the node was heard last.
    heard: u64,
}

pub struct MessageRouter {
    networks: HashMap<NetworkTag, NetworkPort>,
    dedup: Arc<PacketDeduplicator>,
    resolver: SenderIdentityResolver,
    local: Arc<LocalIdentity>,
    handler: Arc<dyn CommandHandler>,
    node_db: Arc<dyn NodeDatabase>,
    /// Node ids only identify a sender within one network.
    conversations: Mutex<HashMap<(NetworkTag, NodeId), Conversation>>,
    heard_counter: AtomicU64,
}

impl MessageRouter {
    pub fn new(
        dedup: Arc<PacketDeduplicator>,
        contacts: Arc<dyn ContactStore>,
        handler: Arc<dyn CommandHandler>,
        node_db: Arc<dyn NodeDatabase>,
    ) -> Self {
        let local = Arc::new(LocalIdentity::new());
        Self {
            networks: HashMap::new(),
            dedup,
            resolver: SenderIdentityResolver::new(contacts, local.clone()),
            local,
            handler,
            node_db,
            conversations: Mutex::new(HashMap::new()),
            heard_counter: AtomicU64::new(0),
        }
    }

    /// Attach a network. `own_id` pins the bot's id instead of trusting the radio.
    pub fn with_network(mut self, lanes: Arc<TransportRouter>, outbound: OutboundHandle, own_id: Option<NodeId>) -> Self {
        let network = lanes.network();
        if let Some(id) = own_id {
            self.local.set(network, id);
        }
        self.networks.insert(
            network,
            NetworkPort {
                lanes,
                outbound,
                pinned_id: own_id.filter(|id| is_concrete(*id)),
            },
        );
        self
    }

    pub fn local_identity(&self) -> &Arc<LocalIdentity> {
        &self.local
    }

    pub fn networks(&self) -> impl Iterator<Item = NetworkTag> + '_ {
        self.networks.keys().copied()
    }

    pub fn lanes(&self, network: NetworkTag) -> Option<&Arc<TransportRouter>> {
        self.networks.get(&network).map(|p| &p.lanes)
    }

    /// Network a resolved sender was last heard on.
    pub fn last_network_of(&self, node: NodeId) -> Option<NetworkTag> {
        self.latest_conversation(node).map(|conv| conv.network)
    }

    fn latest_conversation(&self, node: NodeId) -> Option<Conversation> {
        let conversations = self.conversations.lock().ok()?;
        conversations
            .iter()
            .filter(|((_, id), _)| *id == node)
            .map(|(_, conv)| *conv)
            .max_by_key(|conv| conv.heard)
    }

    pub async fn ingest(&self, raw: RawPacket) -> IngestOutcome {
        let network = raw.network;
        let Some(port) = self.networks.get(&network) else {
            warn!("Dropping packet for unconfigured {} network", network);
            return IngestOutcome::UnknownNetwork;
        };

        port.lanes.read_owner().on_packet_observed();
        metrics::inc_packets_observed();

        if !self.dedup.should_process(&raw) {
            metrics::inc_duplicates_dropped();
            trace!("[{}] duplicate from {} dropped", network, node_label(raw.sender_raw));
            return IngestOutcome::Duplicate;
        }

        if port.pinned_id.is_none() {
            if let Some(id) = port.lanes.read_owner().local_node_id() {
                self.local.set(network, id);
            }
        }

        let identity = self.resolver.resolve(&raw);
        let is_message = raw.payload_kind.is_message();
        let is_broadcast = is_message && raw.is_broadcast();
        let packet = ResolvedPacket {
            is_broadcast,
            is_direct_message: is_message && !is_broadcast,
            resolved_sender_id: identity.sender_id,
            resolution: identity.resolution,
            display_text: identity.display_text,
            raw,
        };

        if !is_message {
            self.node_db.record(&packet);
            return IngestOutcome::NodeData;
        }

        let own_id = self.local.get(network);
        if packet.is_direct_message && is_concrete(packet.raw.receiver_raw) {
            if let Some(own) = own_id {
                if packet.raw.receiver_raw != own {
                    metrics::inc_off_target_dropped();
                    debug!(
                        "[{}] DM for {} is not ours ({}); dropped",
                        network,
                        node_label(packet.raw.receiver_raw),
                        node_label(own)
                    );
                    return IngestOutcome::OffTarget;
                }
            }
        }

        if packet.is_direct_message && self.local.is_own(network, packet.resolved_sender_id) {
            metrics::inc_self_dm_dropped();
            debug!("[{}] ignoring DM from ourselves", network);
            return IngestOutcome::SelfDirectMessage;
        }

        if packet.resolution == Resolution::Unresolved {
            metrics::inc_unresolved_senders();
        }

        info!(
            "[{}] {} from {} ({:?}): '{}'",
            network,
            if packet.is_direct_message { "DM" } else { "broadcast" },
            node_label(packet.resolved_sender_id),
            packet.resolution,
            escape_log(&truncate_for_log(&packet.display_text, 120))
        );

        if packet.sender_resolved() && !self.local.is_own(network, packet.resolved_sender_id) {
            let heard = self.heard_counter.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut conversations) = self.conversations.lock() {
                conversations.insert(
                    (network, packet.resolved_sender_id),
                    Conversation {
                        network,
                        key_prefix: packet.raw.key_prefix,
                        heard,
                    },
                );
            }
        }

        let Some(reply) = self.handler.handle(&packet).await else {
            return IngestOutcome::Handled;
        };
        self.dispatch_reply(port, &packet, reply)
    }

    fn dispatch_reply(&self, port: &NetworkPort, packet: &ResolvedPacket, reply: Reply) -> IngestOutcome {
        let network = packet.network();
        let direct = match reply.route {
            ReplyRoute::Mirror => packet.is_direct_message,
            ReplyRoute::Direct => true,
            ReplyRoute::Channel(_) => false,
        };
        let destination = if direct {
            if !packet.sender_resolved() {
                metrics::inc_replies_dropped();
                warn!(
                    "[{}] reply to unresolved sender dropped: '{}'",
                    network,
                    escape_log(&truncate_for_log(&reply.text, 80))
                );
                return IngestOutcome::ReplyDropped;
            }
            Destination::Direct(DirectTarget {
                node_id: packet.resolved_sender_id,
                key_prefix: packet
                    .raw
                    .key_prefix
                    .or_else(|| self.key_prefix_of(network, packet.resolved_sender_id)),
            })
        } else {
            let channel = match reply.route {
                ReplyRoute::Channel(ch) => ch,
                _ => packet.raw.channel,
            };
            Destination::Broadcast { channel }
        };
        self.enqueue(
            &port.outbound,
            OutboundMessage {
                network,
                destination,
                text: reply.text,
            },
        );
        IngestOutcome::ReplyQueued
    }

    fn key_prefix_of(&self, network: NetworkTag, node: NodeId) -> Option<KeyPrefix> {
        let remembered = self
            .conversations
            .lock()
            .ok()
            .and_then(|c| c.get(&(network, node)).and_then(|conv| conv.key_prefix));
        remembered.or_else(|| {
            self.resolver
                .store()
                .lookup_by_node_id(network, node)
                .ok()
                .flatten()
                .and_then(|rec| rec.public_key_prefix)
        })
    }

    fn enqueue(&self, outbound: &OutboundHandle, msg: OutboundMessage) {
        let label = match &msg.destination {
            Destination::Direct(t) => node_label(t.node_id),
            Destination::Broadcast { channel } => format!("channel {}", channel),
        };
        let network = msg.network;
        outbound.enqueue(
            msg,
            Box::new(move |outcome| match outcome {
                SendOutcome::Sent => {
                    metrics::inc_replies_sent();
                    debug!("[{}] reply to {} sent", network, label);
                }
                SendOutcome::Failed(e) => {
                    metrics::inc_replies_failed();
                    warn!("[{}] reply to {} failed: {}", network, label, e);
                }
                SendOutcome::Dropped(why) => {
                    metrics::inc_replies_dropped();
                    warn!("[{}] reply to {} dropped: {}", network, label, why);
                }
            }),
        );
    }

    /// Send a DM to `node` on the network it last used. Falls back to the most recently
    /// seen contact record for it on any configured network.
    pub fn send_to(&self, node: NodeId, text: &str) -> Result<(), RoutingError> {
        if !is_concrete(node) {
            return Err(RoutingError::UnknownRecipient(node));
        }
        let conversation = match self.latest_conversation(node) {
            Some(conv) => conv,
            None => {
                let record = self
                    .networks
                    .keys()
                    .filter_map(|network| self.resolver.store().lookup_by_node_id(*network, node).ok().flatten())
                    .max_by_key(|rec| rec.last_seen)
                    .ok_or(RoutingError::UnknownRecipient(node))?;
                Conversation {
                    network: record.network,
                    key_prefix: record.public_key_prefix,
                    heard: 0,
                }
            }
        };
        let port = self
            .networks
            .get(&conversation.network)
            .ok_or(RoutingError::NetworkNotConfigured(conversation.network))?;
        self.enqueue(
            &port.outbound,
            OutboundMessage {
                network: conversation.network,
                destination: Destination::Direct(DirectTarget {
                    node_id: node,
                    key_prefix: conversation
                        .key_prefix
                        .or_else(|| self.key_prefix_of(conversation.network, node)),
                }),
                text: text.to_string(),
            },
        );
        Ok(())
    }

    /// Broadcast on a network's channel.
    pub fn broadcast(&self, network: NetworkTag, channel: u32, text: &str) -> Result<(), RoutingError> {
        let port = self
            .networks
            .get(&network)
            .ok_or(RoutingError::NetworkNotConfigured(network))?;
        self.enqueue(
            &port.outbound,
            OutboundMessage {
                network,
                destination: Destination::Broadcast { channel },
                text: text.to_string(),
            },
        );
        Ok(())
    }

    /// Stop every network's outbound scheduler.
    pub async fn shutdown(&self) {
        for port in self.networks.values() {
            port.outbound.shutdown().await;
        }
    }
}

#[async_trait]
impl PacketSink for MessageRouter {
    async fn ingest(&self, packet: RawPacket) {
        let outcome = MessageRouter::ingest(self, packet).await;
        trace!("ingest outcome: {:?}", outcome);
    }
}
