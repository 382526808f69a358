//! Per-network lane arbitration.
//!
//! A network is reached through one or two supervised lanes. Exactly one of them owns
//! the read loop; the other, if any, only sends. Which lane performs a send depends on
//! what the transports advertise:
//!
//! | operation        | preferred lane           | fallback                          |
//! |------------------|--------------------------|-----------------------------------|
//! | `send_broadcast` | `raw_frames`             | any other connected lane          |
//! | `send_direct`    | `direct_addressing`      | only a lane that also addresses   |

use log::debug;
use std::sync::Arc;

use crate::packet::NetworkTag;
use crate::supervisor::{ConnectionSupervisor, SupervisorRole};
use crate::transport::{Capabilities, DirectTarget, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("invalid lane setup for {network} network: {reason}")]
    InvalidLanes { network: NetworkTag, reason: String },
    #[error("no connected lane on {network} network can {op}")]
    NoConnectedLane { network: NetworkTag, op: &'static str },
    #[error("no known network for node {0:08x}")]
    UnknownRecipient(u32),
    #[error("no {0} network configured")]
    NetworkNotConfigured(NetworkTag),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Broadcast,
    Direct,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Broadcast => "broadcast",
            Operation::Direct => "send direct messages",
        }
    }

    fn prefers(&self, caps: Capabilities) -> bool {
        match self {
            Operation::Broadcast => caps.raw_frames,
            Operation::Direct => caps.direct_addressing,
        }
    }

    fn supports(&self, caps: Capabilities) -> bool {
        match self {
            Operation::Broadcast => true,
            Operation::Direct => caps.direct_addressing,
        }
    }
}

/// Index of the lane that should own the read loop: the one decoding the most identity.
pub fn choose_reader(lanes: &[Capabilities]) -> Option<usize> {
    lanes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.decode)
        .max_by_key(|(i, c)| (c.direct_addressing, std::cmp::Reverse(*i)))
        .map(|(i, _)| i)
}

pub struct TransportRouter {
    network: NetworkTag,
    reader: ConnectionSupervisor,
    send_only: Option<ConnectionSupervisor>,
}

impl TransportRouter {
    /// Fix lane roles. The reader must be `ReadWrite` and decode packets; a second lane
    /// must be `SendOnly`. Both must belong to `network`.
    pub fn new(
        network: NetworkTag,
        reader: ConnectionSupervisor,
        send_only: Option<ConnectionSupervisor>,
    ) -> Result<Self, RoutingError> {
        let invalid = |reason: String| RoutingError::InvalidLanes { network, reason };
        if reader.network() != network {
            return Err(invalid(format!("lane '{}' belongs to {}", reader.name(), reader.network())));
        }
        if reader.role() != SupervisorRole::ReadWrite {
            return Err(invalid(format!("lane '{}' is not a reader", reader.name())));
        }
        if !reader.capabilities().decode {
            return Err(invalid(format!("lane '{}' cannot decode packets", reader.name())));
        }
        if let Some(other) = &send_only {
            if other.network() != network {
                return Err(invalid(format!("lane '{}' belongs to {}", other.name(), other.network())));
            }
            if other.role() != SupervisorRole::SendOnly {
                return Err(invalid(format!(
                    "lane '{}' would be a second reader; it must be send-only",
                    other.name()
                )));
            }
        }
        Ok(Self {
            network,
            reader,
            send_only,
        })
    }

    pub fn network(&self) -> NetworkTag {
        self.network
    }

    pub fn read_owner(&self) -> &ConnectionSupervisor {
        &self.reader
    }

    pub fn lanes(&self) -> impl Iterator<Item = &ConnectionSupervisor> {
        std::iter::once(&self.reader).chain(self.send_only.iter())
    }

    /// Lane that would carry `op` right now, if any.
    pub fn select_lane(&self, op: Operation) -> Option<&ConnectionSupervisor> {
        let Some(other) = &self.send_only else {
            return self.reader.is_connected().then_some(&self.reader);
        };
        let (preferred, fallback) = if op.prefers(other.capabilities()) && !op.prefers(self.reader.capabilities()) {
            (other, &self.reader)
        } else {
            (&self.reader, other)
        };
        if preferred.is_connected() && op.supports(preferred.capabilities()) {
            return Some(preferred);
        }
        if fallback.is_connected() && op.supports(fallback.capabilities()) {
            debug!(
                "[{}] preferred lane '{}' unavailable; using '{}'",
                self.network,
                preferred.name(),
                fallback.name()
            );
            return Some(fallback);
        }
        None
    }

    fn transport_for(&self, op: Operation) -> Result<(&ConnectionSupervisor, Arc<dyn Transport>), RoutingError> {
        self.select_lane(op)
            .and_then(|lane| lane.current().map(|transport| (lane, transport)))
            .ok_or(RoutingError::NoConnectedLane {
                network: self.network,
                op: op.as_str(),
            })
    }

    pub async fn send_broadcast(&self, channel: u32, text: &str) -> Result<(), RoutingError> {
        let (lane, transport) = self.transport_for(Operation::Broadcast)?;
        if let Err(e) = transport.send_broadcast(channel, text).await {
            lane.on_write_failed(&transport, &e);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn send_direct(&self, target: &DirectTarget, text: &str) -> Result<(), RoutingError> {
        let (lane, transport) = self.transport_for(Operation::Direct)?;
        if let Err(e) = transport.send_direct(target, text).await {
            lane.on_write_failed(&transport, &e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Capabilities = Capabilities {
        raw_frames: true,
        decode: true,
        direct_addressing: false,
    };
    const CLIENT: Capabilities = Capabilities {
        raw_frames: false,
        decode: true,
        direct_addressing: true,
    };
    const WRITER: Capabilities = Capabilities {
        raw_frames: true,
        decode: false,
        direct_addressing: false,
    };

    #[test]
    fn reader_is_the_richer_decoder() {
        assert_eq!(choose_reader(&[FRAME, CLIENT]), Some(1));
        assert_eq!(choose_reader(&[CLIENT, FRAME]), Some(0));
        assert_eq!(choose_reader(&[FRAME]), Some(0));
        assert_eq!(choose_reader(&[WRITER, FRAME]), Some(1));
        assert_eq!(choose_reader(&[WRITER]), None);
    }

    #[test]
    fn direct_requires_addressing() {
        assert!(!Operation::Direct.supports(FRAME));
        assert!(Operation::Direct.supports(CLIENT));
        assert!(Operation::Broadcast.supports(CLIENT));
        assert!(Operation::Broadcast.prefers(FRAME));
    }
}
