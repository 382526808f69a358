//! # meshbridge - one bot on two radio meshes
//!
//! meshbridge connects a Meshtastic radio (the *primary* network) and a MeshCore
//! companion radio (the *companion* network) to a single bot. Packets from both are
//! deduplicated, their senders identified, and handed to a command handler; replies go
//! back out on the network they came from.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshbridge::bot::BridgeBot;
//! use meshbridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut bot = BridgeBot::new(config)?;
//!     bot.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - byte links, stream framers and the two radio protocols
//! - [`supervisor`] - per-lane connection health and reconnection
//! - [`router`] - lane arbitration, outbound scheduling and packet routing
//! - [`dedup`] - retransmission filter
//! - [`identity`] - sender resolution and the contact book
//! - [`bot`] - default commands and process assembly
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ primary lane │   │companion lane│ ← ConnectionSupervisor (one per transport)
//! └──────┬───────┘   └──────┬───────┘
//!        └────────┬─────────┘
//!        ┌────────▼────────┐
//!        │  MessageRouter  │ ← dedup, identity, classification
//!        └────────┬────────┘
//!        ┌────────▼────────┐
//!        │ CommandHandler  │
//!        └────────┬────────┘
//!        ┌────────▼────────┐
//!        │ outbound queue  │ ← per network, back through the TransportRouter
//!        └─────────────────┘
//! ```

pub mod bot;
pub mod config;
pub mod dedup;
pub mod identity;
pub mod logutil;
pub mod metrics;
pub mod packet;
pub mod protobuf;
pub mod router;
pub mod supervisor;
pub mod transport;
