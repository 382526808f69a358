//! Bot process: default command handling and the assembly of lanes, routers and
//! background tasks.

pub mod commands;
pub mod server;

pub use commands::{BuiltinCommands, LoggingNodeDatabase};
pub use server::{lanes_from_config, BotError, BridgeBot, LaneReport, LaneSpec};
