//! Meshtastic wire messages.
//!
//! Only the handful of `meshtastic.proto` messages the primary transport touches are
//! declared here, with field tags matching the upstream definitions. `oneof` variants are
//! modelled as independent optional fields; the encoding is identical on the wire and a
//! well-formed radio only ever sets one of them.

/// Port numbers of the application payloads we recognise.
pub mod port {
    pub const TEXT_MESSAGE: i32 = 1;
    pub const POSITION: i32 = 3;
    pub const NODEINFO: i32 = 4;
    pub const ROUTING: i32 = 5;
    pub const TELEMETRY: i32 = 67;
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    /// `payload_variant.decoded`. Encrypted packets leave this unset.
    #[prost(message, optional, tag = "4")]
    pub decoded: Option<Data>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "11")]
    pub priority: i32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(message, optional, tag = "2")]
    pub packet: Option<MeshPacket>,
    #[prost(message, optional, tag = "3")]
    pub my_info: Option<MyNodeInfo>,
    #[prost(message, optional, tag = "4")]
    pub node_info: Option<NodeInfo>,
    #[prost(uint32, optional, tag = "7")]
    pub config_complete_id: Option<u32>,
    #[prost(bool, optional, tag = "8")]
    pub rebooted: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ToRadio {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(uint32, optional, tag = "3")]
    pub want_config_id: Option<u32>,
    #[prost(bool, optional, tag = "4")]
    pub disconnect: Option<bool>,
    #[prost(message, optional, tag = "7")]
    pub heartbeat: Option<Heartbeat>,
}
