//! MeshCore companion-radio frame codec.
//!
//! Frame payloads start with a one-byte code. Responses (`< 0x80`) answer a command;
//! pushes (`>= 0x80`) arrive unsolicited. Multi-byte integers are little-endian.

use crate::packet::{KeyPrefix, PayloadKind, KEY_PREFIX_LEN};
use crate::transport::TransportError;

pub mod resp {
    pub const OK: u8 = 0;
    pub const ERR: u8 = 1;
    pub const CONTACTS_START: u8 = 2;
    pub const CONTACT: u8 = 3;
    pub const END_OF_CONTACTS: u8 = 4;
    pub const SELF_INFO: u8 = 5;
    pub const SENT: u8 = 6;
    pub const CONTACT_MSG_RECV: u8 = 7;
    pub const CHANNEL_MSG_RECV: u8 = 8;
    pub const CURR_TIME: u8 = 9;
    pub const NO_MORE_MESSAGES: u8 = 10;
    pub const CONTACT_MSG_RECV_V3: u8 = 16;
    pub const CHANNEL_MSG_RECV_V3: u8 = 17;
}

pub mod push {
    pub const ADVERT: u8 = 0x80;
    pub const PATH_UPDATED: u8 = 0x81;
    pub const SEND_CONFIRMED: u8 = 0x82;
    pub const MSG_WAITING: u8 = 0x83;
}

pub mod cmd {
    pub const APP_START: u8 = 1;
    pub const SEND_TXT_MSG: u8 = 2;
    pub const SEND_CHANNEL_TXT_MSG: u8 = 3;
    pub const GET_CONTACTS: u8 = 4;
    pub const SYNC_NEXT_MESSAGE: u8 = 10;
}

/// Plain text message type.
pub const TXT_TYPE_PLAIN: u8 = 0;
/// Signed plain text: four bytes of the author's key precede the text.
pub const TXT_TYPE_SIGNED_PLAIN: u8 = 2;
/// `path_len` value meaning the message came over a direct (non-flood) route.
pub const PATH_DIRECT: u8 = 0xFF;

const PUBLIC_KEY_LEN: usize = 32;
const CONTACT_PATH_LEN: usize = 64;
const CONTACT_NAME_LEN: usize = 32;
/// Offset of the node name inside SELF_INFO, after key, position and radio parameters.
const SELF_INFO_NAME_OFFSET: usize = 58;

#[derive(Debug, Clone, PartialEq)]
pub struct SelfInfo {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub name: String,
}

impl SelfInfo {
    pub fn key_prefix(&self) -> KeyPrefix {
        let mut out = [0u8; KEY_PREFIX_LEN];
        out.copy_from_slice(&self.public_key[..KEY_PREFIX_LEN]);
        KeyPrefix(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactMessage {
    pub sender: KeyPrefix,
    pub path_len: u8,
    pub txt_type: u8,
    pub timestamp: u32,
    pub text: String,
    pub snr: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel_idx: u8,
    pub path_len: u8,
    pub txt_type: u8,
    pub timestamp: u32,
    pub text: String,
    pub snr: Option<f32>,
}

/// Hop count implied by a `path_len` byte.
pub fn hops_from_path_len(path_len: u8) -> Option<u8> {
    (path_len != PATH_DIRECT).then_some(path_len)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompanionFrame {
    Ok,
    Err(u8),
    ContactsStart(u32),
    Contact(Contact),
    EndOfContacts,
    SelfInfo(SelfInfo),
    Sent,
    ContactMessage(ContactMessage),
    ChannelMessage(ChannelMessage),
    CurrentTime(u32),
    NoMoreMessages,
    Advert([u8; PUBLIC_KEY_LEN]),
    PathUpdated([u8; PUBLIC_KEY_LEN]),
    SendConfirmed,
    MessageWaiting,
    Unknown(u8),
}

fn short(what: &str, len: usize) -> TransportError {
    TransportError::Decode(format!("{} frame too short ({} bytes)", what, len))
}

fn read_u32(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4).map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn read_key(b: &[u8], at: usize) -> Option<[u8; PUBLIC_KEY_LEN]> {
    let slice = b.get(at..at + PUBLIC_KEY_LEN)?;
    let mut key = [0u8; PUBLIC_KEY_LEN];
    key.copy_from_slice(slice);
    Some(key)
}

/// NUL-padded UTF-8 field.
fn read_name(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).trim().to_string()
}

/// Only plain and signed-plain messages are chat text; CLI data and unknown types
/// are node data.
pub fn text_payload_kind(txt_type: u8) -> PayloadKind {
    match txt_type {
        TXT_TYPE_PLAIN | TXT_TYPE_SIGNED_PLAIN => PayloadKind::Text,
        other => PayloadKind::Other(other as u32),
    }
}

fn message_text(txt_type: u8, body: &[u8]) -> String {
    let body = if txt_type == TXT_TYPE_SIGNED_PLAIN && body.len() >= 4 {
        &body[4..]
    } else {
        body
    };
    String::from_utf8_lossy(body).trim_end_matches('\0').to_string()
}

fn parse_contact_message(b: &[u8], snr: Option<f32>) -> Result<ContactMessage, TransportError> {
    // prefix(6) path_len(1) txt_type(1) timestamp(4) text
    if b.len() < KEY_PREFIX_LEN + 6 {
        return Err(short("contact message", b.len()));
    }
    let sender = KeyPrefix::from_slice(b).ok_or_else(|| short("contact message", b.len()))?;
    let path_len = b[6];
    let txt_type = b[7];
    let timestamp = read_u32(b, 8).ok_or_else(|| short("contact message", b.len()))?;
    Ok(ContactMessage {
        sender,
        path_len,
        txt_type,
        timestamp,
        text: message_text(txt_type, &b[12..]),
        snr,
    })
}

fn parse_channel_message(b: &[u8], snr: Option<f32>) -> Result<ChannelMessage, TransportError> {
    // channel_idx(1) path_len(1) txt_type(1) timestamp(4) text
    if b.len() < 7 {
        return Err(short("channel message", b.len()));
    }
    let txt_type = b[2];
    Ok(ChannelMessage {
        channel_idx: b[0],
        path_len: b[1],
        txt_type,
        timestamp: read_u32(b, 3).ok_or_else(|| short("channel message", b.len()))?,
        text: message_text(txt_type, &b[7..]),
        snr,
    })
}

/// v3 message frames carry `snr*4 (i8)` and two reserved bytes before the v1 layout.
fn split_v3(b: &[u8]) -> Result<(Option<f32>, &[u8]), TransportError> {
    if b.len() < 3 {
        return Err(short("v3 message", b.len()));
    }
    Ok((Some(b[0] as i8 as f32 / 4.0), &b[3..]))
}

pub fn parse_frame(frame: &[u8]) -> Result<CompanionFrame, TransportError> {
    let (&code, body) = frame
        .split_first()
        .ok_or_else(|| TransportError::Decode("empty companion frame".into()))?;
    let parsed = match code {
        resp::OK => CompanionFrame::Ok,
        resp::ERR => CompanionFrame::Err(body.first().copied().unwrap_or(0)),
        resp::CONTACTS_START => CompanionFrame::ContactsStart(read_u32(body, 0).unwrap_or(0)),
        resp::CONTACT => {
            let public_key = read_key(body, 0).ok_or_else(|| short("contact", frame.len()))?;
            let name_at = PUBLIC_KEY_LEN + 3 + CONTACT_PATH_LEN;
            let name = body
                .get(name_at..name_at + CONTACT_NAME_LEN)
                .map(read_name)
                .ok_or_else(|| short("contact", frame.len()))?;
            CompanionFrame::Contact(Contact { public_key, name })
        }
        resp::END_OF_CONTACTS => CompanionFrame::EndOfContacts,
        resp::SELF_INFO => {
            // adv_type, tx_power, max_tx_power precede the key
            let public_key = read_key(body, 3).ok_or_else(|| short("self info", frame.len()))?;
            let name = frame.get(SELF_INFO_NAME_OFFSET..).map(read_name).unwrap_or_default();
            CompanionFrame::SelfInfo(SelfInfo { public_key, name })
        }
        resp::SENT => CompanionFrame::Sent,
        resp::CONTACT_MSG_RECV => CompanionFrame::ContactMessage(parse_contact_message(body, None)?),
        resp::CONTACT_MSG_RECV_V3 => {
            let (snr, rest) = split_v3(body)?;
            CompanionFrame::ContactMessage(parse_contact_message(rest, snr)?)
        }
        resp::CHANNEL_MSG_RECV => CompanionFrame::ChannelMessage(parse_channel_message(body, None)?),
        resp::CHANNEL_MSG_RECV_V3 => {
            let (snr, rest) = split_v3(body)?;
            CompanionFrame::ChannelMessage(parse_channel_message(rest, snr)?)
        }
        resp::CURR_TIME => CompanionFrame::CurrentTime(read_u32(body, 0).unwrap_or(0)),
        resp::NO_MORE_MESSAGES => CompanionFrame::NoMoreMessages,
        push::ADVERT => CompanionFrame::Advert(read_key(body, 0).ok_or_else(|| short("advert", frame.len()))?),
        push::PATH_UPDATED => {
            CompanionFrame::PathUpdated(read_key(body, 0).ok_or_else(|| short("path update", frame.len()))?)
        }
        push::SEND_CONFIRMED => CompanionFrame::SendConfirmed,
        push::MSG_WAITING => CompanionFrame::MessageWaiting,
        other => CompanionFrame::Unknown(other),
    };
    Ok(parsed)
}

pub fn encode_app_start(app_name: &str) -> Vec<u8> {
    let mut out = vec![cmd::APP_START, 1];
    out.extend_from_slice(&[0u8; 6]);
    out.extend_from_slice(app_name.as_bytes());
    out
}

pub fn encode_get_contacts() -> Vec<u8> {
    vec![cmd::GET_CONTACTS]
}

pub fn encode_sync_next() -> Vec<u8> {
    vec![cmd::SYNC_NEXT_MESSAGE]
}

pub fn encode_send_text(to: &KeyPrefix, text: &str, timestamp: u32) -> Vec<u8> {
    let mut out = vec![cmd::SEND_TXT_MSG, TXT_TYPE_PLAIN, 0];
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(to.as_bytes());
    out.extend_from_slice(text.as_bytes());
    out
}

pub fn encode_send_channel_text(channel_idx: u8, text: &str, timestamp: u32) -> Vec<u8> {
    let mut out = vec![cmd::SEND_CHANNEL_TXT_MSG, TXT_TYPE_PLAIN, channel_idx];
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out
}
