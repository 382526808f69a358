//! Length-prefixed stream framers for radio links.
//!
//! Both radio families wrap each message in a short header on serial and TCP links:
//!
//!   primary:    `0x94 0xC3 <len u16 BE> <protobuf bytes>`
//!   companion:  `'>' <len u16 LE> <payload>` from the radio, `'<' ...` towards it
//!
//! The framer is fed arbitrary chunks and yields whole frames. Anything that is not a
//! header (boot logs, debug text) is skipped while resynchronizing.
use bytes::{Buf, BytesMut};

use super::TransportError;

/// Largest frame either firmware emits.
pub const MAX_FRAME_SIZE: usize = 512;

const MESHTASTIC_START: [u8; 2] = [0x94, 0xC3];
const COMPANION_FROM_RADIO: u8 = b'>';
const COMPANION_TO_RADIO: u8 = b'<';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Meshtastic,
    Companion,
}

impl FrameFormat {
    fn header_len(self) -> usize {
        match self {
            FrameFormat::Meshtastic => 4,
            FrameFormat::Companion => 3,
        }
    }

    fn is_start(self, buf: &[u8]) -> bool {
        match self {
            FrameFormat::Meshtastic => buf.len() >= 2 && buf[..2] == MESHTASTIC_START,
            FrameFormat::Companion => buf.first() == Some(&COMPANION_FROM_RADIO),
        }
    }

    fn declared_len(self, header: &[u8]) -> usize {
        match self {
            FrameFormat::Meshtastic => u16::from_be_bytes([header[2], header[3]]) as usize,
            FrameFormat::Companion => u16::from_le_bytes([header[1], header[2]]) as usize,
        }
    }

    fn first_start_byte(self) -> u8 {
        match self {
            FrameFormat::Meshtastic => MESHTASTIC_START[0],
            FrameFormat::Companion => COMPANION_FROM_RADIO,
        }
    }
}

pub struct StreamFramer {
    format: FrameFormat,
    buf: BytesMut,
    skipped: usize,
}

impl StreamFramer {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            buf: BytesMut::with_capacity(2048),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while hunting for a header since the last call.
    pub fn take_skipped(&mut self) -> usize {
        std::mem::take(&mut self.skipped)
    }

    /// Next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let header_len = self.format.header_len();
        loop {
            if self.buf.is_empty() {
                return None;
            }
            if !self.format.is_start(&self.buf) {
                // Need the second magic byte before deciding on a lone 0x94
                if self.format == FrameFormat::Meshtastic && self.buf.len() == 1 && self.buf[0] == MESHTASTIC_START[0] {
                    return None;
                }
                let skip = self.buf[1..]
                    .iter()
                    .position(|&b| b == self.format.first_start_byte())
                    .map(|p| p + 1)
                    .unwrap_or(self.buf.len());
                self.buf.advance(skip);
                self.skipped += skip;
                continue;
            }
            if self.buf.len() < header_len {
                return None;
            }
            let len = self.format.declared_len(&self.buf[..header_len]);
            if len == 0 || len > MAX_FRAME_SIZE {
                self.buf.advance(1);
                self.skipped += 1;
                continue;
            }
            if self.buf.len() < header_len + len {
                return None;
            }
            self.buf.advance(header_len);
            return Some(self.buf.split_to(len).to_vec());
        }
    }
}

/// Wrap a payload for transmission to the radio.
pub fn encode_frame(format: FrameFormat, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Decode(format!(
            "outbound frame of {} bytes exceeds {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(payload.len() + 4);
    match format {
        FrameFormat::Meshtastic => {
            out.extend_from_slice(&MESHTASTIC_START);
            out.extend_from_slice(&len.to_be_bytes());
        }
        FrameFormat::Companion => {
            out.push(COMPANION_TO_RADIO);
            out.extend_from_slice(&len.to_le_bytes());
        }
    }
    out.extend_from_slice(payload);
    Ok(out)
}
