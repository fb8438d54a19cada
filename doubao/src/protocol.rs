//! Binary framing protocol for the realtime dialogue service.
//!
//! Wire format:
//! - Header (4 bytes):
//!   - (4bits) version + (4bits) header_size (in 4-byte units)
//!   - (4bits) message_type + (4bits) flags
//!   - (4bits) serialization + (4bits) compression
//!   - (8bits) reserved
//!
//! - Client frames: [optional event (4 bytes)] [optional session_id
//!   (4-byte len + data)] payload_size (4 bytes) + payload
//! - Server frames: [optional sequence] [optional event] session_id len
//!   (may be zero) + data, payload_size + payload
//! - Error frames: error_code (4 bytes) + payload_size + payload
//!
//! Decoding is total: malformed input yields `None`, never a panic, so the
//! read loop can skip unusable frames.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;

use crate::error::Result;

// ================== Protocol Constants ==================

/// Protocol version (high nibble of byte 0).
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Message type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    FullClient = 0b0001,
    AudioOnlyClient = 0b0010,
    FullServer = 0b1001,
    ServerAck = 0b1011,
    Error = 0b1111,
}

impl MessageType {
    /// Maps a header nibble to a message type. Unknown nibbles have no
    /// representation and the whole frame is discarded.
    pub fn from_bits(v: u8) -> Option<MessageType> {
        match v {
            0b0001 => Some(MessageType::FullClient),
            0b0010 => Some(MessageType::AudioOnlyClient),
            0b1001 => Some(MessageType::FullServer),
            0b1011 => Some(MessageType::ServerAck),
            0b1111 => Some(MessageType::Error),
            _ => None,
        }
    }

    /// Returns true for the server-originated types.
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            MessageType::FullServer | MessageType::ServerAck | MessageType::Error
        )
    }
}

/// Message flags. A bitfield, not mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub const NONE: Flags = Flags(0b0000);
    /// Positive sequence number present.
    pub const POS_SEQUENCE: Flags = Flags(0b0001);
    /// Negative sequence present; doubles as the audio tail marker.
    pub const NEG_SEQUENCE: Flags = Flags(0b0010);
    /// Event code present.
    pub const WITH_EVENT: Flags = Flags(0b0100);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    /// Either sequence bit set.
    pub fn has_sequence(self) -> bool {
        self.0 & (Self::POS_SEQUENCE.0 | Self::NEG_SEQUENCE.0) != 0
    }
}

/// Serialization type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serialization {
    #[default]
    None = 0b0000,
    Json = 0b0001,
}

impl From<u8> for Serialization {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => Serialization::Json,
            _ => Serialization::None,
        }
    }
}

/// Compression type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None = 0b0000,
    Gzip = 0b0001,
}

impl From<u8> for Compression {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// Protocol event codes.
pub mod events {
    pub const START_CONNECTION: i32 = 1;
    pub const FINISH_CONNECTION: i32 = 2;
    pub const CONNECTION_STARTED: i32 = 50;
    pub const CONNECTION_FAILED: i32 = 51;

    pub const START_SESSION: i32 = 100;
    pub const FINISH_SESSION: i32 = 102;
    pub const SESSION_STARTED: i32 = 150;
    pub const SESSION_FAILED: i32 = 153;

    pub const TASK_REQUEST: i32 = 200;
    pub const SAY_HELLO: i32 = 300;
    pub const SESSION_INTERRUPTED: i32 = 450;
    pub const CHAT_TEXT_QUERY: i32 = 501;
}

/// Size of the zero payload carried by the audio tail frame.
pub const AUDIO_TAIL_BYTES: usize = 320;

// ================== Frame ==================

/// Decoded payload of one frame, narrowed once at the protocol boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON document (usually an object).
    Json(serde_json::Value),
    /// Raw bytes, e.g. synthesized audio.
    Bytes(Vec<u8>),
    /// UTF-8 text that did not parse as JSON.
    Text(String),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bytes(Vec::new())
    }
}

impl Payload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Renders the payload as human-readable text for error reporting.
    pub fn display_text(&self) -> String {
        match self {
            Payload::Json(v) => v.to_string(),
            Payload::Text(s) => s.clone(),
            Payload::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    fn to_wire(&self, serialization: Serialization) -> Result<Vec<u8>> {
        match (self, serialization) {
            (Payload::Json(v), Serialization::Json) => Ok(serde_json::to_vec(v)?),
            (Payload::Json(v), Serialization::None) => Ok(serde_json::to_vec(v)?),
            (Payload::Text(s), _) => Ok(s.as_bytes().to_vec()),
            (Payload::Bytes(b), _) => Ok(b.clone()),
        }
    }
}

/// One message of the binary envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub header_size: u8,
    pub msg_type: MessageType,
    pub flags: Flags,
    pub serialization: Serialization,
    pub compression: Compression,
    pub event: Option<i32>,
    pub sequence: Option<i32>,
    pub session_id: Option<String>,
    pub error_code: Option<u32>,
    pub payload: Payload,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header_size: 1,
            msg_type: MessageType::FullClient,
            flags: Flags::NONE,
            serialization: Serialization::Json,
            compression: Compression::None,
            event: None,
            sequence: None,
            session_id: None,
            error_code: None,
            payload: Payload::default(),
        }
    }
}

impl Frame {
    /// Full-client frame carrying an event code and a JSON body.
    pub fn client_event(
        event: i32,
        session_id: Option<&str>,
        body: serde_json::Value,
    ) -> Frame {
        Frame {
            msg_type: MessageType::FullClient,
            flags: Flags::WITH_EVENT,
            serialization: Serialization::Json,
            compression: Compression::Gzip,
            event: Some(event),
            session_id: session_id.map(str::to_string),
            payload: Payload::Json(body),
            ..Default::default()
        }
    }

    /// Audio-only frame for one chunk of input audio.
    pub fn audio_chunk(session_id: &str, audio: Vec<u8>) -> Frame {
        Frame {
            msg_type: MessageType::AudioOnlyClient,
            flags: Flags::WITH_EVENT,
            serialization: Serialization::None,
            compression: Compression::Gzip,
            event: Some(events::TASK_REQUEST),
            session_id: Some(session_id.to_string()),
            payload: Payload::Bytes(audio),
            ..Default::default()
        }
    }

    /// Audio tail marker: the negative-sequence bit with a zero payload
    /// tells the service no further input audio follows.
    pub fn audio_tail() -> Frame {
        Frame {
            msg_type: MessageType::AudioOnlyClient,
            flags: Flags::NEG_SEQUENCE,
            serialization: Serialization::None,
            compression: Compression::Gzip,
            payload: Payload::Bytes(vec![0u8; AUDIO_TAIL_BYTES]),
            ..Default::default()
        }
    }
}

// ================== Encode ==================

/// Encodes a frame to wire bytes. Client types use the client field layout;
/// server types mirror the decode layout so round trips hold.
pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(256);

    let header_size = frame.header_size.max(1);
    buf.put_u8((frame.version << 4) | (header_size & 0x0f));
    buf.put_u8(((frame.msg_type as u8) << 4) | (frame.flags.bits() & 0x0f));
    buf.put_u8(((frame.serialization as u8) << 4) | (frame.compression as u8));
    buf.put_u8(0x00); // reserved

    // Extra header words are reserved and zero.
    for _ in 1..header_size {
        buf.put_u32(0);
    }

    match frame.msg_type {
        MessageType::FullServer | MessageType::ServerAck => {
            if frame.flags.has_sequence() {
                buf.put_i32(frame.sequence.unwrap_or(0));
            }
            if frame.flags.contains(Flags::WITH_EVENT) {
                buf.put_i32(frame.event.unwrap_or(0));
            }
            let sid = frame.session_id.as_deref().unwrap_or("");
            buf.put_i32(sid.len() as i32);
            buf.put_slice(sid.as_bytes());
        }
        MessageType::Error => {
            buf.put_u32(frame.error_code.unwrap_or(0));
        }
        MessageType::FullClient | MessageType::AudioOnlyClient => {
            if frame.flags.contains(Flags::WITH_EVENT) {
                buf.put_u32(frame.event.unwrap_or(0) as u32);
            }
            if let Some(sid) = &frame.session_id {
                buf.put_i32(sid.len() as i32);
                buf.put_slice(sid.as_bytes());
            }
        }
    }

    let mut payload = frame.payload.to_wire(frame.serialization)?;
    if frame.compression == Compression::Gzip && !payload.is_empty() {
        payload = gzip_compress(&payload)?;
    }
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.to_vec())
}

// ================== Decode ==================

/// Decodes one server frame. Returns `None` for truncated input, unknown
/// message types, and client frames; never panics and never fails.
pub fn decode(data: &[u8]) -> Option<Frame> {
    let mut r = Reader::new(data);

    let b0 = r.u8()?;
    let b1 = r.u8()?;
    let b2 = r.u8()?;
    let _reserved = r.u8()?;

    let version = b0 >> 4;
    let header_size = (b0 & 0x0f).max(1);
    let msg_type = MessageType::from_bits(b1 >> 4)?;
    let flags = Flags(b1 & 0x0f);
    let serialization = Serialization::from(b2 >> 4);
    let compression = Compression::from(b2 & 0x0f);

    // The payload offset honors the declared header size even when it is
    // larger than the one word we define.
    r.skip((header_size as usize - 1) * 4)?;

    let mut frame = Frame {
        version,
        header_size,
        msg_type,
        flags,
        serialization,
        compression,
        ..Default::default()
    };

    match msg_type {
        MessageType::FullServer | MessageType::ServerAck => {
            if flags.has_sequence() {
                frame.sequence = Some(r.i32()?);
            }
            if flags.contains(Flags::WITH_EVENT) {
                frame.event = Some(r.i32()?);
            }
            let sid_len = r.i32()?;
            if sid_len > 0 {
                let raw = r.take(sid_len as usize)?;
                frame.session_id = Some(String::from_utf8_lossy(raw).into_owned());
            }
            frame.payload = read_payload(&mut r, serialization, compression)?;
        }
        MessageType::Error => {
            frame.error_code = Some(r.u32()?);
            frame.payload = read_payload(&mut r, serialization, compression)?;
        }
        MessageType::FullClient | MessageType::AudioOnlyClient => return None,
    }

    Some(frame)
}

fn read_payload(r: &mut Reader, serialization: Serialization, compression: Compression) -> Option<Payload> {
    let len = r.u32()? as usize;
    let raw = r.take(len)?.to_vec();

    // A gzip bit on an uncompressed payload surfaces the raw bytes rather
    // than failing the frame.
    let raw = if compression == Compression::Gzip {
        gzip_decompress(&raw).unwrap_or(raw)
    } else {
        raw
    };

    Some(match serialization {
        Serialization::Json => match serde_json::from_slice(&raw) {
            Ok(v) => Payload::Json(v),
            Err(_) => Payload::Text(String::from_utf8_lossy(&raw).into_owned()),
        },
        Serialization::None => Payload::Bytes(raw),
    })
}

/// Bounds-checked big-endian reads over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u32(&mut self) -> Option<u32> {
        let raw = self.take(4)?;
        Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

// ================== Gzip ==================

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

// ================== Client-side decode (test support) ==================

/// Decodes a client frame the way the dialogue service would. Only used by
/// mock upstream servers in tests; production decode handles server frames.
#[cfg(test)]
pub(crate) fn decode_client(data: &[u8]) -> Option<Frame> {
    let mut r = Reader::new(data);

    let b0 = r.u8()?;
    let b1 = r.u8()?;
    let b2 = r.u8()?;
    let _reserved = r.u8()?;

    let header_size = (b0 & 0x0f).max(1);
    let msg_type = MessageType::from_bits(b1 >> 4)?;
    if msg_type.is_server() {
        return None;
    }
    let flags = Flags(b1 & 0x0f);
    let serialization = Serialization::from(b2 >> 4);
    let compression = Compression::from(b2 & 0x0f);
    r.skip((header_size as usize - 1) * 4)?;

    let mut frame = Frame {
        version: b0 >> 4,
        header_size,
        msg_type,
        flags,
        serialization,
        compression,
        ..Default::default()
    };

    if flags.contains(Flags::WITH_EVENT) {
        let event = r.i32()?;
        frame.event = Some(event);
        // Connection-level events carry no session id.
        let connection_event = matches!(
            event,
            events::START_CONNECTION
                | events::FINISH_CONNECTION
                | events::CONNECTION_STARTED
                | events::CONNECTION_FAILED
        );
        if !connection_event {
            let sid_len = r.i32()?;
            if sid_len > 0 {
                let raw = r.take(sid_len as usize)?;
                frame.session_id = Some(String::from_utf8_lossy(raw).into_owned());
            }
        }
    }

    frame.payload = read_payload(&mut r, serialization, compression)?;
    Some(frame)
}
