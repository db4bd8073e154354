//! Protocol message types
//!
//! Shared by the decoder, the frame writer and the session layer.
//! All integers are little-endian on the wire with no padding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the fixed header preceding every frame
pub const BASE_MESSAGE_SIZE: usize = 26;

/// Size of an encoded [`Timestamp`]
pub const TIMESTAMP_SIZE: usize = 8;

/// Size of the fixed part of a wire chunk (timestamp + chunk size)
pub const WIRE_CHUNK_HEADER_SIZE: usize = TIMESTAMP_SIZE + 4;

/// Seconds/microseconds pair as carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i32,
    pub usec: i32,
}

impl Timestamp {
    pub const fn new(sec: i32, usec: i32) -> Self {
        Self { sec, usec }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_micros(chrono::Utc::now().timestamp_micros())
    }

    pub fn from_micros(micros: i64) -> Self {
        Self {
            sec: micros.div_euclid(1_000_000) as i32,
            usec: micros.rem_euclid(1_000_000) as i32,
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }

    pub fn from_le_bytes(bytes: [u8; TIMESTAMP_SIZE]) -> Self {
        Self {
            sec: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            usec: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_le_bytes(&self) -> [u8; TIMESTAMP_SIZE] {
        let mut out = [0u8; TIMESTAMP_SIZE];
        out[..4].copy_from_slice(&self.sec.to_le_bytes());
        out[4..].copy_from_slice(&self.usec.to_le_bytes());
        out
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Base,
    CodecHeader,
    WireChunk,
    ServerSettings,
    Time,
    Hello,
    StreamTags,
    ClientInfo,
    Unknown(u16),
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Base,
            1 => Self::CodecHeader,
            2 => Self::WireChunk,
            3 => Self::ServerSettings,
            4 => Self::Time,
            5 => Self::Hello,
            6 => Self::StreamTags,
            7 => Self::ClientInfo,
            other => Self::Unknown(other),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Base => 0,
            MessageType::CodecHeader => 1,
            MessageType::WireChunk => 2,
            MessageType::ServerSettings => 3,
            MessageType::Time => 4,
            MessageType::Hello => 5,
            MessageType::StreamTags => 6,
            MessageType::ClientInfo => 7,
            MessageType::Unknown(other) => other,
        }
    }
}

/// Header preceding every frame.
///
/// `size` is the length of the typed payload that follows. When produced by
/// the decoder, `received` holds the local arrival time rather than the value
/// found on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseMessage {
    pub message_type: MessageType,
    pub id: u16,
    pub refers_to: u16,
    pub sent: Timestamp,
    pub received: Timestamp,
    pub size: u32,
}

impl BaseMessage {
    pub fn new(message_type: MessageType, id: u16, size: u32) -> Self {
        Self {
            message_type,
            id,
            refers_to: 0,
            sent: Timestamp::default(),
            received: Timestamp::default(),
            size,
        }
    }

    pub fn from_le_bytes(bytes: &[u8; BASE_MESSAGE_SIZE]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let timestamp_at = |at: usize| {
            let mut raw = [0u8; TIMESTAMP_SIZE];
            raw.copy_from_slice(&bytes[at..at + TIMESTAMP_SIZE]);
            Timestamp::from_le_bytes(raw)
        };

        Self {
            message_type: MessageType::from(u16_at(0)),
            id: u16_at(2),
            refers_to: u16_at(4),
            sent: timestamp_at(6),
            received: timestamp_at(14),
            size: u32::from_le_bytes([bytes[22], bytes[23], bytes[24], bytes[25]]),
        }
    }

    pub fn to_le_bytes(&self) -> [u8; BASE_MESSAGE_SIZE] {
        let mut out = [0u8; BASE_MESSAGE_SIZE];
        out[0..2].copy_from_slice(&u16::from(self.message_type).to_le_bytes());
        out[2..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..6].copy_from_slice(&self.refers_to.to_le_bytes());
        out[6..14].copy_from_slice(&self.sent.to_le_bytes());
        out[14..22].copy_from_slice(&self.received.to_le_bytes());
        out[22..26].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Audio codecs the receiver can demux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Pcm,
    Flac,
    Opus,
}

impl Codec {
    /// Match the codec name announced in a codec header
    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"pcm" => Some(Self::Pcm),
            b"flac" => Some(Self::Flac),
            b"opus" => Some(Self::Opus),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Flac => "flac",
            Self::Opus => "opus",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Codec state of a connection, kept until the next codec header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecContext {
    pub received_codec_header: bool,
    pub codec: Option<Codec>,
}

impl CodecContext {
    /// Codec to demux wire chunks with, if a complete header was seen
    pub fn active(&self) -> Option<Codec> {
        if self.received_codec_header {
            self.codec
        } else {
            None
        }
    }
}

/// Metadata of a decoded wire chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireChunkMeta {
    /// Server time at which the first sample should play
    pub timestamp: Timestamp,
    /// Payload size announced on the wire
    pub size: u32,
    pub codec: Codec,
}

/// Typed view of the server settings JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// End-to-end buffer the server plays ahead with
    #[serde(default)]
    pub buffer_ms: i32,
    /// Additional client latency requested by the user
    #[serde(default)]
    pub latency: i32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_volume")]
    pub volume: u8,
}

fn default_volume() -> u8 {
    100
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            buffer_ms: 1000,
            latency: 0,
            muted: false,
            volume: default_volume(),
        }
    }
}

/// Greeting the client sends right after connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hello {
    pub arch: String,
    pub client_name: String,
    pub host_name: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub instance: u32,
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "OS")]
    pub os: String,
    pub snap_stream_protocol_version: u32,
    pub version: String,
}

impl Hello {
    pub fn new(client_name: &str, id: &str, instance: u32) -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            client_name: client_name.to_string(),
            host_name: client_name.to_string(),
            id: id.to_string(),
            instance,
            mac: "00:00:00:00:00:00".to_string(),
            os: std::env::consts::OS.to_string(),
            snap_stream_protocol_version: 2,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
