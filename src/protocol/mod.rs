//! Wire protocol
//!
//! Every frame is a fixed 26-byte [`BaseMessage`] header followed by
//! `size` bytes of typed payload. All integers are little-endian.
//!
//! | type | payload |
//! |------|---------|
//! | CodecHeader | u32 name length, name, u32 header length, header |
//! | WireChunk | timestamp (8), u32 size, samples |
//! | ServerSettings | u32 length, JSON |
//! | Time | latency timestamp (8) |
//! | Hello | u32 length, JSON (client to server) |

pub mod decoder;
pub mod encode;
pub(crate) mod fields;
pub mod message;

pub use decoder::{DecodeEvent, Decoder, DecoderState, DecoderStats, Phase};
pub use encode::FrameWriter;
pub use fields::shuffle_pcm_word;
pub use message::{
    BaseMessage, Codec, CodecContext, Hello, MessageType, ServerSettings, Timestamp,
    WireChunkMeta, BASE_MESSAGE_SIZE, TIMESTAMP_SIZE, WIRE_CHUNK_HEADER_SIZE,
};
