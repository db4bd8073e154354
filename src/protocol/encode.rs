//! Frame writer
//!
//! Serializes frames in the wire layout the decoder reads. The client uses
//! it for its own requests (hello, time); tests and benches use it to build
//! server traffic.

use bytes::{BufMut, Bytes, BytesMut};

use super::message::{
    BaseMessage, Hello, MessageType, Timestamp, BASE_MESSAGE_SIZE, WIRE_CHUNK_HEADER_SIZE,
};

/// Header plus payload; `size` is taken from the payload length
pub fn encode_frame(base: &BaseMessage, payload: &[u8]) -> Bytes {
    let mut header = *base;
    header.size = payload.len() as u32;

    let mut buf = BytesMut::with_capacity(BASE_MESSAGE_SIZE + payload.len());
    buf.put_slice(&header.to_le_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Length-prefixed byte string
fn put_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn codec_header_payload(codec_name: &str, header: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + codec_name.len() + header.len());
    put_prefixed(&mut buf, codec_name.as_bytes());
    put_prefixed(&mut buf, header);
    buf.freeze()
}

pub fn wire_chunk_payload(timestamp: Timestamp, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(WIRE_CHUNK_HEADER_SIZE + data.len());
    buf.put_slice(&timestamp.to_le_bytes());
    put_prefixed(&mut buf, data);
    buf.freeze()
}

/// JSON text with its length prefix (server settings, hello)
pub fn json_payload(json: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + json.len());
    put_prefixed(&mut buf, json.as_bytes());
    buf.freeze()
}

pub fn time_payload(latency: Timestamp) -> Bytes {
    Bytes::copy_from_slice(&latency.to_le_bytes())
}

/// Interleaved 16-bit samples packed the way PCM chunks travel on the wire
pub fn pcm_wire_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.put_i16_le(*sample);
    }
    buf.freeze()
}

/// Numbers the requests a client sends on one connection
#[derive(Debug, Default)]
pub struct FrameWriter {
    next_id: u16,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn header(&mut self, message_type: MessageType, sent: Timestamp) -> BaseMessage {
        let mut base = BaseMessage::new(message_type, self.next_id, 0);
        base.sent = sent;
        self.next_id = self.next_id.wrapping_add(1);
        base
    }

    pub fn hello(&mut self, hello: &Hello, sent: Timestamp) -> serde_json::Result<Bytes> {
        let json = serde_json::to_string(hello)?;
        let base = self.header(MessageType::Hello, sent);
        Ok(encode_frame(&base, &json_payload(&json)))
    }

    /// Time request; the server answers with the client-to-server latency
    pub fn time_request(&mut self, sent: Timestamp) -> Bytes {
        let base = self.header(MessageType::Time, sent);
        encode_frame(&base, &time_payload(Timestamp::default()))
    }

    /// Id the next request will carry
    pub fn next_id(&self) -> u16 {
        self.next_id
    }
}
