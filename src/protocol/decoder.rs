//! Incremental wire protocol decoder
//!
//! Turns an arbitrarily fragmented byte stream into [`DecodeEvent`]s.
//! Decoding is a two-level state machine: the outer level accumulates the
//! fixed-size [`BaseMessage`] header, the inner level decodes the typed
//! payload one field at a time. Every field reader suspends as soon as the
//! input runs out and resumes on the next [`Decoder::feed`], so feeding a
//! stream one byte at a time yields the same events as feeding it whole.
//!
//! The typed decoders never read past `BaseMessage::size`. Whatever is left
//! of a frame after its last field, or after an error, is skipped before
//! the decoder returns to the header state.

use tracing::{debug, info, trace, warn};

use super::fields::{Input, LeBytes, LeU32, PcmWordAssembler, TimestampField};
use super::message::{
    BaseMessage, Codec, CodecContext, MessageType, Timestamp, WireChunkMeta, BASE_MESSAGE_SIZE,
};
use crate::audio::chunk::{ChunkAllocator, ChunkBuffer, HeapAllocator};
use crate::config::DecoderConfig;
use crate::error::{ParseError, ParseErrorKind};

/// Output of [`Decoder::feed`]
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeEvent {
    /// Input ran out in the middle of a frame
    NeedMoreData,
    /// A header completed; `received` is the local arrival time
    BaseMessageReady(BaseMessage),
    CodecHeaderReady {
        codec: Codec,
        payload: ChunkBuffer,
    },
    AudioChunkReady {
        meta: WireChunkMeta,
        samples: ChunkBuffer,
    },
    ServerSettingsReady(String),
    TimeMessageReady(Timestamp),
    /// A frame of a type this client does not handle was skipped
    UnknownSkipped {
        message_type: MessageType,
        skipped: u32,
    },
    ParseError(ParseError),
}

/// Which level of the state machine is active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Base,
    Typed,
}

/// Snapshot of the decoder's resumption point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderState {
    pub phase: Phase,
    /// Field index inside the current typed payload
    pub step: u8,
    /// Bytes already accumulated for the current field
    pub bytes_consumed_in_field: usize,
}

/// Decoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub bytes_consumed: u64,
    pub codec_headers: u64,
    pub wire_chunks: u64,
    pub server_settings: u64,
    pub time_messages: u64,
    pub unknown_skipped: u64,
    pub parse_errors: u64,
    /// Wire chunks dropped because no codec header was received yet
    pub chunks_without_codec: u64,
}

enum Progress {
    /// The input window is exhausted
    Suspended,
    /// All fields decoded; the event is emitted once the frame is fully consumed
    Done(Option<DecodeEvent>),
    Failed(ParseErrorKind),
}

/// Copy from `input` into `buf[*filled..]`; true once the buffer is full
fn fill(buf: &mut ChunkBuffer, filled: &mut usize, input: &mut Input<'_>) -> bool {
    let chunk = input.take(buf.len() - *filled);
    buf.as_mut_slice()[*filled..*filled + chunk.len()].copy_from_slice(chunk);
    *filled += chunk.len();
    *filled == buf.len()
}

/// Read a length prefix and allocate a buffer for the bytes it announces
fn read_prefixed<A: ChunkAllocator>(
    len: &mut LeU32,
    input: &mut Input<'_>,
    frame_left: usize,
    allocator: &A,
) -> Option<Result<ChunkBuffer, ParseErrorKind>> {
    let n = len.read(input)? as usize;
    if n > frame_left - input.position() {
        return Some(Err(ParseErrorKind::MalformedLength));
    }
    Some(allocator.allocate(n).map_err(|e| {
        warn!("{}", e);
        ParseErrorKind::OutOfMemory
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecHeaderStep {
    NameLen,
    Name,
    PayloadLen,
    Payload,
}

struct CodecHeaderBody {
    step: CodecHeaderStep,
    len: LeU32,
    buffer: Option<ChunkBuffer>,
    filled: usize,
    codec: Option<Codec>,
}

impl CodecHeaderBody {
    fn new() -> Self {
        Self {
            step: CodecHeaderStep::NameLen,
            len: LeU32::default(),
            buffer: None,
            filled: 0,
            codec: None,
        }
    }

    fn advance<A: ChunkAllocator>(
        &mut self,
        input: &mut Input<'_>,
        frame_left: usize,
        allocator: &A,
        context: &mut CodecContext,
    ) -> Progress {
        loop {
            match self.step {
                CodecHeaderStep::NameLen | CodecHeaderStep::PayloadLen => {
                    let Some(allocated) = read_prefixed(&mut self.len, input, frame_left, allocator)
                    else {
                        return Progress::Suspended;
                    };
                    match allocated {
                        Ok(buf) => self.buffer = Some(buf),
                        Err(kind) => return Progress::Failed(kind),
                    }
                    self.filled = 0;
                    self.step = if self.step == CodecHeaderStep::NameLen {
                        CodecHeaderStep::Name
                    } else {
                        CodecHeaderStep::Payload
                    };
                }
                CodecHeaderStep::Name => {
                    let Some(buf) = self.buffer.as_mut() else {
                        return Progress::Failed(ParseErrorKind::OutOfMemory);
                    };
                    if !fill(buf, &mut self.filled, input) {
                        return Progress::Suspended;
                    }
                    match Codec::from_name(buf.as_slice()) {
                        Some(codec) => self.codec = Some(codec),
                        None => {
                            warn!(
                                "Codec {:?} not supported, use opus, flac or pcm on the server",
                                String::from_utf8_lossy(buf.as_slice())
                            );
                            context.codec = None;
                            return Progress::Failed(ParseErrorKind::UnsupportedCodec);
                        }
                    }
                    self.buffer = None;
                    self.step = CodecHeaderStep::PayloadLen;
                }
                CodecHeaderStep::Payload => {
                    let Some(buf) = self.buffer.as_mut() else {
                        return Progress::Failed(ParseErrorKind::OutOfMemory);
                    };
                    if !fill(buf, &mut self.filled, input) {
                        return Progress::Suspended;
                    }
                    let (Some(codec), Some(payload)) = (self.codec, self.buffer.take()) else {
                        return Progress::Failed(ParseErrorKind::UnsupportedCodec);
                    };
                    context.codec = Some(codec);
                    context.received_codec_header = true;
                    return Progress::Done(Some(DecodeEvent::CodecHeaderReady { codec, payload }));
                }
            }
        }
    }

    fn position(&self) -> (u8, usize) {
        let field = match self.step {
            CodecHeaderStep::NameLen | CodecHeaderStep::PayloadLen => self.len.filled(),
            CodecHeaderStep::Name | CodecHeaderStep::Payload => self.filled,
        };
        (self.step as u8, field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireChunkStep {
    Timestamp,
    Size,
    Payload,
}

struct WireChunkBody {
    codec: Codec,
    step: WireChunkStep,
    timestamp_field: TimestampField,
    size_field: LeU32,
    timestamp: Timestamp,
    size: u32,
    buffer: Option<ChunkBuffer>,
    /// Payload bytes consumed from the wire
    consumed: usize,
    /// Bytes written to the buffer
    written: usize,
    pcm: PcmWordAssembler,
}

impl WireChunkBody {
    fn new(codec: Codec) -> Self {
        Self {
            codec,
            step: WireChunkStep::Timestamp,
            timestamp_field: TimestampField::new(),
            size_field: LeU32::default(),
            timestamp: Timestamp::default(),
            size: 0,
            buffer: None,
            consumed: 0,
            written: 0,
            pcm: PcmWordAssembler::default(),
        }
    }

    fn advance<A: ChunkAllocator>(
        &mut self,
        input: &mut Input<'_>,
        frame_left: usize,
        allocator: &A,
    ) -> Progress {
        loop {
            match self.step {
                WireChunkStep::Timestamp => {
                    let Some(timestamp) = self.timestamp_field.read_timestamp(input) else {
                        return Progress::Suspended;
                    };
                    self.timestamp = timestamp;
                    self.step = WireChunkStep::Size;
                }
                WireChunkStep::Size => {
                    let Some(size) = self.size_field.read(input) else {
                        return Progress::Suspended;
                    };
                    if size as usize > frame_left - input.position() {
                        return Progress::Failed(ParseErrorKind::MalformedLength);
                    }
                    // PCM keeps whole frame words only
                    let capacity = match self.codec {
                        Codec::Pcm => size as usize & !3,
                        Codec::Opus | Codec::Flac => size as usize,
                    };
                    match allocator.allocate(capacity) {
                        Ok(buf) => self.buffer = Some(buf),
                        Err(e) => {
                            warn!("{}", e);
                            return Progress::Failed(ParseErrorKind::OutOfMemory);
                        }
                    }
                    self.size = size;
                    self.step = WireChunkStep::Payload;
                }
                WireChunkStep::Payload => {
                    let Some(buf) = self.buffer.as_mut() else {
                        return Progress::Failed(ParseErrorKind::OutOfMemory);
                    };
                    let bytes = input.take(self.size as usize - self.consumed);
                    match self.codec {
                        Codec::Opus | Codec::Flac => {
                            let out = buf.as_mut_slice();
                            out[self.consumed..self.consumed + bytes.len()].copy_from_slice(bytes);
                            self.written += bytes.len();
                        }
                        Codec::Pcm => {
                            for byte in bytes {
                                if let Some(word) = self.pcm.push(*byte) {
                                    buf.as_mut_slice()[self.written..self.written + 4]
                                        .copy_from_slice(&word);
                                    self.written += 4;
                                }
                            }
                        }
                    }
                    self.consumed += bytes.len();
                    if self.consumed < self.size as usize {
                        return Progress::Suspended;
                    }
                    let Some(samples) = self.buffer.take() else {
                        return Progress::Failed(ParseErrorKind::OutOfMemory);
                    };
                    let meta = WireChunkMeta {
                        timestamp: self.timestamp,
                        size: self.size,
                        codec: self.codec,
                    };
                    return Progress::Done(Some(DecodeEvent::AudioChunkReady { meta, samples }));
                }
            }
        }
    }

    fn position(&self) -> (u8, usize) {
        let field = match self.step {
            WireChunkStep::Timestamp => self.timestamp_field.filled(),
            WireChunkStep::Size => self.size_field.filled(),
            WireChunkStep::Payload => self.consumed,
        };
        (self.step as u8, field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerSettingsStep {
    Len,
    Json,
}

struct ServerSettingsBody {
    step: ServerSettingsStep,
    len: LeU32,
    buffer: Option<ChunkBuffer>,
    filled: usize,
}

impl ServerSettingsBody {
    fn new() -> Self {
        Self {
            step: ServerSettingsStep::Len,
            len: LeU32::default(),
            buffer: None,
            filled: 0,
        }
    }

    fn advance<A: ChunkAllocator>(
        &mut self,
        input: &mut Input<'_>,
        frame_left: usize,
        allocator: &A,
    ) -> Progress {
        loop {
            match self.step {
                ServerSettingsStep::Len => {
                    let Some(allocated) = read_prefixed(&mut self.len, input, frame_left, allocator)
                    else {
                        return Progress::Suspended;
                    };
                    match allocated {
                        Ok(buf) => self.buffer = Some(buf),
                        Err(kind) => return Progress::Failed(kind),
                    }
                    self.step = ServerSettingsStep::Json;
                }
                ServerSettingsStep::Json => {
                    let Some(buf) = self.buffer.as_mut() else {
                        return Progress::Failed(ParseErrorKind::OutOfMemory);
                    };
                    if !fill(buf, &mut self.filled, input) {
                        return Progress::Suspended;
                    }
                    let json = String::from_utf8_lossy(buf.as_slice()).into_owned();
                    self.buffer = None;
                    return Progress::Done(Some(DecodeEvent::ServerSettingsReady(json)));
                }
            }
        }
    }

    fn position(&self) -> (u8, usize) {
        let field = match self.step {
            ServerSettingsStep::Len => self.len.filled(),
            ServerSettingsStep::Json => self.filled,
        };
        (self.step as u8, field)
    }
}

enum Body {
    CodecHeader(CodecHeaderBody),
    WireChunk(WireChunkBody),
    ServerSettings(ServerSettingsBody),
    Time(TimestampField),
    /// Skip the rest of the frame, then emit the event if any
    Drain(Option<DecodeEvent>),
}

struct Frame {
    base: BaseMessage,
    consumed: u32,
    body: Body,
}

impl Frame {
    fn remaining(&self) -> usize {
        (self.base.size - self.consumed) as usize
    }
}

enum State {
    Base(LeBytes<BASE_MESSAGE_SIZE>),
    Typed(Frame),
}

/// Stateful decoder for one connection.
///
/// Not internally synchronized: exactly one receive loop feeds it.
pub struct Decoder<A: ChunkAllocator = HeapAllocator> {
    allocator: A,
    config: DecoderConfig,
    codec: CodecContext,
    state: State,
    stats: DecoderStats,
}

impl Default for Decoder<HeapAllocator> {
    fn default() -> Self {
        Self::new(HeapAllocator)
    }
}

impl<A: ChunkAllocator> Decoder<A> {
    pub fn new(allocator: A) -> Self {
        Self::with_config(allocator, DecoderConfig::default())
    }

    pub fn with_config(allocator: A, config: DecoderConfig) -> Self {
        Self {
            allocator,
            config,
            codec: CodecContext::default(),
            state: State::Base(LeBytes::new()),
            stats: DecoderStats::default(),
        }
    }

    /// Feed bytes that arrived just now
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodeEvent> {
        self.feed_at(bytes, Timestamp::now())
    }

    /// Feed bytes that arrived at `arrival` (local clock).
    ///
    /// Consumes all of `bytes`; never blocks and performs no I/O.
    pub fn feed_at(&mut self, bytes: &[u8], arrival: Timestamp) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if bytes.is_empty() {
            events.push(DecodeEvent::NeedMoreData);
            return events;
        }

        let mut input = Input::new(bytes);
        while self.step(&mut input, arrival, &mut events) {}
        self.stats.bytes_consumed += bytes.len() as u64;

        if self.is_mid_frame() {
            trace!("suspended at {:?}", self.state());
            events.push(DecodeEvent::NeedMoreData);
        }
        events
    }

    /// Returns `false` once nothing more can happen without new input
    fn step(&mut self, input: &mut Input<'_>, arrival: Timestamp, events: &mut Vec<DecodeEvent>) -> bool {
        if let State::Base(header) = &mut self.state {
            let Some(raw) = header.read(input) else {
                return false;
            };
            let mut base = BaseMessage::from_le_bytes(&raw);
            // local arrival time, needed for round-trip latency
            base.received = arrival;
            events.push(DecodeEvent::BaseMessageReady(base));
            self.begin_frame(base, events);
            return true;
        }
        self.advance_frame(input, events)
    }

    fn begin_frame(&mut self, base: BaseMessage, events: &mut Vec<DecodeEvent>) {
        debug!(
            "{:?} message id {} size {}",
            base.message_type, base.id, base.size
        );

        let body = match base.message_type {
            MessageType::CodecHeader => {
                self.codec.received_codec_header = false;
                Body::CodecHeader(CodecHeaderBody::new())
            }
            MessageType::WireChunk => match self.codec.active() {
                Some(codec) => Body::WireChunk(WireChunkBody::new(codec)),
                None => {
                    debug!("Dropping wire chunk, no codec header yet");
                    self.stats.chunks_without_codec += 1;
                    Body::Drain(None)
                }
            },
            MessageType::ServerSettings => Body::ServerSettings(ServerSettingsBody::new()),
            MessageType::Time => Body::Time(TimestampField::new()),
            message_type => Body::Drain(Some(DecodeEvent::UnknownSkipped {
                message_type,
                skipped: base.size,
            })),
        };

        self.state = State::Typed(Frame {
            base,
            consumed: 0,
            body,
        });

        if base.size > self.config.max_frame_size {
            self.fail(ParseErrorKind::MalformedLength, events);
        }
    }

    /// Returns `true` when the frame finished or changed course and the
    /// caller should keep stepping
    fn advance_frame(&mut self, input: &mut Input<'_>, events: &mut Vec<DecodeEvent>) -> bool {
        let State::Typed(frame) = &mut self.state else {
            return false;
        };

        let frame_left = frame.remaining();
        let mut window = Input::new(input.take(frame_left));
        let progress = match &mut frame.body {
            Body::CodecHeader(body) => {
                body.advance(&mut window, frame_left, &self.allocator, &mut self.codec)
            }
            Body::WireChunk(body) => body.advance(&mut window, frame_left, &self.allocator),
            Body::ServerSettings(body) => body.advance(&mut window, frame_left, &self.allocator),
            Body::Time(field) => match field.read_timestamp(&mut window) {
                Some(latency) => Progress::Done(Some(DecodeEvent::TimeMessageReady(latency))),
                None => Progress::Suspended,
            },
            Body::Drain(then) => {
                window.take(frame_left);
                if window.position() == frame_left {
                    Progress::Done(then.take())
                } else {
                    Progress::Suspended
                }
            }
        };

        // Give back what the body did not use
        let used = window.position();
        input.rewind(window.remaining());
        frame.consumed += used as u32;
        let left = frame.remaining();

        match progress {
            Progress::Suspended if left > 0 => false,
            // The fields need more bytes than the frame holds
            Progress::Suspended => {
                self.fail(ParseErrorKind::MalformedLength, events);
                true
            }
            Progress::Done(event) if left == 0 => {
                self.finish(event, events);
                true
            }
            Progress::Done(event) => {
                trace!("skipping {} trailing bytes", left);
                frame.body = Body::Drain(event);
                true
            }
            Progress::Failed(kind) => {
                self.fail(kind, events);
                true
            }
        }
    }

    /// Abort the typed decoding; the rest of the frame is skipped
    fn fail(&mut self, kind: ParseErrorKind, events: &mut Vec<DecodeEvent>) {
        let State::Typed(frame) = &mut self.state else {
            return;
        };
        let error = ParseError::new(kind, frame.base.message_type);
        warn!("{}, skipping rest of frame id {}", error, frame.base.id);

        frame.body = Body::Drain(None);
        self.stats.parse_errors += 1;
        events.push(DecodeEvent::ParseError(error));
    }

    fn finish(&mut self, event: Option<DecodeEvent>, events: &mut Vec<DecodeEvent>) {
        if let Some(event) = event {
            self.record(&event);
            events.push(event);
        }
        self.state = State::Base(LeBytes::new());
    }

    fn record(&mut self, event: &DecodeEvent) {
        match event {
            DecodeEvent::CodecHeaderReady { codec, payload } => {
                info!("Codec {} ({} header bytes)", codec, payload.len());
                self.stats.codec_headers += 1;
            }
            DecodeEvent::AudioChunkReady { meta, .. } => {
                trace!("chunk at {} with {} bytes", meta.timestamp, meta.size);
                self.stats.wire_chunks += 1;
            }
            DecodeEvent::ServerSettingsReady(_) => self.stats.server_settings += 1,
            DecodeEvent::TimeMessageReady(_) => self.stats.time_messages += 1,
            DecodeEvent::UnknownSkipped { message_type, skipped } => {
                debug!("Skipped {:?} message ({} bytes)", message_type, skipped);
                self.stats.unknown_skipped += 1;
            }
            _ => {}
        }
    }

    fn is_mid_frame(&self) -> bool {
        match &self.state {
            State::Base(header) => header.filled() > 0,
            State::Typed(_) => true,
        }
    }

    /// Current resumption point
    pub fn state(&self) -> DecoderState {
        match &self.state {
            State::Base(header) => DecoderState {
                phase: Phase::Base,
                step: 0,
                bytes_consumed_in_field: header.filled(),
            },
            State::Typed(frame) => {
                let (step, bytes_consumed_in_field) = match &frame.body {
                    Body::CodecHeader(body) => body.position(),
                    Body::WireChunk(body) => body.position(),
                    Body::ServerSettings(body) => body.position(),
                    Body::Time(field) => (0, field.filled()),
                    Body::Drain(_) => (0, frame.consumed as usize),
                };
                DecoderState {
                    phase: Phase::Typed,
                    step,
                    bytes_consumed_in_field,
                }
            }
        }
    }

    pub fn codec_context(&self) -> CodecContext {
        self.codec
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop any partial frame and forget the codec, as on a fresh connection
    pub fn reset(&mut self) {
        self.state = State::Base(LeBytes::new());
        self.codec = CodecContext::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chunk::BudgetAllocator;
    use crate::protocol::encode::*;
    use proptest::prelude::*;

    const ARRIVAL: Timestamp = Timestamp::new(100, 500);

    fn decoder() -> Decoder {
        Decoder::default()
    }

    fn frame(message_type: MessageType, id: u16, payload: &[u8]) -> Vec<u8> {
        let mut base = BaseMessage::new(message_type, id, 0);
        base.sent = Timestamp::new(99, 1);
        base.received = Timestamp::new(12345, 6789);
        encode_frame(&base, payload).to_vec()
    }

    fn codec_header(name: &str, header: &[u8]) -> Vec<u8> {
        frame(MessageType::CodecHeader, 1, &codec_header_payload(name, header))
    }

    fn time_message(latency: Timestamp) -> Vec<u8> {
        frame(MessageType::Time, 2, &time_payload(latency))
    }

    fn chunk(sec: i32, data: &[u8]) -> Vec<u8> {
        frame(
            MessageType::WireChunk,
            3,
            &wire_chunk_payload(Timestamp::new(sec, 0), data),
        )
    }

    fn session_stream() -> Vec<u8> {
        let pcm: Vec<i16> = (0..64).map(|i| (i * 517 - 9000) as i16).collect();
        [
            codec_header("pcm", &[1, 2, 3, 4, 5]),
            frame(
                MessageType::ServerSettings,
                4,
                &json_payload(r#"{"bufferMs":1000,"latency":0,"muted":false,"volume":70}"#),
            ),
            time_message(Timestamp::new(0, 1500)),
            chunk(7, &pcm_wire_bytes(&pcm)),
            frame(MessageType::Unknown(99), 5, &[0xaa; 13]),
            chunk(8, &[]),
        ]
        .concat()
    }

    fn without_need_more(events: Vec<DecodeEvent>) -> Vec<DecodeEvent> {
        events
            .into_iter()
            .filter(|e| *e != DecodeEvent::NeedMoreData)
            .collect()
    }

    fn feed_split(bytes: &[u8], cuts: &[usize]) -> Vec<DecodeEvent> {
        let mut decoder = decoder();
        let mut events = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
            let cut = cut.clamp(start, bytes.len());
            events.extend(decoder.feed_at(&bytes[start..cut], ARRIVAL));
            start = cut;
        }
        without_need_more(events)
    }

    fn typed(events: Vec<DecodeEvent>) -> Vec<DecodeEvent> {
        events
            .into_iter()
            .filter(|e| !matches!(e, DecodeEvent::BaseMessageReady(_) | DecodeEvent::NeedMoreData))
            .collect()
    }

    #[test]
    fn test_empty_feed_needs_more_data() {
        let mut decoder = decoder();
        assert_eq!(decoder.feed_at(&[], ARRIVAL), vec![DecodeEvent::NeedMoreData]);
        assert_eq!(decoder.state(), DecoderState::default());
    }

    #[test]
    fn test_received_is_local_arrival_time() {
        let mut decoder = decoder();
        let events = decoder.feed_at(&time_message(Timestamp::new(0, 10)), ARRIVAL);

        let DecodeEvent::BaseMessageReady(base) = &events[0] else {
            panic!("expected base message, got {:?}", events[0]);
        };
        assert_eq!(base.received, ARRIVAL);
        assert_eq!(base.sent, Timestamp::new(99, 1));
        assert_eq!(base.size, 8);
    }

    #[test]
    fn test_time_message_split_in_three() {
        let bytes = time_message(Timestamp::new(3, 250));
        let expected = vec![DecodeEvent::TimeMessageReady(Timestamp::new(3, 250))];

        let three = feed_split(&bytes, &[10, BASE_MESSAGE_SIZE + 3]);
        assert_eq!(typed(three), expected);

        // header whole, then the payload as 4 + 4
        let four_four = feed_split(&bytes, &[BASE_MESSAGE_SIZE, BASE_MESSAGE_SIZE + 4]);
        assert_eq!(typed(four_four), expected);
    }

    #[test]
    fn test_need_more_data_mid_frame() {
        let bytes = time_message(Timestamp::new(3, 250));
        let mut decoder = decoder();

        assert_eq!(decoder.feed_at(&bytes[..5], ARRIVAL), vec![DecodeEvent::NeedMoreData]);
        assert_eq!(decoder.state().bytes_consumed_in_field, 5);

        let events = decoder.feed_at(&bytes[5..BASE_MESSAGE_SIZE + 6], ARRIVAL);
        assert_eq!(events.len(), 2);
        assert_eq!(decoder.state().phase, Phase::Typed);
        assert_eq!(decoder.state().bytes_consumed_in_field, 6);

        let events = decoder.feed_at(&bytes[BASE_MESSAGE_SIZE + 6..], ARRIVAL);
        assert_eq!(events, vec![DecodeEvent::TimeMessageReady(Timestamp::new(3, 250))]);
        assert_eq!(decoder.state(), DecoderState::default());
    }

    #[test]
    fn test_state_inside_length_fields() {
        // two bytes into the codec name length
        let header = codec_header("opus", &[]);
        let mut decoder = decoder();
        decoder.feed_at(&header[..BASE_MESSAGE_SIZE + 2], ARRIVAL);
        assert_eq!(
            decoder.state(),
            DecoderState {
                phase: Phase::Typed,
                step: 0,
                bytes_consumed_in_field: 2,
            }
        );

        // three bytes into the chunk size
        decoder.feed_at(&header[BASE_MESSAGE_SIZE + 2..], ARRIVAL);
        let chunk = chunk(1, &[1, 2, 3, 4]);
        decoder.feed_at(&chunk[..BASE_MESSAGE_SIZE + 8 + 3], ARRIVAL);
        assert_eq!(
            decoder.state(),
            DecoderState {
                phase: Phase::Typed,
                step: 1,
                bytes_consumed_in_field: 3,
            }
        );

        // one byte into the settings length
        let events = decoder.feed_at(&chunk[BASE_MESSAGE_SIZE + 8 + 3..], ARRIVAL);
        assert!(matches!(events[0], DecodeEvent::AudioChunkReady { .. }));
        let settings = frame(MessageType::ServerSettings, 4, &json_payload("{}"));
        decoder.feed_at(&settings[..BASE_MESSAGE_SIZE + 1], ARRIVAL);
        assert_eq!(decoder.state().bytes_consumed_in_field, 1);
    }

    #[test]
    fn test_one_byte_at_a_time_matches_whole() {
        let bytes = session_stream();
        let whole = feed_split(&bytes, &[]);
        let cuts: Vec<usize> = (1..bytes.len()).collect();
        let bytewise = feed_split(&bytes, &cuts);

        assert_eq!(whole, bytewise);
        assert_eq!(typed(whole).len(), 6);
    }

    #[test]
    fn test_pcm_samples_bit_exact() {
        let samples: Vec<i16> = vec![i16::MIN, -1, 0, 1, 0x1234, i16::MAX, -21846, 300];
        let bytes = [codec_header("pcm", &[]), chunk(1, &pcm_wire_bytes(&samples))].concat();

        let events = typed(feed_split(&bytes, &[]));
        let DecodeEvent::AudioChunkReady { meta, samples: data } = &events[1] else {
            panic!("expected chunk, got {:?}", events[1]);
        };
        assert_eq!(meta.codec, Codec::Pcm);
        assert_eq!(meta.size, 16);
        assert_eq!(data.pcm_samples_i16().collect::<Vec<_>>(), samples);
        // left sample ends up in the upper half of the frame word
        assert_eq!(data.frame_words().next(), Some(0x8000_ffff));
    }

    #[test]
    fn test_pcm_trailing_bytes_dropped() {
        let bytes = [codec_header("pcm", &[]), chunk(1, &[1, 0, 2, 0, 9, 9])].concat();
        let events = typed(feed_split(&bytes, &[]));

        let DecodeEvent::AudioChunkReady { meta, samples } = &events[1] else {
            panic!("expected chunk");
        };
        assert_eq!(meta.size, 6);
        assert_eq!(samples.as_slice(), &[2, 0, 1, 0]);
    }

    #[test]
    fn test_opus_payload_verbatim() {
        let payload: Vec<u8> = (0..=255).collect();
        let bytes = [codec_header("opus", b"OpusHead"), chunk(4, &payload)].concat();
        let events = typed(feed_split(&bytes, &[40, 41, 100]));

        match &events[0] {
            DecodeEvent::CodecHeaderReady { codec, payload } => {
                assert_eq!(*codec, Codec::Opus);
                assert_eq!(payload.as_slice(), b"OpusHead");
            }
            other => panic!("expected codec header, got {:?}", other),
        }
        match &events[1] {
            DecodeEvent::AudioChunkReady { meta, samples } => {
                assert_eq!(meta.timestamp, Timestamp::new(4, 0));
                assert_eq!(samples.as_slice(), payload.as_slice());
            }
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_chunk_before_codec_header_is_dropped() {
        let bytes = [chunk(1, &[1, 2, 3, 4]), time_message(Timestamp::new(0, 9))].concat();
        let mut decoder = decoder();
        let events = typed(decoder.feed_at(&bytes, ARRIVAL));

        assert_eq!(events, vec![DecodeEvent::TimeMessageReady(Timestamp::new(0, 9))]);
        assert_eq!(decoder.stats().chunks_without_codec, 1);
    }

    #[test]
    fn test_unsupported_codec_recovers() {
        let bytes = [codec_header("mp3", &[1, 2, 3]), time_message(Timestamp::new(1, 1))].concat();
        let mut decoder = decoder();
        let events = typed(decoder.feed_at(&bytes, ARRIVAL));

        assert_eq!(
            events,
            vec![
                DecodeEvent::ParseError(ParseError::new(
                    ParseErrorKind::UnsupportedCodec,
                    MessageType::CodecHeader
                )),
                DecodeEvent::TimeMessageReady(Timestamp::new(1, 1)),
            ]
        );
        assert_eq!(decoder.codec_context(), CodecContext::default());
        assert_eq!(decoder.state(), DecoderState::default());
    }

    #[test]
    fn test_new_codec_header_replaces_codec() {
        let bytes = [codec_header("flac", b"fLaC"), codec_header("pcm", &[])].concat();
        let mut decoder = decoder();
        decoder.feed_at(&bytes[..bytes.len() - 2], ARRIVAL);

        // second header in progress: chunks are not demuxed with the old codec
        assert!(!decoder.codec_context().received_codec_header);

        decoder.feed_at(&bytes[bytes.len() - 2..], ARRIVAL);
        assert_eq!(decoder.codec_context().active(), Some(Codec::Pcm));
    }

    #[test]
    fn test_out_of_memory_recovers() {
        let alloc = BudgetAllocator::new(64);
        let mut decoder = Decoder::new(alloc.clone());

        let bytes = [
            codec_header("opus", &[]),
            chunk(1, &[7u8; 100]),
            chunk(2, &[8u8; 10]),
        ]
        .concat();
        let events = typed(decoder.feed_at(&bytes, ARRIVAL));

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1],
            DecodeEvent::ParseError(ParseError::new(
                ParseErrorKind::OutOfMemory,
                MessageType::WireChunk
            ))
        );
        assert!(matches!(&events[2], DecodeEvent::AudioChunkReady { samples, .. } if samples.as_slice() == &[8u8; 10]));
        assert_eq!(alloc.in_use(), 10);

        drop(events);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_codec_name_out_of_memory() {
        let mut decoder = Decoder::new(BudgetAllocator::new(2));
        let bytes = [codec_header("opus", &[]), time_message(Timestamp::new(0, 3))].concat();
        let events = typed(decoder.feed_at(&bytes, ARRIVAL));

        assert_eq!(
            events,
            vec![
                DecodeEvent::ParseError(ParseError::new(
                    ParseErrorKind::OutOfMemory,
                    MessageType::CodecHeader
                )),
                DecodeEvent::TimeMessageReady(Timestamp::new(0, 3)),
            ]
        );
    }

    #[test]
    fn test_sub_length_beyond_frame_is_malformed() {
        // chunk claims 1000 bytes inside a 20 byte frame
        let mut payload = wire_chunk_payload(Timestamp::new(1, 0), &[0u8; 8]).to_vec();
        payload[8..12].copy_from_slice(&1000u32.to_le_bytes());
        let bytes = [
            codec_header("opus", &[]),
            frame(MessageType::WireChunk, 9, &payload),
            time_message(Timestamp::new(0, 4)),
        ]
        .concat();

        let events = typed(feed_split(&bytes, &[50, 51]));
        assert_eq!(
            events[1],
            DecodeEvent::ParseError(ParseError::new(
                ParseErrorKind::MalformedLength,
                MessageType::WireChunk
            ))
        );
        assert_eq!(events[2], DecodeEvent::TimeMessageReady(Timestamp::new(0, 4)));
    }

    #[test]
    fn test_short_time_message_is_malformed() {
        let bytes = [
            frame(MessageType::Time, 1, &[1, 2, 3]),
            time_message(Timestamp::new(5, 5)),
        ]
        .concat();
        let events = typed(feed_split(&bytes, &[]));

        assert_eq!(
            events,
            vec![
                DecodeEvent::ParseError(ParseError::new(
                    ParseErrorKind::MalformedLength,
                    MessageType::Time
                )),
                DecodeEvent::TimeMessageReady(Timestamp::new(5, 5)),
            ]
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let config = DecoderConfig { max_frame_size: 16 };
        let mut decoder = Decoder::with_config(HeapAllocator, config);
        let bytes = [
            frame(MessageType::ServerSettings, 1, &json_payload("{\"volume\":100000}")),
            time_message(Timestamp::new(0, 1)),
        ]
        .concat();

        let events = typed(decoder.feed_at(&bytes, ARRIVAL));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DecodeEvent::ParseError(e) if e.kind == ParseErrorKind::MalformedLength));
    }

    #[test]
    fn test_trailing_bytes_inside_frame_are_skipped() {
        let mut payload = json_payload(r#"{"muted":true}"#).to_vec();
        payload.extend_from_slice(&[0, 0, 0]);
        let bytes = [
            frame(MessageType::ServerSettings, 1, &payload),
            time_message(Timestamp::new(0, 2)),
        ]
        .concat();

        let events = typed(feed_split(&bytes, &[BASE_MESSAGE_SIZE + 18]));
        assert_eq!(
            events,
            vec![
                DecodeEvent::ServerSettingsReady(r#"{"muted":true}"#.to_string()),
                DecodeEvent::TimeMessageReady(Timestamp::new(0, 2)),
            ]
        );
    }

    #[test]
    fn test_unknown_sizes_resume_cleanly() {
        for size in [0usize, 1, 4096] {
            let bytes = [
                frame(MessageType::Unknown(1234), 1, &vec![0x5a; size]),
                time_message(Timestamp::new(0, 7)),
            ]
            .concat();
            let events = typed(feed_split(&bytes, &[BASE_MESSAGE_SIZE + size / 2]));

            assert_eq!(
                events,
                vec![
                    DecodeEvent::UnknownSkipped {
                        message_type: MessageType::Unknown(1234),
                        skipped: size as u32,
                    },
                    DecodeEvent::TimeMessageReady(Timestamp::new(0, 7)),
                ],
                "size {}",
                size
            );
        }
    }

    #[test]
    fn test_zero_sized_frame_completes_without_more_input() {
        let mut decoder = decoder();
        let events = decoder.feed_at(&frame(MessageType::Hello, 1, &[]), ARRIVAL);

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], DecodeEvent::UnknownSkipped { skipped: 0, .. }));
        assert_eq!(decoder.state(), DecoderState::default());
    }

    #[test]
    fn test_stats() {
        let mut decoder = decoder();
        let bytes = session_stream();
        decoder.feed_at(&bytes, ARRIVAL);

        let stats = decoder.stats();
        assert_eq!(stats.bytes_consumed, bytes.len() as u64);
        assert_eq!(stats.codec_headers, 1);
        assert_eq!(stats.wire_chunks, 2);
        assert_eq!(stats.server_settings, 1);
        assert_eq!(stats.time_messages, 1);
        assert_eq!(stats.unknown_skipped, 1);
        assert_eq!(stats.parse_errors, 0);
    }

    proptest! {
        #[test]
        fn prop_any_split_matches_whole(mut cuts in proptest::collection::vec(0usize..600, 0..24)) {
            let bytes = session_stream();
            cuts.sort_unstable();
            prop_assert_eq!(feed_split(&bytes, &cuts), feed_split(&bytes, &[]));
        }

        #[test]
        fn prop_garbage_never_wedges(garbage in proptest::collection::vec(any::<u8>(), 0..64)) {
            // a frame of unknown type wrapping garbage, then a valid message
            let bytes = [
                frame(MessageType::Unknown(777), 1, &garbage),
                time_message(Timestamp::new(2, 2)),
            ]
            .concat();
            let events = typed(feed_split(&bytes, &[3, 30]));
            prop_assert_eq!(events.last(), Some(&DecodeEvent::TimeMessageReady(Timestamp::new(2, 2))));
        }
    }
}
