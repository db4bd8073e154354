//! Per-connection session
//!
//! Routes decoder events to their consumers: codec headers and server
//! settings update the session, time replies feed the clock filter, audio
//! chunks go to the playback queue. A reconnect gets a fresh session.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audio::buffer::{ScheduledChunk, SharedChunkQueue};
use crate::audio::chunk::{BudgetAllocator, ChunkAllocator, ChunkBuffer};
use crate::config::AppConfig;
use crate::error::ParseError;
use crate::protocol::{
    BaseMessage, Codec, DecodeEvent, Decoder, DecoderStats, MessageType, ServerSettings,
    Timestamp,
};
use crate::timesync::{TimeFilter, TimeSample};

/// Shared view of server time for the playback side
#[derive(Debug, Clone)]
pub struct PlayoutClock {
    filter: Arc<TimeFilter>,
    settings: Arc<RwLock<ServerSettings>>,
    warm_up_samples: u8,
}

impl PlayoutClock {
    pub fn new(filter: Arc<TimeFilter>, warm_up_samples: u8) -> Self {
        Self {
            filter,
            settings: Arc::new(RwLock::new(ServerSettings::default())),
            warm_up_samples,
        }
    }

    pub fn filter(&self) -> &Arc<TimeFilter> {
        &self.filter
    }

    pub fn settings(&self) -> ServerSettings {
        self.settings.read().clone()
    }

    fn set_settings(&self, settings: ServerSettings) {
        *self.settings.write() = settings;
    }

    /// Enough time samples were accepted to trust the offset
    pub fn is_synced(&self) -> bool {
        self.filter.is_warmed_up(self.warm_up_samples)
    }

    /// Local time (µs) at which a chunk stamped `server_time` must be heard.
    ///
    /// The server plays `buffer_ms` behind the chunk timestamps; a client
    /// latency setting moves playback earlier to compensate for the output
    /// path.
    pub fn local_play_time(&self, server_time: Timestamp) -> i64 {
        let settings = self.settings.read();
        let delay_us = (settings.buffer_ms as i64 - settings.latency as i64) * 1000;
        let server_play = server_time.as_micros() + delay_us;
        // offset is server minus client and is indexed by client time:
        // estimate the client time first, then take the offset there
        let estimate = server_play - self.filter.offset(server_play);
        server_play - self.filter.offset(estimate)
    }
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks_queued: u64,
    /// Dropped because the playback queue was full
    pub chunks_dropped: u64,
    pub time_samples: u64,
    pub time_samples_rejected: u64,
    pub settings_rejected: u64,
}

/// State of one server connection
pub struct Session<A: ChunkAllocator = BudgetAllocator> {
    decoder: Decoder<A>,
    clock: PlayoutClock,
    queue: SharedChunkQueue,
    last_base: Option<BaseMessage>,
    codec_header: Option<(Codec, ChunkBuffer)>,
    stats: SessionStats,
}

impl Session<BudgetAllocator> {
    /// Build a session with everything sized from `config`
    pub fn from_config(config: &AppConfig, queue: SharedChunkQueue) -> Self {
        let allocator = BudgetAllocator::new(config.playback.chunk_memory_budget);
        let decoder = Decoder::with_config(allocator, config.decoder);
        let filter = Arc::new(TimeFilter::new(config.filter));
        let clock = PlayoutClock::new(filter, config.client.warm_up_samples);
        Self::new(decoder, clock, queue)
    }
}

impl<A: ChunkAllocator> Session<A> {
    pub fn new(decoder: Decoder<A>, clock: PlayoutClock, queue: SharedChunkQueue) -> Self {
        Self {
            decoder,
            clock,
            queue,
            last_base: None,
            codec_header: None,
            stats: SessionStats::default(),
        }
    }

    /// Process bytes that arrived just now
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<ParseError> {
        self.receive_at(bytes, Timestamp::now())
    }

    /// Process bytes that arrived at `arrival`.
    ///
    /// Returns the frames the decoder had to abort. The decoder has already
    /// resynchronized; whether to keep the connection is up to the caller.
    pub fn receive_at(&mut self, bytes: &[u8], arrival: Timestamp) -> Vec<ParseError> {
        let mut errors = Vec::new();
        for event in self.decoder.feed_at(bytes, arrival) {
            match event {
                DecodeEvent::NeedMoreData => {}
                DecodeEvent::BaseMessageReady(base) => self.last_base = Some(base),
                DecodeEvent::CodecHeaderReady { codec, payload } => {
                    self.on_codec_header(codec, payload)
                }
                DecodeEvent::AudioChunkReady { meta, samples } => {
                    self.on_chunk(ScheduledChunk::new(meta, samples))
                }
                DecodeEvent::ServerSettingsReady(json) => self.on_server_settings(&json),
                DecodeEvent::TimeMessageReady(latency) => self.on_time(latency),
                DecodeEvent::UnknownSkipped { .. } => {}
                DecodeEvent::ParseError(error) => errors.push(error),
            }
        }
        errors
    }

    fn on_codec_header(&mut self, codec: Codec, payload: ChunkBuffer) {
        if let Some((previous, _)) = &self.codec_header {
            if *previous != codec {
                let dropped = self.queue.clear();
                info!("Codec changed from {} to {}, dropped {} chunks", previous, codec, dropped);
            }
        }
        self.codec_header = Some((codec, payload));
    }

    fn on_chunk(&mut self, chunk: ScheduledChunk) {
        match self.queue.push(chunk) {
            Ok(()) => self.stats.chunks_queued += 1,
            Err(rejected) => {
                debug!("Playback queue full, dropping chunk at {}", rejected.server_time());
                self.stats.chunks_dropped += 1;
            }
        }
    }

    fn on_server_settings(&mut self, json: &str) {
        match serde_json::from_str::<ServerSettings>(json) {
            Ok(settings) => {
                info!(
                    "Server settings: buffer {} ms, latency {} ms, volume {}{}",
                    settings.buffer_ms,
                    settings.latency,
                    settings.volume,
                    if settings.muted { " (muted)" } else { "" }
                );
                self.clock.set_settings(settings);
            }
            Err(e) => {
                warn!("Ignoring server settings {:?}: {}", json, e);
                self.stats.settings_rejected += 1;
            }
        }
    }

    fn on_time(&mut self, latency: Timestamp) {
        let Some(base) = self.last_base.filter(|b| b.message_type == MessageType::Time) else {
            return;
        };
        let sample = TimeSample::from_round_trip(&base, latency);
        debug!(
            "time sample: offset {} µs, max error {} µs",
            sample.measurement, sample.max_error
        );

        match sample.apply(self.clock.filter()) {
            Ok(()) => self.stats.time_samples += 1,
            Err(_) => self.stats.time_samples_rejected += 1,
        }
    }

    pub fn clock(&self) -> &PlayoutClock {
        &self.clock
    }

    pub fn queue(&self) -> &SharedChunkQueue {
        &self.queue
    }

    /// Codec of the stream and its header payload, once received
    pub fn codec_header(&self) -> Option<(Codec, &ChunkBuffer)> {
        self.codec_header
            .as_ref()
            .map(|(codec, payload)| (*codec, payload))
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Start over after a reconnect
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.clock.filter().reset();
        self.queue.clear();
        self.last_base = None;
        self.codec_header = None;
        self.stats = SessionStats::default();
    }
}
