//! # Snapsync Client
//!
//! Receiving side of a synchronized multi-room audio protocol: an
//! incremental wire decoder and a Kalman clock filter.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               CLIENT                                 │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │           TCP Connection (network::connection)                 │  │
//! │  │   arbitrary fragments ──▶ Session::receive                     │  │
//! │  └───────────────────────────────┬────────────────────────────────┘  │
//! │                                  ▼                                   │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │           Decoder (protocol::decoder)                          │  │
//! │  │   Base header (26 B) ──▶ typed payload, field by field         │  │
//! │  │   chunk memory from a ChunkAllocator (audio::chunk)            │  │
//! │  └──────┬──────────────┬──────────────┬──────────────┬────────────┘  │
//! │         │ CodecHeader  │ ServerSett.  │ Time         │ WireChunk     │
//! │         ▼              ▼              ▼              ▼               │
//! │  ┌────────────┐ ┌─────────────┐ ┌─────────────┐ ┌────────────────┐   │
//! │  │ codec      │ │ buffer /    │ │ TimeSample  │ │ ChunkQueue     │   │
//! │  │ context    │ │ latency     │ │   ──▶       │ │ (audio::buffer)│   │
//! │  │            │ │             │ │ TimeFilter  │ │                │   │
//! │  └────────────┘ └──────┬──────┘ └──────┬──────┘ └───────┬────────┘   │
//! │                        └───────┬───────┘                │            │
//! │                                ▼                        ▼            │
//! │                  ┌──────────────────────┐   ┌──────────────────────┐ │
//! │                  │ PlayoutClock         │──▶│ Playback scheduler   │ │
//! │                  │ server ⇄ local time  │   │ (own thread)         │ │
//! │                  └──────────────────────┘   └──────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod timesync;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default stream server TCP port
    pub const DEFAULT_SERVER_PORT: u16 = 1704;

    /// Default period between time requests
    pub const DEFAULT_TIME_SYNC_INTERVAL_MS: u64 = 1000;

    /// Time samples needed before playback is scheduled
    pub const DEFAULT_WARM_UP_SAMPLES: u8 = 3;

    /// Largest frame payload the decoder accepts
    pub const DEFAULT_MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

    /// Clock filter offset process noise (std dev per µs)
    pub const DEFAULT_PROCESS_STD_DEV: f64 = 0.01;

    /// Clock filter drift process noise (std dev per µs)
    pub const DEFAULT_DRIFT_PROCESS_STD_DEV: f64 = 0.0;

    /// Covariance inflation on large residuals
    pub const DEFAULT_FORGET_FACTOR: f64 = 1.001;

    /// Residual threshold as a multiple of the sample's max error
    pub const DEFAULT_ADAPTIVE_CUTOFF: f64 = 0.75;

    pub const DEFAULT_MIN_SAMPLES_FOR_FORGETTING: u8 = 100;

    /// Playback queue capacity (in chunks)
    pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

    /// Chunk memory the decoder may hold at once
    pub const DEFAULT_CHUNK_MEMORY_BUDGET: usize = 4 * 1024 * 1024;
}
