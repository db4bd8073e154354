//! Clock synchronization
//!
//! Time messages are turned into [`TimeSample`]s and fed to a [`TimeFilter`],
//! which the playback side queries for the server time of a local instant.

pub mod filter;

pub use filter::{TimeFilter, TimeFilterState};

use crate::protocol::{BaseMessage, Timestamp};

/// One clock offset observation derived from a time request round trip.
/// All values in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    /// Server clock minus client clock
    pub measurement: i64,
    /// Half the round-trip time; the offset is off by at most this much
    pub max_error: i64,
    /// Client time of the observation
    pub observed_at: i64,
}

impl TimeSample {
    /// Derive a sample from a time reply.
    ///
    /// `base` is the reply header as produced by the decoder (`sent` is the
    /// server send time, `received` the local arrival time) and `latency` the
    /// client-to-server latency the server measured for our request.
    pub fn from_round_trip(base: &BaseMessage, latency: Timestamp) -> Self {
        let client_to_server = latency.as_micros();
        let server_to_client = base.received.as_micros() - base.sent.as_micros();

        Self {
            measurement: (client_to_server - server_to_client) / 2,
            max_error: ((client_to_server + server_to_client) / 2).max(1),
            observed_at: base.received.as_micros(),
        }
    }

    /// Feed this sample to `filter`
    pub fn apply(&self, filter: &TimeFilter) -> Result<(), crate::error::FilterInputError> {
        filter.insert(self.measurement, self.max_error, self.observed_at)
    }
}
