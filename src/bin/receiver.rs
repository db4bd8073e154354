//! Stream Receiver Application
//!
//! Connects to a stream server, keeps the local clock synchronized and
//! logs when each received chunk is due for playback.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snapsync_client::{
    audio::buffer::{create_shared_queue, SharedChunkQueue},
    config::AppConfig,
    error::ConnectionError,
    network::{Connection, PlayoutClock, Session},
    protocol::Timestamp,
};

/// Delay between reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Playback stand-in: takes chunks off the queue and reports their timing
fn run_scheduler(queue: SharedChunkQueue, clock: PlayoutClock, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        let Some(chunk) = queue.pop() else {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        };

        if !clock.is_synced() {
            tracing::debug!("Clock not synced yet, dropping chunk at {}", chunk.server_time());
            continue;
        }

        let play_at = clock.local_play_time(chunk.server_time());
        let now = Timestamp::now().as_micros();
        if play_at < now {
            tracing::debug!(
                "Chunk at {} is {} µs late, dropping",
                chunk.server_time(),
                now - play_at
            );
        } else {
            tracing::trace!(
                "Chunk at {} ({} {} bytes) plays in {} µs",
                chunk.server_time(),
                chunk.meta.codec,
                chunk.data.len(),
                play_at - now
            );
        }
    }
}

/// Serve one connection until it fails
async fn run_connection(config: &AppConfig, session: &mut Session) -> Result<(), ConnectionError> {
    let mut connection = Connection::connect(&config.server).await?;
    connection.send_hello(&config.client).await?;

    let mut time_sync =
        tokio::time::interval(Duration::from_millis(config.client.time_sync_interval_ms));
    let mut stats = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            bytes = connection.read() => {
                let bytes = bytes?;
                for error in session.receive(&bytes) {
                    tracing::warn!("Skipped frame from {}: {}", connection.peer(), error);
                }
            }
            _ = time_sync.tick() => {
                connection.send_time_request().await?;
            }
            _ = stats.tick() => {
                let decoder = session.decoder_stats();
                let session_stats = session.stats();
                let filter = session.clock().filter().snapshot();
                tracing::info!(
                    "Decoder stats: {} bytes, {} chunks, {} parse errors, {} dropped before codec header",
                    decoder.bytes_consumed,
                    decoder.wire_chunks,
                    decoder.parse_errors,
                    decoder.chunks_without_codec
                );
                tracing::info!(
                    "Sync stats: offset {:.0} µs, drift {:.3} ppm, {} samples ({} rejected)",
                    filter.offset,
                    filter.drift * 1e6,
                    session_stats.time_samples,
                    session_stats.time_samples_rejected
                );
                let queue = session.queue();
                tracing::info!(
                    "Queue stats: {}/{} chunks, {} overflows, {} underruns",
                    queue.len(),
                    queue.capacity(),
                    queue.overflow_count(),
                    queue.underrun_count()
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting stream receiver");

    let config = AppConfig::load_or_default()?;
    tracing::info!(
        "Server {}:{}, client {} ({})",
        config.server.host,
        config.server.port,
        config.client.name,
        config.client.id
    );

    let queue = create_shared_queue(config.playback.queue_capacity);
    let mut session = Session::from_config(&config, queue.clone());

    let running = Arc::new(AtomicBool::new(true));
    let scheduler = {
        let queue = queue.clone();
        let clock = session.clock().clone();
        let running = running.clone();
        std::thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || run_scheduler(queue, clock, running))?
    };

    loop {
        tokio::select! {
            result = run_connection(&config, &mut session) => {
                if let Err(e) = result {
                    tracing::warn!("Connection lost: {}", e);
                }
                session.reset();
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    if scheduler.join().is_err() {
        tracing::error!("Scheduler thread panicked");
    }
    Ok(())
}
