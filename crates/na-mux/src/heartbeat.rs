//! Heartbeats over a dedicated typed stream.
//!
//! The requester writes an 8-byte sequence number and waits for the peer
//! to echo it; round-trip time is reported through a callback.  A reported
//! `Duration::ZERO` means the peer missed the tolerance window -- the
//! requester closes the session and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Instant, interval, timeout};
use tracing::debug;

use crate::{HEARTBEAT_TYPE, MuxError, MuxSession, TypedStream};

/// Called with each measured round-trip; `Duration::ZERO` signals timeout.
pub type OnBeat = Arc<dyn Fn(Duration) + Send + Sync>;

/// Drive heartbeats until the session dies or a beat times out.
///
/// On timeout the session is closed before returning, so a spawned
/// requester task doubles as the liveness watchdog.
pub async fn run_requester(
    session: MuxSession,
    beat_interval: Duration,
    tolerance: Duration,
    on_beat: OnBeat,
) -> Result<(), MuxError> {
    let mut stream = session.open_typed(HEARTBEAT_TYPE).await?;
    let mut ticks = interval(beat_interval);
    let mut seq: u64 = 0;

    loop {
        ticks.tick().await;
        seq = seq.wrapping_add(1);
        let started = Instant::now();
        stream.write_u64_le(seq).await?;
        stream.flush().await?;

        match timeout(tolerance, read_echo(&mut stream, seq)).await {
            Ok(Ok(())) => {
                on_beat(started.elapsed().max(Duration::from_nanos(1)));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(tolerance_ms = tolerance.as_millis() as u64, "heartbeat timed out");
                on_beat(Duration::ZERO);
                session.close();
                return Ok(());
            }
        }
    }
}

async fn read_echo(stream: &mut TypedStream, want: u64) -> Result<(), MuxError> {
    // Echoes always come back in order; skip any stale ones from a
    // previous, late-answered beat.
    loop {
        let got = stream.read_u64_le().await?;
        if got == want {
            return Ok(());
        }
    }
}

/// Echo side: answer each beat until the stream closes.  Servers run one
/// of these per accepted heartbeat stream.
pub async fn run_responder(mut stream: TypedStream) -> Result<(), MuxError> {
    loop {
        let mut buf = [0u8; 8];
        match stream.read_exact(&mut buf).await {
            Ok(_) => {
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
