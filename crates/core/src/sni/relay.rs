/// Byte relay between a client and a remote backend
///
/// Counters are updated as bytes move so a live relay can be inspected, and
/// the relay ends early when it sits idle too long or its session is aborted.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

const RELAY_BUF: usize = 16 * 1024;

/// Bytes moved in each direction, excluding any injected header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Live transfer counters of one relay
#[derive(Debug)]
pub struct RelayProgress {
    client_to_backend: AtomicU64,
    backend_to_client: AtomicU64,
    started: Instant,
    /// Milliseconds after `started` of the last transfer
    last_xmit_ms: AtomicU64,
}

impl Default for RelayProgress {
    fn default() -> Self {
        Self {
            client_to_backend: AtomicU64::new(0),
            backend_to_client: AtomicU64::new(0),
            started: Instant::now(),
            last_xmit_ms: AtomicU64::new(0),
        }
    }
}

impl RelayProgress {
    fn record(&self, counter: &AtomicU64, bytes: usize) {
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_xmit_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            client_to_backend: self.client_to_backend.load(Ordering::Relaxed),
            backend_to_client: self.backend_to_client.load(Ordering::Relaxed),
        }
    }

    /// Time since bytes last moved in either direction
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_xmit_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Both sides finished sending
    Closed,
    /// Nothing moved for the idle timeout
    Idle,
    /// The session's abort handle fired
    Aborted,
}

/// What a relay reports into and listens to
pub struct RelayControl {
    pub progress: Arc<RelayProgress>,
    /// Zero disables the idle check
    pub idle_timeout: Duration,
    pub abort: watch::Receiver<bool>,
}

/// Writes `header` then the buffered `preamble` to the backend, then copies
/// in both directions until both sides close, the relay goes idle, or it is
/// aborted.
pub async fn relay<C, B>(
    client: &mut C,
    backend: &mut B,
    header: &[u8],
    preamble: &[u8],
    control: RelayControl,
) -> io::Result<RelayEnd>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let RelayControl {
        progress,
        idle_timeout,
        mut abort,
    } = control;

    if !header.is_empty() {
        backend.write_all(header).await?;
    }
    backend.write_all(preamble).await?;
    backend.flush().await?;
    progress.record(&progress.client_to_backend, preamble.len());

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let copying = async {
        tokio::try_join!(
            pump(
                &mut client_rd,
                &mut backend_wr,
                &progress,
                &progress.client_to_backend
            ),
            pump(
                &mut backend_rd,
                &mut client_wr,
                &progress,
                &progress.backend_to_client
            ),
        )
    };

    tokio::select! {
        result = copying => result.map(|_| RelayEnd::Closed),
        _ = idle(&progress, idle_timeout) => Ok(RelayEnd::Idle),
        _ = aborted(&mut abort) => Ok(RelayEnd::Aborted),
    }
}

/// Copies one direction; forwards EOF as a write shutdown.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    progress: &RelayProgress,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        progress.record(counter, n);
    }
}

async fn idle(progress: &RelayProgress, limit: Duration) {
    if limit.is_zero() {
        return std::future::pending().await;
    }
    loop {
        let quiet = progress.idle_for();
        if quiet >= limit {
            return;
        }
        tokio::time::sleep(limit - quiet).await;
    }
}

async fn aborted(abort: &mut watch::Receiver<bool>) {
    // A dropped sender means nobody can abort any more.
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}
