//! Bidirectional relay with live traffic counters
//!
//! Copies between the client and the target, publishing byte counts as they
//! move so the session table can report them mid-flight.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Longest interval between idle checks
const MAX_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Both directions reached EOF
    Completed,
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
}

/// Result of a relay
#[derive(Debug, Clone, Copy)]
pub struct RelayOutcome {
    /// Client -> target
    pub upload: u64,
    /// Target -> client
    pub download: u64,
    pub end: RelayEnd,
}

pin_project! {
    /// Counts bytes read from the wrapped stream and stamps activity
    struct MeteredStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        // Milliseconds since start_time of the last successful read or write
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> MeteredStream<S> {
    fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            read_bytes,
        }
    }
}

fn touch(start_time: &Instant, last_activity: &AtomicU64) {
    last_activity.store(start_time.elapsed().as_millis() as u64, Ordering::Release);
}

impl<S: AsyncRead> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            if n > 0 {
                touch(this.start_time, this.last_activity);
                this.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                touch(this.start_time, this.last_activity);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Relay `client` <-> `target` until both sides close or the link idles out.
///
/// `upload` and `download` are incremented in real time, so a caller that
/// drops this future (for example on disconnect) still sees accurate totals.
pub async fn relay_bidirectional<A, B>(
    client: A,
    target: B,
    idle_timeout: Duration,
    upload: Arc<AtomicU64>,
    download: Arc<AtomicU64>,
) -> std::io::Result<RelayOutcome>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let upload_base = upload.load(Ordering::Relaxed);
    let download_base = download.load(Ordering::Relaxed);

    // Reading the client is upload, reading the target is download
    let mut client = MeteredStream::new(
        client,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&upload),
    );
    let mut target = MeteredStream::new(
        target,
        start_time,
        Arc::clone(&last_activity),
        Arc::clone(&download),
    );

    let copy_task = tokio::io::copy_bidirectional(&mut client, &mut target);

    let idle_ms = idle_timeout.as_millis() as u64;
    let check_every = idle_timeout
        .min(MAX_IDLE_CHECK_INTERVAL)
        .max(Duration::from_millis(10));
    let idle_check = async {
        let mut interval = tokio::time::interval(check_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let last = last_activity.load(Ordering::Acquire);
            let now = start_time.elapsed().as_millis() as u64;
            if now.saturating_sub(last) >= idle_ms {
                return;
            }
        }
    };

    let end = tokio::select! {
        result = copy_task => {
            result?;
            RelayEnd::Completed
        }
        _ = idle_check => RelayEnd::IdleTimeout,
    };

    Ok(RelayOutcome {
        upload: upload.load(Ordering::Relaxed) - upload_base,
        download: download.load(Ordering::Relaxed) - download_base,
        end,
    })
}
