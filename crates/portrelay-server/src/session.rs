//! Relay session: one accepted client paired with one dialed backend.
//!
//! The session dials the backend, then copies bytes in both directions:
//!
//! - `#1` forward: client → backend
//! - `#2` reverse: backend → client
//!
//! Both directions are polled together in the session task. When one side
//! reaches end-of-stream its FIN is forwarded to the other peer and the
//! remaining direction keeps running, so a client that half-closes still
//! gets the backend's reply. The session ends once both directions are done.
//! An I/O error, the idle watchdog or the cancel signal ends it at once and
//! drops whichever direction is still running.

use crate::shutdown::{self, ShutdownRx};
use portrelay_core::{BackendAddr, RelayError, RelayResult, RelaySettings};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Copy direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → backend.
    Forward,
    /// Backend → client.
    Reverse,
}

impl Direction {
    /// Log tag used in forwarding-failure messages.
    pub fn tag(self) -> &'static str {
        match self {
            Direction::Forward => "#1",
            Direction::Reverse => "#2",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The backend could not be dialed; only the client was open.
    DialFailed,
    /// Both directions reached end-of-stream.
    Closed,
    /// Reading or writing in this direction failed.
    Failed(Direction),
    /// Neither direction moved a byte within the idle timeout.
    IdleTimeout,
    /// Cancelled by the listener after the shutdown grace period.
    Shutdown,
}

/// Summary returned when a session finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    /// Bytes delivered client → backend.
    pub bytes_forward: u64,
    /// Bytes delivered backend → client.
    pub bytes_reverse: u64,
}

impl SessionOutcome {
    fn dial_failed() -> Self {
        Self {
            end: SessionEnd::DialFailed,
            bytes_forward: 0,
            bytes_reverse: 0,
        }
    }
}

/// One client connection and the backend it is relayed to.
pub struct RelaySession {
    client: TcpStream,
    peer: SocketAddr,
    backend: Arc<BackendAddr>,
    settings: Arc<RelaySettings>,
}

impl RelaySession {
    pub fn new(
        client: TcpStream,
        peer: SocketAddr,
        backend: Arc<BackendAddr>,
        settings: Arc<RelaySettings>,
    ) -> Self {
        Self {
            client,
            peer,
            backend,
            settings,
        }
    }

    /// Dial the backend and relay until both directions reach end-of-stream,
    /// an error occurs, the idle timeout fires, or `cancel` is signalled.
    ///
    /// Both connections are closed before this returns, on every path.
    pub async fn handle(self, mut cancel: ShutdownRx) -> SessionOutcome {
        let Self {
            mut client,
            peer,
            backend,
            settings,
        } = self;

        client.set_nodelay(true).ok();

        let mut upstream = match dial(&backend, settings.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer, backend = %backend, error = %e, "backend dial failed");
                close_stream(&mut client, "client", peer).await;
                return SessionOutcome::dial_failed();
            }
        };
        upstream.set_nodelay(true).ok();
        debug!(peer = %peer, backend = %backend, "session established");

        let activity = Activity::new();
        let mut bytes_forward = 0u64;
        let mut bytes_reverse = 0u64;

        let end = {
            let (mut client_rd, mut client_wr) = client.split();
            let (mut upstream_rd, mut upstream_wr) = upstream.split();

            let forward = copy_direction(
                &mut client_rd,
                &mut upstream_wr,
                settings.buffer_size,
                &activity,
                &mut bytes_forward,
            );
            let reverse = copy_direction(
                &mut upstream_rd,
                &mut client_wr,
                settings.buffer_size,
                &activity,
                &mut bytes_reverse,
            );
            tokio::pin!(forward);
            tokio::pin!(reverse);

            let mut forward_open = true;
            let mut reverse_open = true;

            loop {
                if !forward_open && !reverse_open {
                    break SessionEnd::Closed;
                }
                tokio::select! {
                    res = &mut forward, if forward_open => {
                        if let Err(end) = direction_end(Direction::Forward, res, peer, &backend) {
                            break end;
                        }
                        forward_open = false;
                    }
                    res = &mut reverse, if reverse_open => {
                        if let Err(end) = direction_end(Direction::Reverse, res, peer, &backend) {
                            break end;
                        }
                        reverse_open = false;
                    }
                    err = idle_watchdog(&activity, settings.idle_timeout) => {
                        warn!(peer = %peer, backend = %backend, error = %err, "session idle, closing");
                        break SessionEnd::IdleTimeout;
                    }
                    _ = shutdown::cancelled(&mut cancel) => {
                        info!(peer = %peer, backend = %backend, "session cancelled by shutdown");
                        break SessionEnd::Shutdown;
                    }
                }
            }
        };

        close_stream(&mut upstream, "backend", peer).await;
        close_stream(&mut client, "client", peer).await;

        let outcome = SessionOutcome {
            end,
            bytes_forward,
            bytes_reverse,
        };
        debug!(
            peer = %peer,
            backend = %backend,
            end = ?outcome.end,
            bytes_forward = outcome.bytes_forward,
            bytes_reverse = outcome.bytes_reverse,
            "session finished"
        );
        outcome
    }
}

/// Connect to the backend, bounded by `connect_timeout` when set.
///
/// A timeout is reported as [`RelayError::ConnectTimeout`], separate from
/// [`RelayError::Connect`].
pub async fn dial(backend: &BackendAddr, connect_timeout: Option<Duration>) -> RelayResult<TcpStream> {
    let addr = backend.to_string();
    let connect = TcpStream::connect(addr.as_str());
    let result = match connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, connect).await {
            Ok(res) => res,
            Err(_) => {
                return Err(RelayError::ConnectTimeout {
                    addr,
                    timeout: limit,
                })
            }
        },
        None => connect.await,
    };
    result.map_err(|source| RelayError::Connect { addr, source })
}

/// Log how one direction finished. `Err` carries the session end when the
/// direction failed and the whole session has to stop.
fn direction_end(
    direction: Direction,
    res: RelayResult<()>,
    peer: SocketAddr,
    backend: &BackendAddr,
) -> Result<(), SessionEnd> {
    match res {
        Ok(()) => {
            debug!(peer = %peer, backend = %backend, direction = direction.tag(), "end of stream, FIN forwarded");
            Ok(())
        }
        Err(e) => {
            warn!(
                peer = %peer,
                backend = %backend,
                error = %e,
                "{} forwarding failed",
                direction.tag()
            );
            Err(SessionEnd::Failed(direction))
        }
    }
}

/// Copy `reader` into `writer` until end-of-stream or an I/O error. On
/// end-of-stream the writer is shut down so the peer sees the FIN.
///
/// `copied` counts bytes fully written, and stays valid if the future is
/// dropped mid-copy.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    activity: &Activity,
    copied: &mut u64,
) -> RelayResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        activity.touch();
        *copied += n as u64;
    }
}

/// Last-I/O timestamp shared by both directions of one session.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Resolve with [`RelayError::IdleTimeout`] once no I/O happened in either
/// direction for `limit`. Never resolves when `limit` is `None`.
async fn idle_watchdog(activity: &Activity, limit: Option<Duration>) -> RelayError {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };
    loop {
        let deadline = activity.last() + limit;
        if Instant::now() >= deadline {
            return RelayError::IdleTimeout(limit);
        }
        tokio::time::sleep_until(deadline).await;
    }
}

async fn close_stream(stream: &mut TcpStream, side: &'static str, peer: SocketAddr) {
    match stream.shutdown().await {
        Ok(()) => info!(peer = %peer, side, "connection closed"),
        // Already shut down by a forwarded FIN, or reset by the peer.
        Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
            info!(peer = %peer, side, "connection closed")
        }
        Err(e) => warn!(peer = %peer, side, error = %e, "connection close failed"),
    }
}
