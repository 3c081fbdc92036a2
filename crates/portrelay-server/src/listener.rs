//! Port listener: one listening socket per mapping entry.
//!
//! The accept loop hands every connection to a [`RelaySession`] running in
//! the listener's own [`JoinSet`]. On shutdown the listener stops accepting
//! and lets its sessions run to completion for up to the grace period; only
//! the sessions still open after that are cancelled.
//!
//! Accept errors are classified with [`classify_accept_error`]: per-connection
//! and network hiccups are logged and skipped, descriptor/memory exhaustion
//! backs off briefly, and anything else stops this listener only.

use crate::limiter::SessionLimiter;
use crate::session::{RelaySession, SessionOutcome};
use crate::shutdown::{self, ShutdownRx, ShutdownTx};
use portrelay_core::{BackendAddr, MappingEntry, RelayError, RelayResult, RelaySettings};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after an accept failed for lack of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long cancelled sessions get to close their sockets before being aborted.
const CANCEL_WAIT: Duration = Duration::from_secs(1);

/// How a listener task finished.
#[derive(Debug)]
pub enum ListenerExit {
    /// The port could not be bound; the mapping stays inactive.
    BindFailed(RelayError),
    /// Shutdown was requested and in-flight sessions were drained.
    Shutdown,
    /// A non-recoverable accept error stopped the loop.
    Failed(RelayError),
}

/// Accept error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorClass {
    /// Affects one pending connection only; keep accepting.
    Transient,
    /// Out of descriptors, buffers or memory; keep accepting after a pause.
    ResourceExhausted,
    /// The listening socket itself is broken.
    Fatal,
}

#[cfg(unix)]
fn classify_os_error(code: i32) -> Option<AcceptErrorClass> {
    match code {
        libc::ENOMEM | libc::ENFILE | libc::EMFILE | libc::ENOBUFS => {
            Some(AcceptErrorClass::ResourceExhausted)
        }
        libc::EPROTO
        | libc::ENOPROTOOPT
        | libc::EOPNOTSUPP
        | libc::ENETDOWN
        | libc::ENETUNREACH
        | libc::EHOSTDOWN
        | libc::EHOSTUNREACH => Some(AcceptErrorClass::Transient),
        #[cfg(target_os = "linux")]
        libc::ENONET => Some(AcceptErrorClass::Transient),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_os_error(_code: i32) -> Option<AcceptErrorClass> {
    None
}

/// Decide whether the accept loop may continue after `err`.
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorClass {
    use io::ErrorKind::*;

    match err.kind() {
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
        | TimedOut => return AcceptErrorClass::Transient,
        OutOfMemory => return AcceptErrorClass::ResourceExhausted,
        _ => {}
    }

    err.raw_os_error()
        .and_then(classify_os_error)
        .unwrap_or(AcceptErrorClass::Fatal)
}

/// Owns the listening socket for one mapping entry.
pub struct PortListener {
    listener: TcpListener,
    port: u16,
    backend: Arc<BackendAddr>,
    settings: Arc<RelaySettings>,
    limiter: SessionLimiter,
}

impl PortListener {
    /// Bind, then run the accept loop until shutdown or a fatal accept error.
    ///
    /// A bind failure is logged and returned as [`ListenerExit::BindFailed`];
    /// it is never retried.
    pub async fn start(
        entry: MappingEntry,
        settings: Arc<RelaySettings>,
        shutdown: ShutdownRx,
    ) -> ListenerExit {
        match Self::bind(&entry, settings).await {
            Ok(listener) => listener.run(shutdown).await,
            Err(e) => {
                warn!(port = entry.listen_port, backend = %entry.backend, error = %e, "listen bind failed");
                ListenerExit::BindFailed(e)
            }
        }
    }

    /// Bind `<bind_address>:<listen_port>`.
    pub async fn bind(entry: &MappingEntry, settings: Arc<RelaySettings>) -> RelayResult<Self> {
        let addr = listen_addr(&settings.bind_address, entry.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                port: entry.listen_port,
                source,
            })?;

        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(entry.listen_port);

        info!(
            addr = %addr,
            port,
            backend = %entry.backend,
            "relay listener started"
        );

        Ok(Self {
            listener,
            port,
            backend: Arc::new(entry.backend.clone()),
            limiter: SessionLimiter::new(settings.max_sessions_per_listener),
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Returns once shutdown is requested (after draining
    /// sessions) or a fatal accept error occurs (sessions keep running).
    ///
    /// Sessions never see `shutdown` directly; they are cancelled through a
    /// listener-local channel once the grace period has run out.
    pub async fn run(self, mut shutdown: ShutdownRx) -> ListenerExit {
        let Self {
            listener,
            port,
            backend,
            settings,
            limiter,
        } = self;
        let mut sessions: JoinSet<SessionOutcome> = JoinSet::new();
        let (cancel_tx, cancel_rx) = shutdown::channel();

        let exit = loop {
            tokio::select! {
                _ = shutdown::cancelled(&mut shutdown) => {
                    debug!(port, "accept loop cancelled");
                    break ListenerExit::Shutdown;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(port, error = %e, "session task failed");
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = SessionContext {
                                port,
                                backend: &backend,
                                settings: &settings,
                                limiter: &limiter,
                            };
                            ctx.spawn(&mut sessions, stream, peer, cancel_rx.clone());
                        }
                        Err(e) => match classify_accept_error(&e) {
                            AcceptErrorClass::Transient => {
                                warn!(port, error = %e, "accept failed");
                            }
                            AcceptErrorClass::ResourceExhausted => {
                                warn!(port, error = %e, "accept failed, backing off");
                                if back_off(&mut shutdown).await {
                                    debug!(port, "accept loop cancelled during backoff");
                                    break ListenerExit::Shutdown;
                                }
                            }
                            AcceptErrorClass::Fatal => {
                                error!(port, error = %e, "accept failed, stopping listener");
                                break ListenerExit::Failed(RelayError::Accept(e));
                            }
                        },
                    }
                }
            }
        };

        drop(listener);
        info!(port, backend = %backend, "relay listener closed");

        match exit {
            ListenerExit::Shutdown => {
                drain(&mut sessions, port, settings.shutdown_grace, &cancel_tx).await
            }
            // Dropping `cancel_tx` does not cancel the detached sessions.
            _ => sessions.detach_all(),
        }
        exit
    }
}

/// Borrowed listener state needed to admit one connection.
struct SessionContext<'a> {
    port: u16,
    backend: &'a Arc<BackendAddr>,
    settings: &'a Arc<RelaySettings>,
    limiter: &'a SessionLimiter,
}

impl SessionContext<'_> {
    fn spawn(
        &self,
        sessions: &mut JoinSet<SessionOutcome>,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: ShutdownRx,
    ) {
        let guard = match self.limiter.try_acquire() {
            Ok(guard) => guard,
            Err(reason) => {
                warn!(port = self.port, peer = %peer, reason = %reason, "connection rejected");
                drop(stream);
                return;
            }
        };

        debug!(
            port = self.port,
            peer = %peer,
            active = self.limiter.active_sessions(),
            "connection accepted"
        );

        let session = RelaySession::new(
            stream,
            peer,
            Arc::clone(self.backend),
            Arc::clone(self.settings),
        );
        sessions.spawn(async move {
            let _guard = guard; // slot held until the session ends
            session.handle(cancel).await
        });
    }
}

/// Sleep for [`ACCEPT_BACKOFF`]. Returns `true` if shutdown was requested
/// in the meantime.
async fn back_off(shutdown: &mut ShutdownRx) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
        _ = shutdown::cancelled(shutdown) => true,
    }
}

/// Let in-flight sessions finish on their own for up to `grace`, then cancel
/// the rest and abort whatever still has not closed after [`CANCEL_WAIT`].
async fn drain(
    sessions: &mut JoinSet<SessionOutcome>,
    port: u16,
    grace: Duration,
    cancel: &ShutdownTx,
) {
    if sessions.is_empty() {
        return;
    }
    debug!(port, in_flight = sessions.len(), "draining sessions");
    if join_all(sessions, grace).await {
        return;
    }

    warn!(port, remaining = sessions.len(), "grace period elapsed, cancelling sessions");
    cancel.send_replace(true);
    if !join_all(sessions, CANCEL_WAIT).await {
        warn!(port, remaining = sessions.len(), "sessions did not stop, aborting");
        sessions.shutdown().await;
    }
}

/// `true` if every session finished within `limit`.
async fn join_all(sessions: &mut JoinSet<SessionOutcome>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while sessions.join_next().await.is_some() {}
    })
    .await
    .is_ok()
}

fn listen_addr(bind_address: &str, port: u16) -> String {
    if bind_address.contains(':') && !bind_address.starts_with('[') {
        format!("[{}]:{}", bind_address, port)
    } else {
        format!("{}:{}", bind_address, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn settings() -> Arc<RelaySettings> {
        Arc::new(RelaySettings {
            bind_address: "127.0.0.1".to_string(),
            connect_timeout: Some(Duration::from_secs(2)),
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        })
    }

    fn entry(backend: SocketAddr) -> MappingEntry {
        MappingEntry {
            listen_port: 0,
            backend: backend.to_string().parse().unwrap(),
        }
    }

    /// Backend that replies `<tag>:<bytes received>` once per read.
    async fn tagged_echo(tag: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        let mut reply = format!("{tag}:").into_bytes();
                        reply.extend_from_slice(&buf[..n]);
                        if stream.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn unused_addr() -> SocketAddr {
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        vacant.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_relays_through_listener() {
        let backend = tagged_echo("db").await;
        let listener = PortListener::bind(&entry(backend), settings()).await.unwrap();
        let front = listener.local_addr().unwrap();
        let (_tx, rx) = shutdown::channel();
        tokio::spawn(listener.run(rx));

        let mut client = TcpStream::connect(front).await.unwrap();
        client.write_all(b"SELECT 1").await.unwrap();
        let mut reply = [0u8; 11];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"db:SELECT 1");
    }

    #[tokio::test]
    async fn test_unreachable_backend_keeps_accepting() {
        let backend = unused_addr().await;
        let listener = PortListener::bind(&entry(backend), settings()).await.unwrap();
        let front = listener.local_addr().unwrap();
        let (_tx, rx) = shutdown::channel();
        let task = tokio::spawn(listener.run(rx));

        for _ in 0..3 {
            let mut client = TcpStream::connect(front).await.unwrap();
            let mut buf = Vec::new();
            let n = tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut buf))
                .await
                .expect("relay should close the client")
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let mapping = MappingEntry {
            listen_port: port,
            backend: "127.0.0.1:9".parse().unwrap(),
        };
        let (_tx, rx) = shutdown::channel();
        match PortListener::start(mapping, settings(), rx).await {
            ListenerExit::BindFailed(RelayError::Bind { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected bind failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_cap_rejects_extra_clients() {
        let backend = tagged_echo("b").await;
        let mut s = (*settings()).clone();
        s.max_sessions_per_listener = 1;
        let listener = PortListener::bind(&entry(backend), Arc::new(s)).await.unwrap();
        let front = listener.local_addr().unwrap();
        let (_tx, rx) = shutdown::channel();
        tokio::spawn(listener.run(rx));

        let mut first = TcpStream::connect(front).await.unwrap();
        first.write_all(b"x").await.unwrap();
        let mut reply = [0u8; 3];
        first.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"b:x");

        let mut second = TcpStream::connect(front).await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), second.read_to_end(&mut buf))
            .await
            .expect("rejected client should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The admitted session is unaffected.
        first.write_all(b"y").await.unwrap();
        first.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"b:y");
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener_and_sessions() {
        let backend = tagged_echo("b").await;
        let listener = PortListener::bind(&entry(backend), settings()).await.unwrap();
        let front = listener.local_addr().unwrap();
        let (tx, rx) = shutdown::channel();
        let task = tokio::spawn(listener.run(rx));

        let mut client = TcpStream::connect(front).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();

        tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener should stop")
            .unwrap();
        assert!(matches!(exit, ListenerExit::Shutdown), "got {exit:?}");

        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(front).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_lets_sessions_finish_within_grace() {
        // Backend that answers 200 ms after the request.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            stream.write_all(b"done:").await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut s = (*settings()).clone();
        s.shutdown_grace = Duration::from_secs(2);
        let listener = PortListener::bind(&entry(backend), Arc::new(s)).await.unwrap();
        let front = listener.local_addr().unwrap();
        let (tx, rx) = shutdown::channel();
        let task = tokio::spawn(listener.run(rx));

        let mut client = TcpStream::connect(front).await.unwrap();
        client.write_all(b"flush").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        // New connections are refused while the session is still draining.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(front).await.is_err());

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .expect("reply should arrive during the grace period")
            .unwrap();
        assert_eq!(reply, b"done:flush");
        drop(client);

        let exit = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("listener should stop once the session is done")
            .unwrap();
        assert!(matches!(exit, ListenerExit::Shutdown), "got {exit:?}");
    }

    #[test]
    fn test_classify_accept_errors() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_accept_error(&aborted), AcceptErrorClass::Transient);

        let interrupted = io::Error::from(io::ErrorKind::Interrupted);
        assert_eq!(classify_accept_error(&interrupted), AcceptErrorClass::Transient);

        let invalid = io::Error::new(io::ErrorKind::InvalidInput, "bad socket");
        assert_eq!(classify_accept_error(&invalid), AcceptErrorClass::Fatal);
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_os_errors() {
        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify_accept_error(&emfile), AcceptErrorClass::ResourceExhausted);

        let enobufs = io::Error::from_raw_os_error(libc::ENOBUFS);
        assert_eq!(classify_accept_error(&enobufs), AcceptErrorClass::ResourceExhausted);

        let eproto = io::Error::from_raw_os_error(libc::EPROTO);
        assert_eq!(classify_accept_error(&eproto), AcceptErrorClass::Transient);

        let ebadf = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(classify_accept_error(&ebadf), AcceptErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_back_off_stops_on_shutdown() {
        let (tx, mut rx) = shutdown::channel();
        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(ACCEPT_BACKOFF / 2, back_off(&mut rx))
            .await
            .expect("backoff should end as soon as shutdown is requested");
        assert!(stopped);

        let (_tx, mut rx) = shutdown::channel();
        assert!(!back_off(&mut rx).await);
    }

    #[test]
    fn test_listen_addr_brackets_ipv6() {
        assert_eq!(listen_addr("0.0.0.0", 80), "0.0.0.0:80");
        assert_eq!(listen_addr("::", 80), "[::]:80");
        assert_eq!(listen_addr("[::1]", 80), "[::1]:80");
    }
}
