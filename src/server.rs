//! TCP server for proverb sessions.
//!
//! Binds the listening socket, accepts connections indefinitely and hands
//! each one to its own detached [`Session`] task.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::session::{Session, SessionEnd};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause before accepting again after running out of descriptors or memory
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    catalog: Catalog,
    next_session_id: AtomicU64,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, catalog: Catalog) -> Self {
        Server {
            config,
            catalog,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Bind the listening socket. Must be called from within a tokio runtime.
    ///
    /// `SO_REUSEPORT` is left unset so an occupied port fails with `AddrInUse`.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let listener = create_listener(self.config.listen, self.config.backlog)?;
        let listener = TcpListener::from_std(listener)?;
        info!(address = %listener.local_addr()?, "Server listening");
        Ok(listener)
    }

    /// Bind and serve until a fatal accept error.
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections until the listener fails fatally.
    ///
    /// Transient accept errors are logged and the loop continues; sessions
    /// already running are never affected by accept failures.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    self.spawn_session(stream, addr);
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    if is_resource_exhaustion(&e) {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Listener failed");
                    return Err(e);
                }
            }
        }
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("session", id, %peer);
        let session = Session::start(stream, self.catalog.clone(), self.config.interval);

        tokio::spawn(
            async move {
                debug!("Session started");
                let summary = session.run().await;
                match summary.end {
                    SessionEnd::Finished | SessionEnd::PeerClosed => {
                        debug!(
                            reason = %summary.end,
                            messages = summary.messages_sent,
                            "Session closed"
                        );
                    }
                    SessionEnd::ReadFailed(_) | SessionEnd::WriteFailed(_) => {
                        info!(
                            reason = %summary.end,
                            messages = summary.messages_sent,
                            "Session closed after I/O error"
                        );
                    }
                }
            }
            .instrument(span),
        );
    }
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}

/// Errors that concern a single pending connection or a temporary shortage,
/// not the listening socket itself.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhaustion(e)
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
