//! TCP server for chat connections.
//!
//! A single accept loop admits clients: it reserves a uid, registers the
//! session, and spawns one task per connection. Clients that arrive when
//! the roster or the uid space is full get a notice and are closed without
//! ever being registered.

use crate::config::Config;
use crate::handler::Connection;
use crate::protocol::{message, FrameCodec};
use crate::registry::RegistryError;
use crate::session::{Session, SessionWriter};
use crate::state::ChatState;
use crate::uid::{Uid, UidError};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace};

/// Why a connection was turned away
#[derive(Debug)]
pub enum AdmitError {
    Uid(UidError),
    Registry(RegistryError),
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::Uid(e) => write!(f, "{}", e),
            AdmitError::Registry(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AdmitError {}

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    state: Arc<ChatState>,
    codec: FrameCodec,
}

impl Server {
    /// Bind the listening socket. Must be called inside a Tokio runtime.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr = config
            .listen()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))?;
        let listener = TcpListener::from_std(create_listener(addr, config.backlog)?)?;

        Ok(Server {
            state: Arc::new(ChatState::new(config.max_clients)),
            codec: FrameCodec::new(config.max_payload),
            config,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ChatState> {
        &self.state
    }

    /// Accept connections until `shutdown` resolves, then stop every
    /// connection and wait for them to finish.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        info!(
            address = %self.local_addr()?,
            max_clients = self.state.registry.capacity(),
            max_payload = self.codec.max_payload(),
            backlog = self.config.backlog,
            "Server listening"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "New connection");
                        self.admit(stream, addr, &mut connections, &stop_rx).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        info!(connections = connections.len(), "Shutting down");
        // Receivers only fail to see this if they are already gone
        let _ = stop_tx.send(true);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task failed");
            }
        }
        Ok(())
    }

    async fn admit(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        connections: &mut JoinSet<()>,
        stop: &watch::Receiver<bool>,
    ) {
        let (reader, writer) = stream.into_split();

        let uid = match register(&self.state, addr, Box::new(writer)).await {
            Ok(uid) => uid,
            Err((e, mut writer)) => {
                info!(peer = %addr, reason = %e, "Rejecting connection");
                if let Ok(notice) = message("server is full\r\n") {
                    if let Err(e) = writer.write_all(&notice).await {
                        trace!(peer = %addr, error = %e, "Rejection notice not delivered");
                    }
                }
                if let Err(e) = writer.shutdown().await {
                    trace!(peer = %addr, error = %e, "Shutdown of rejected connection");
                }
                return;
            }
        };

        info!(peer = %addr, uid, "Accepted connection");
        let conn = Connection::new(Arc::clone(&self.state), uid, addr, reader, self.codec);
        connections.spawn(conn.run(stop.clone()));
    }
}

/// Reserve a uid and register a session for it. On failure the uid is
/// released again and the writer is handed back for the rejection notice.
pub async fn register(
    state: &ChatState,
    addr: SocketAddr,
    writer: SessionWriter,
) -> Result<Uid, (AdmitError, SessionWriter)> {
    let uid = match state.uids.allocate() {
        Ok(uid) => uid,
        Err(e) => return Err((AdmitError::Uid(e), writer)),
    };

    match state.registry.add(Session::new(uid, addr, writer)).await {
        Ok(()) => Ok(uid),
        Err((e, session)) => {
            if let Err(e) = state.uids.release(uid) {
                error!(uid, error = %e, "Uid release after rejection failed");
            }
            Err((AdmitError::Registry(e), session.writer))
        }
    }
}

/// Create the listening socket with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
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
    socket.listen(backlog)?;

    Ok(socket.into())
}
