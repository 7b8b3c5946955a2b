//! Per-connection control loop.
//!
//! A connection moves through `Joining -> Active -> Disconnecting ->
//! Closed`. While active it reads frames, hands commands to the dispatcher
//! and relays chat lines according to the session's current mode. Any read
//! failure, protocol violation or failed reply on its own connection ends
//! the session without touching the others.

use crate::command::{self, Command, Outcome};
use crate::protocol::{decode, message, Frame, FrameCodec, FrameError, FrameKind};
use crate::relay::{self, RelayError};
use crate::session::ChatMode;
use crate::state::ChatState;
use crate::uid::Uid;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Errors that end a session
#[derive(Debug)]
pub enum SessionError {
    /// Malformed or oversized frame.
    Protocol(FrameError),
    /// Failed delivery on the session's own connection.
    Relay(RelayError),
    /// Read failure.
    Io(std::io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            SessionError::Relay(e) => write!(f, "Relay error: {}", e),
            SessionError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Protocol(e) => Some(e),
            SessionError::Relay(e) => Some(e),
            SessionError::Io(e) => Some(e),
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<RelayError> for SessionError {
    fn from(e: RelayError) -> Self {
        SessionError::Relay(e)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Joining,
    Active,
    Disconnecting,
    Closed,
}

/// Why the active loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    EndOfStream,
    Quit,
    Shutdown,
}

/// Read side of one admitted client plus what it needs to act on the roster.
pub struct Connection<R> {
    state: Arc<ChatState>,
    uid: Uid,
    addr: SocketAddr,
    reader: R,
    buffer: BytesMut,
    codec: FrameCodec,
    phase: Phase,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    /// The session for `uid` must already be registered.
    pub fn new(state: Arc<ChatState>, uid: Uid, addr: SocketAddr, reader: R, codec: FrameCodec) -> Self {
        Self {
            state,
            uid,
            addr,
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            codec,
            phase: Phase::Joining,
        }
    }

    /// Drive the connection until it is closed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.phase = match self.phase {
                Phase::Joining => match self.join().await {
                    Ok(()) => Phase::Active,
                    Err(e) => {
                        debug!(uid = self.uid, error = %e, "Join failed");
                        Phase::Disconnecting
                    }
                },

                Phase::Active => match self.step(&mut shutdown).await {
                    Ok(Step::Continue) => Phase::Active,
                    Ok(step) => {
                        trace!(uid = self.uid, ?step, "Leaving active loop");
                        Phase::Disconnecting
                    }
                    Err(SessionError::Protocol(e)) => {
                        warn!(uid = self.uid, peer = %self.addr, error = %e, "Protocol error");
                        Phase::Disconnecting
                    }
                    Err(e) => {
                        debug!(uid = self.uid, error = %e, "Connection error");
                        Phase::Disconnecting
                    }
                },

                Phase::Disconnecting => {
                    self.teardown().await;
                    Phase::Closed
                }

                Phase::Closed => break,
            };
        }
    }

    async fn join(&mut self) -> Result<(), SessionError> {
        let registry = &self.state.registry;
        let name = registry
            .find(self.uid, |s| s.name.clone())
            .await
            .ok_or(RelayError::Unreachable(self.uid))?;

        info!(uid = self.uid, peer = %self.addr, "Client joined");
        relay::broadcast(registry, &message(&format!("{name} has joined\r\n"))?).await;

        if let Some(topic) = self.state.room.get().await {
            relay::reply(registry, &message(&format!("topic: {topic}\r\n"))?, self.uid).await?;
        }
        relay::reply(registry, &message("see /help for assistance\r\n")?, self.uid).await?;
        Ok(())
    }

    /// Handle one buffered frame, or wait for more input.
    async fn step(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Step, SessionError> {
        if let Some(frame) = self.codec.next_frame(&mut self.buffer)? {
            return self.handle_frame(frame).await;
        }

        if *shutdown.borrow() {
            return Ok(Step::Shutdown);
        }

        tokio::select! {
            read = self.reader.read_buf(&mut self.buffer) => {
                if read? == 0 {
                    if !self.buffer.is_empty() {
                        // Stream ended inside a frame
                        decode(&self.buffer)?;
                    }
                    return Ok(Step::EndOfStream);
                }
                Ok(Step::Continue)
            }
            _ = shutdown.changed() => Ok(Step::Shutdown),
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Step, SessionError> {
        match frame.kind {
            FrameKind::Command => {
                let command = Command::parse(&frame.text());
                match command::dispatch(&self.state, self.uid, command).await? {
                    Outcome::Quit => Ok(Step::Quit),
                    Outcome::Continue | Outcome::Failed => Ok(Step::Continue),
                }
            }

            FrameKind::Message => {
                self.relay_chat(&frame.text()).await?;
                Ok(Step::Continue)
            }

            FrameKind::Other(tag) => {
                debug!(uid = self.uid, tag, "Unknown frame kind");
                relay::reply(&self.state.registry, &message("unknown message\r\n")?, self.uid).await?;
                Ok(Step::Continue)
            }
        }
    }

    async fn relay_chat(&self, text: &str) -> Result<(), SessionError> {
        if text.is_empty() {
            return Ok(());
        }

        // Mode and peer are read under the same guard the line is sent through
        let mut roster = self.state.registry.lock().await;
        let (mode, peer, line) = {
            let sender = roster.get(self.uid).ok_or(RelayError::Unreachable(self.uid))?;
            let line = message(&format!("[{}] {text}\r\n", sender.name))?;
            (sender.mode, sender.peer_uid, line)
        };

        match mode {
            ChatMode::Private => {
                debug!(from = self.uid, to = peer, "Private send");
                relay::unicast_in(&mut roster, &line, peer).await;
            }
            ChatMode::Common => {
                debug!(from = self.uid, "Common send");
                relay::fan_out(&mut roster, &line, Some(self.uid)).await;
            }
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        let uid = self.uid;

        // Unpairing, the leave notice and removal form one roster step, so
        // nobody can pair with this session once teardown has begun.
        let departed = {
            let mut roster = self.state.registry.lock().await;
            let name = roster
                .get(uid)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| uid.to_string());

            if let Some(unpaired) = roster.unpair(uid) {
                if unpaired.peer_released {
                    if let Ok(notice) = message("end private talk!\r\n") {
                        relay::unicast_in(&mut roster, &notice, unpaired.former_peer).await;
                    }
                }
            }

            if let Ok(notice) = message(&format!("{name} has left\r\n")) {
                relay::fan_out(&mut roster, &notice, None).await;
            }

            roster.remove(uid)
        };

        if let Some(mut session) = departed {
            if let Err(e) = session.writer.shutdown().await {
                trace!(uid, error = %e, "Shutdown of closed connection");
            }
        }

        if let Err(e) = self.state.uids.release(uid) {
            warn!(uid, error = %e, "Uid release failed");
        }

        info!(uid, peer = %self.addr, "Client quit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use crate::session::Session;
    use tokio::io::DuplexStream;
    use tokio_test::io::Builder;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn admit(state: &ChatState, uid: Uid) -> DuplexStream {
        assert!(state.uids.try_reserve(uid));
        let (client, server) = tokio::io::duplex(8192);
        state
            .registry
            .add(Session::new(uid, addr(), Box::new(server)))
            .await
            .unwrap();
        client
    }

    async fn read_text(client: &mut DuplexStream) -> Option<String> {
        let mut header = [0u8; 3];
        client.read_exact(&mut header).await.ok()?;
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(3 + len, 0);
        client.read_exact(&mut frame[3..]).await.ok()?;
        Some(String::from_utf8(decode(&frame).unwrap().payload.to_vec()).unwrap())
    }

    fn frame(kind: FrameKind, text: &str) -> Vec<u8> {
        encode(kind, text.as_bytes()).unwrap().to_vec()
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_message_lifecycle() {
        let state = Arc::new(ChatState::new(4));
        let mut a = admit(&state, 10).await;
        let mut b = admit(&state, 11).await;

        let reader = Builder::new()
            .read(&frame(FrameKind::Message, "hi\n\0"))
            .build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(1024))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut a).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "see /help for assistance\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "10 has left\r\n");
        assert_eq!(read_text(&mut a).await, None);

        assert_eq!(read_text(&mut b).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "[10] hi\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "10 has left\r\n");

        assert!(state.registry.find(10, |_| ()).await.is_none());
        assert!(!state.uids.is_reserved(10));
        assert!(state.uids.is_reserved(11));
    }

    #[tokio::test]
    async fn test_join_sends_topic() {
        let state = Arc::new(ChatState::new(4));
        state.room.set("rustaceans").await;
        let mut a = admit(&state, 10).await;

        let reader = Builder::new().build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(1024))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut a).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "topic: rustaceans\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "see /help for assistance\r\n");
    }

    #[tokio::test]
    async fn test_quit_command_stops_reading() {
        let state = Arc::new(ChatState::new(4));
        let mut a = admit(&state, 10).await;
        let mut b = admit(&state, 11).await;

        let reader = Builder::new()
            .read(&frame(FrameKind::Command, "/quit"))
            .build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(1024))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut b).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "10 has left\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "10 has joined\r\n");
        assert_eq!(state.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_gets_reply() {
        let state = Arc::new(ChatState::new(4));
        let mut a = admit(&state, 10).await;

        let reader = Builder::new().read(&[9, 0, 1, b'x']).build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(1024))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut a).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "see /help for assistance\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "unknown message\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "10 has left\r\n");
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let state = Arc::new(ChatState::new(4));
        let _a = admit(&state, 10).await;
        let mut b = admit(&state, 11).await;

        let bytes = frame(FrameKind::Message, "split");
        let reader = Builder::new().read(&bytes[..2]).read(&bytes[2..5]).read(&bytes[5..]).build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(1024))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut b).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "[10] split\r\n");
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let state = Arc::new(ChatState::new(4));
        let _a = admit(&state, 10).await;
        let mut b = admit(&state, 11).await;

        let reader = Builder::new()
            .read(&frame(FrameKind::Message, "this is far too long"))
            .build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(8))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut b).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "10 has left\r\n");
        assert!(!state.uids.is_reserved(10));
    }

    #[tokio::test]
    async fn test_disconnect_releases_private_peer() {
        let state = Arc::new(ChatState::new(4));
        let _a = admit(&state, 10).await;
        let mut b = admit(&state, 11).await;
        state.registry.pair(10, 11).await.unwrap();

        let reader = Builder::new().build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(1024))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut b).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "end private talk!\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "10 has left\r\n");
        let mode = state.registry.find(11, |s| s.mode).await.unwrap();
        assert_eq!(mode, ChatMode::Common);
    }

    #[tokio::test]
    async fn test_shutdown_signal_disconnects() {
        let state = Arc::new(ChatState::new(4));
        let mut a = admit(&state, 10).await;
        let (tx, rx) = watch::channel(false);

        // Reader that never produces data
        let (_idle_client, idle_server) = tokio::io::duplex(64);
        let conn = Connection::new(Arc::clone(&state), 10, addr(), idle_server, FrameCodec::new(1024));
        let task = tokio::spawn(conn.run(rx));

        assert_eq!(read_text(&mut a).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut a).await.unwrap(), "see /help for assistance\r\n");
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(read_text(&mut a).await.unwrap(), "10 has left\r\n");
        assert_eq!(state.registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_private_line_reaches_only_the_peer() {
        let state = Arc::new(ChatState::new(4));
        let _a = admit(&state, 10).await;
        let mut b = admit(&state, 11).await;
        let mut c = admit(&state, 12).await;
        state.registry.pair(10, 11).await.unwrap();

        let reader = Builder::new().read(&frame(FrameKind::Message, "secret")).build();
        Connection::new(Arc::clone(&state), 10, addr(), reader, FrameCodec::new(1024))
            .run(no_shutdown())
            .await;

        assert_eq!(read_text(&mut b).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "[10] secret\r\n");
        assert_eq!(read_text(&mut c).await.unwrap(), "10 has joined\r\n");
        assert_eq!(read_text(&mut c).await.unwrap(), "10 has left\r\n");
    }

    #[tokio::test]
    async fn test_pairing_with_departing_session_is_refused() {
        let state = Arc::new(ChatState::new(4));
        let _a = admit(&state, 10).await;
        let mut b = admit(&state, 11).await;

        // A slow reader whose pipe is already full stalls the leave notice
        assert!(state.uids.try_reserve(12));
        let (mut slow, slow_server) = tokio::io::duplex(16);
        state
            .registry
            .add(Session::new(12, addr(), Box::new(slow_server)))
            .await
            .unwrap();
        relay::send_to(&state.registry, &message("0123456789abc").unwrap(), 12)
            .await
            .unwrap();

        let (_idle_client, idle_server) = tokio::io::duplex(64);
        let mut leaving = Connection::new(Arc::clone(&state), 10, addr(), idle_server, FrameCodec::new(1024));
        let teardown = tokio::spawn(async move { leaving.teardown().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let invite = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { command::dispatch(&state, 11, Command::parse("/msg 10")).await.unwrap() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(read_text(&mut slow).await.unwrap(), "0123456789abc");
        assert_eq!(read_text(&mut slow).await.unwrap(), "10 has left\r\n");
        teardown.await.unwrap();
        assert_eq!(invite.await.unwrap(), Outcome::Failed);

        assert_eq!(read_text(&mut b).await.unwrap(), "10 has left\r\n");
        assert_eq!(read_text(&mut b).await.unwrap(), "no such user: 10\r\n");
        let pairing = state.registry.find(11, |s| (s.mode, s.peer_uid)).await.unwrap();
        assert_eq!(pairing, (ChatMode::Common, crate::uid::INVALID_UID));

        assert!(!state.uids.is_reserved(10));
    }
}
