//! Control connection handling

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::protocol::{Command, ServerMessage, MAX_MESSAGE_SIZE};
use crate::registry::Tunnel;
use crate::server::ServerState;

/// Something the client did on an established control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// EOF or read error
    Closed,
    /// Client sent CLOSE
    CloseRequested,
}

/// The client's control connection.
///
/// Owned by exactly one session, and by the coordinator of that session's
/// tunnel while it runs.
pub struct ControlChannel {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    buf: Vec<u8>,
}

impl ControlChannel {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            peer_addr,
            buf: vec![0u8; MAX_MESSAGE_SIZE],
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one message. `None` means the client closed the connection.
    ///
    /// Cancel safe: a message is either fully returned or left unread.
    pub async fn read_message(&mut self) -> io::Result<Option<String>> {
        let n = self.reader.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&self.buf[..n]).into_owned()))
    }

    pub async fn send(&mut self, message: &ServerMessage) -> io::Result<()> {
        self.writer.write_all(&message.to_bytes()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await
    }

    /// Wait for the client to close the connection or request CLOSE.
    ///
    /// Anything else the client sends counts as keepalive and is ignored.
    pub async fn next_event(&mut self) -> ControlEvent {
        loop {
            match self.read_message().await {
                Ok(Some(message)) => {
                    if message
                        .lines()
                        .any(|line| matches!(Command::parse(line), Ok(Command::Close)))
                    {
                        return ControlEvent::CloseRequested;
                    }
                    tracing::trace!(peer_addr = %self.peer_addr, len = message.len(), "Keepalive on control connection");
                }
                Ok(None) => return ControlEvent::Closed,
                Err(e) => {
                    tracing::debug!(peer_addr = %self.peer_addr, error = %e, "Control connection read failed");
                    return ControlEvent::Closed;
                }
            }
        }
    }

    /// Flush our side and close
    pub async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Render a registry snapshot for a LIST reply: a JSON array and a newline
pub fn render_listing(tunnels: &[Tunnel]) -> Vec<u8> {
    // Tunnel contains only plain fields; serialization cannot fail
    let mut out = serde_json::to_vec(tunnels).unwrap_or_else(|_| b"[]".to_vec());
    out.push(b'\n');
    out
}

/// Handle a single control connection
pub async fn handle_control(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> anyhow::Result<()> {
    tracing::debug!(%peer_addr, "New control connection");

    let mut control = ControlChannel::new(stream, peer_addr);

    // Read the command with timeout
    let raw = match timeout(state.config.recv_timeout, control.read_message()).await {
        Ok(Ok(Some(raw))) => raw,
        Ok(Ok(None)) => {
            tracing::debug!(%peer_addr, "Connection closed before command");
            return Ok(());
        }
        Ok(Err(e)) => {
            tracing::debug!(%peer_addr, error = %e, "Read error");
            return Err(e.into());
        }
        Err(_) => {
            tracing::debug!(%peer_addr, "Command timeout");
            return Ok(());
        }
    };

    let command = match Command::parse(&raw) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!(%peer_addr, error = %e, "Malformed command, dropping connection");
            return Ok(());
        }
    };

    tracing::info!(%peer_addr, ?command, "Client command");

    match command {
        Command::Open {
            username,
            password,
            port,
        } => open_tunnel(control, &username, &password, port, state).await,

        Command::List => {
            let listing = render_listing(&state.registry.snapshot());
            control.send_raw(&listing).await?;
            control.shutdown().await;
            Ok(())
        }

        Command::Close => {
            tracing::warn!(%peer_addr, "CLOSE without an open tunnel, dropping connection");
            Ok(())
        }
    }
}

async fn open_tunnel(
    mut control: ControlChannel,
    username: &str,
    password: &str,
    port: u16,
    state: &ServerState,
) -> anyhow::Result<()> {
    let peer_addr = control.peer_addr();

    if !state.verifier.verify(username, password, port) {
        tracing::warn!(%peer_addr, username, port, "Authentication failed");
        return fail(control).await;
    }

    let Ok(_slot) = state.tunnel_slots.clone().try_acquire_owned() else {
        tracing::warn!(%peer_addr, port, max = state.config.max_tunnels, "Tunnel limit reached");
        return fail(control).await;
    };

    let tunnel = match state.coordinator.bind(username, port, peer_addr).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            tracing::warn!(%peer_addr, port, error = %e, "Failed to open tunnel");
            return fail(control).await;
        }
    };

    let exit = state
        .coordinator
        .run(tunnel, &mut control, state.shutdown_rx.clone())
        .await;

    tracing::debug!(%peer_addr, port, ?exit, "Control session finished");
    control.shutdown().await;
    Ok(())
}

async fn fail(mut control: ControlChannel) -> anyhow::Result<()> {
    control.send(&ServerMessage::Fail).await?;
    control.shutdown().await;
    Ok(())
}
