//! Wire protocol definitions for the punch coordinator
//!
//! Text protocol, whitespace-delimited, one command per read:
//!
//! Client -> server (control port):
//!   - `OPEN <username> <password> <port>`: expose `<port>` publicly
//!   - `LIST`: list active tunnels
//!   - `CLOSE`: tear down the tunnel opened on this connection
//!
//! Server -> client (newline terminated):
//!   - `FAIL`: authentication or bind failure
//!   - `CONNECT <client_port> <nonce>`: reconnect to `<client_port>` and send `<nonce>`
//!
//! Client -> server (ephemeral client port):
//!   - raw nonce bytes, immediately followed by relayed payload

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default port for control connections
pub const DEFAULT_CONTROL_PORT: u16 = 9999;

/// Largest command accepted in a single read
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Length of a punch nonce in bytes
pub const NONCE_LENGTH: usize = 256;

/// Window in which the client must answer a CONNECT challenge
pub const PUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Command sent by a client on the control connection
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Open {
        username: String,
        password: String,
        port: u16,
    },
    List,
    Close,
}

impl Command {
    /// Parse a command from one control message
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = input.split_ascii_whitespace().collect();
        let (&name, args) = tokens.split_first().ok_or(ProtocolError::Empty)?;

        match name {
            "OPEN" => {
                expect_arity(name, args, 3)?;
                Ok(Command::Open {
                    username: args[0].to_string(),
                    password: args[1].to_string(),
                    port: parse_port(args[2])?,
                })
            }
            "LIST" => {
                expect_arity(name, args, 0)?;
                Ok(Command::List)
            }
            "CLOSE" => {
                expect_arity(name, args, 0)?;
                Ok(Command::Close)
            }
            other => Err(ProtocolError::UnknownCommand(truncate(other))),
        }
    }

    /// Serialize to wire format (used by clients and tests)
    pub fn to_wire(&self) -> String {
        match self {
            Command::Open {
                username,
                password,
                port,
            } => format!("OPEN {} {} {}\n", username, password, port),
            Command::List => "LIST\n".to_string(),
            Command::Close => "CLOSE\n".to_string(),
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s)
    }
}

// Keeps passwords out of logs
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Open { username, port, .. } => f
                .debug_struct("Open")
                .field("username", username)
                .field("password", &"<redacted>")
                .field("port", port)
                .finish(),
            Command::List => f.write_str("List"),
            Command::Close => f.write_str("Close"),
        }
    }
}

/// Message sent by the server on the control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Fail,
    Connect { client_port: u16, nonce: String },
}

impl ServerMessage {
    pub fn connect(client_port: u16, nonce: impl Into<String>) -> Self {
        ServerMessage::Connect {
            client_port,
            nonce: nonce.into(),
        }
    }

    /// Serialize to wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}\n", self).into_bytes()
    }

    /// Parse a server message (client side)
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = input.split_ascii_whitespace().collect();
        let (&name, args) = tokens.split_first().ok_or(ProtocolError::Empty)?;

        match name {
            "FAIL" => {
                expect_arity(name, args, 0)?;
                Ok(ServerMessage::Fail)
            }
            "CONNECT" => {
                expect_arity(name, args, 2)?;
                Ok(ServerMessage::Connect {
                    client_port: parse_port(args[0])?,
                    nonce: args[1].to_string(),
                })
            }
            other => Err(ProtocolError::UnknownCommand(truncate(other))),
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Fail => f.write_str("FAIL"),
            ServerMessage::Connect { client_port, nonce } => {
                write!(f, "CONNECT {} {}", client_port, nonce)
            }
        }
    }
}

/// Protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command} expects {expected} arguments, got {got}")]
    WrongArity {
        command: String,
        expected: usize,
        got: usize,
    },

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

fn expect_arity(command: &str, args: &[&str], expected: usize) -> Result<(), ProtocolError> {
    if args.len() != expected {
        return Err(ProtocolError::WrongArity {
            command: command.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn parse_port(raw: &str) -> Result<u16, ProtocolError> {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ProtocolError::InvalidPort(truncate(raw))),
    }
}

/// Bound attacker-controlled text before it lands in an error or log line
fn truncate(s: &str) -> String {
    s.chars().take(32).collect()
}
