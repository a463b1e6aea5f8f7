//! Punch server library
//!
//! Lets a client behind NAT expose an internal TCP service on a public port
//! of this server. External connections are paired with connections the
//! client makes outward to the server, then relayed byte for byte.

pub mod auth;
pub mod health;
pub mod nonce;
pub mod protocol;
pub mod punch;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use auth::*;
pub use protocol::*;
pub use registry::*;
pub use server::*;
