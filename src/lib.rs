//! tlv-chat: a multi-user chat server
//!
//! Clients speak a small Tag-Length-Value protocol over TCP:
//! - MESSAGE frames carry chat lines, relayed to everyone else or to a
//!   private peer
//! - COMMAND frames carry slash commands (`/uname`, `/rname`, `/msg`,
//!   `/com`, `/list`, `/help`, `/quit`)
//!
//! Features:
//! - Lock-free uid allocation with round-robin reuse
//! - One shared, lock-protected roster of sessions
//! - Symmetric private pairing between two sessions
//! - Configuration via CLI arguments or TOML file

pub mod command;
pub mod config;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;
pub mod uid;
