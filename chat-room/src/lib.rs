//! TCP chat room with a length-prefixed binary protocol.
//!
//! Clients send frames made of a 4-byte big-endian length and up to 512 body
//! bytes; the server rebroadcasts every frame to all other connected clients.
//! Each module focuses on a concrete responsibility:
//!
//! - [`frame`] is the wire codec: [`frame::Message`], encoding and header
//!   validation, with no I/O.
//! - [`connection`] reads exact byte counts and writes whole frames over any
//!   tokio stream.
//! - [`session`] owns one client connection and runs its read and write loops
//!   as separate tasks.
//! - [`room`] tracks the active sessions and fans messages out to their
//!   mailboxes.
//! - [`server`] accepts TCP connections and starts a session for each one.
//! - [`cli`] and [`client`] provide the command-line front end and a terminal
//!   client.
//!
//! Integration tests under `tests/` drive the server over real sockets.

pub mod cli;
pub mod client;
pub mod connection;
pub mod frame;
pub mod room;
pub mod server;
pub mod session;
