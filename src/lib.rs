//! instanced: per-session main-instance coordination over a local socket.
//!
//! Window-owning processes connect, subscribe to a session id and push
//! an instance key per window. The most recently pushed instance in a
//! session is its main; removing it elects the next instance whose owner
//! accepts the role. Clients can forward an action to the main or
//! broadcast it to everyone else in their session.

pub mod client;
pub mod config;
pub mod coord;
pub mod ipc;
pub mod server;
