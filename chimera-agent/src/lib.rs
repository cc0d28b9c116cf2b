//! chimera agent library
//!
//! Reconciles the containers declared for this node with the
//! systemd-nspawn machines actually present on the host, and serves the
//! local control socket used by the `chimera` client.

pub mod agent;
pub mod audit;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod host;
pub mod model;
pub mod protocol;
pub mod providers;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod systemd;
pub mod test_util;
pub mod watcher;
