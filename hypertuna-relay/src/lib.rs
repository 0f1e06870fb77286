//! Hypertuna relay worker.
//!
//! A worker joins the peer swarm for each group it serves, projects the
//! signed-event stream into per-group state, terminates authenticated
//! client WebSocket connections through the gateway bridge, and mirrors
//! content-addressed drive subtrees between member peers.

pub mod auth;
pub mod config;
pub mod db;
pub mod drive;
pub mod gateway;
pub mod group;
pub mod mirror;
pub mod worker;
