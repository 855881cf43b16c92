//! xpanel - inbound management and restart supervision for a proxy server
//!
//! This library provides the core of a proxy control panel that:
//! - Stores inbounds (listening endpoints) in SQLite with unique ports
//! - Accumulates traffic counters reported by the proxy per inbound tag
//! - Disables inbounds that exhausted their quota or expired
//! - Debounces configuration changes into at most one restart per tick
//! - Renders the proxy configuration and supervises the proxy process
//! - Exposes all of the above through a JSON admin API

pub mod admin;
pub mod config;
pub mod db;
pub mod error;
pub mod inbound;
pub mod quota;
pub mod restart;
pub mod scheduler;
pub mod service;
pub mod supervisor;
pub mod traffic;
