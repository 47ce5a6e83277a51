//! Floodgate - Distributed Flood Control
//!
//! This crate decides whether a user may make another request within a fixed
//! time window. Counters and per-user locks live in a shared key-value store
//! (Redis in production), so any number of processes can enforce the same
//! limits without coordinating directly.

pub mod config;
pub mod error;
pub mod floodcontrol;
pub mod store;
