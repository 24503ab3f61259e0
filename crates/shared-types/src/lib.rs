//! # Shared Types Crate
//!
//! Identifiers shared by the collector and the rest of the sync daemon
//! (transport, download engine, fetch queue).
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every crate names stores, devices and
//!   objects through these types.
//! - **Opaque**: the collector never interprets identifier bytes beyond
//!   hashing them into Bloom filters and ordering persisted keys.

pub mod ids;

pub use ids::*;
