//! Domain Layer - Pure data structures
//!
//! This layer contains:
//! - Object Bloom filter (BFOID) and its hash functions
//! - Collector and sender-filter sequence numbers
//! - Exponential backoff state
//! - Configuration
//!
//! RULES:
//! - No I/O operations
//! - No async code

pub mod backoff;
pub mod bloom_filter;
pub mod config;
pub mod hash_functions;
pub mod sequence;

pub use backoff::ExponentialBackoff;
pub use bloom_filter::{BloomFilter, FILTER_BITS, HASH_COUNT};
pub use config::{CollectorConfig, CollectorConfigBuilder, BACKOFF_CEILING};
pub use sequence::{CollectorSeq, SenderFilterIndex};
