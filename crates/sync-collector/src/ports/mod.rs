//! Ports Layer
//!
//! Defines the interfaces (traits) for:
//! - Driving Ports (inbound) - API for the transport and sync layers
//! - Driven Ports (outbound) - Storage, fetch queue, downloads, scheduler

pub mod inbound;
pub mod outbound;

pub use inbound::{CollectorApi, FilterAnnouncement};
pub use outbound::{
    BatchOperation, CollectorQueue, ContentDownloads, Continuation, CoreScheduler,
    DownloadListener, InMemoryKVStore, KeyValueStore, KvRows, QueueEntry, Task,
};
