//! Adapters Layer
//!
//! - `filter_db`: filter tables on top of a `KeyValueStore`
//! - `trans`: transactions carrying cache effects
//! - `scheduler`: `CoreScheduler` implementations
//! - `mailbox`: actor that puts the service behind a `Send` handle

pub mod filter_db;
pub mod mailbox;
pub mod scheduler;
pub mod trans;

pub use filter_db::FilterDb;
pub use mailbox::{CollectorActor, CollectorHandle, DEFAULT_MAILBOX_CAPACITY};
pub use scheduler::{ManualScheduler, TokioLocalScheduler};
pub use trans::{CacheEffect, Trans};
