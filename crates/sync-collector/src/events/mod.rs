//! Events Layer - Mailbox Message Types
//!
//! Commands accepted by `CollectorActor` and the replies it sends back.

pub mod requests;
pub mod responses;

pub use requests::{CollectorCommand, CollectorRequest};
pub use responses::CollectorReply;
