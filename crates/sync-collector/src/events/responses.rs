//! Mailbox Response Messages

use serde::{Deserialize, Serialize};

use crate::ports::FilterAnnouncement;

/// Successful result of a `CollectorCommand`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorReply {
    /// The command has been applied
    Done,
    /// Result of `ComputeFilterToSend`
    Filter(Option<FilterAnnouncement>),
}
