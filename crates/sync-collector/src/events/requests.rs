//! Mailbox Request Messages

use serde::{Deserialize, Serialize};
use shared_types::{Did, Oid, Sindex};
use tokio::sync::oneshot;

use super::responses::CollectorReply;
use crate::domain::SenderFilterIndex;
use crate::error::CollectorResult;

/// One call on the collector API
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectorCommand {
    AddFilter {
        sidx: Sindex,
        did: Did,
        /// Serialized `BloomFilter`
        filter_bytes: Vec<u8>,
    },
    DeviceOnline {
        sidx: Sindex,
        did: Did,
    },
    DeviceOffline {
        sidx: Sindex,
        did: Did,
    },
    AcknowledgeFilter {
        sidx: Sindex,
        did: Did,
        index: SenderFilterIndex,
        update_seq: u64,
    },
    ComputeFilterToSend {
        sidx: Sindex,
        did: Did,
        from_base: bool,
    },
    ObjectUpdated {
        sidx: Sindex,
        oid: Oid,
    },
}

impl CollectorCommand {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            CollectorCommand::AddFilter { .. } => "add_filter",
            CollectorCommand::DeviceOnline { .. } => "device_online",
            CollectorCommand::DeviceOffline { .. } => "device_offline",
            CollectorCommand::AcknowledgeFilter { .. } => "acknowledge_filter",
            CollectorCommand::ComputeFilterToSend { .. } => "compute_filter_to_send",
            CollectorCommand::ObjectUpdated { .. } => "object_updated",
        }
    }
}

/// A command together with the channel its result goes back on
#[derive(Debug)]
pub struct CollectorRequest {
    pub command: CollectorCommand,
    pub reply_to: oneshot::Sender<CollectorResult<CollectorReply>>,
}
