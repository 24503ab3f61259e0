//! Inbound Ports (Driving Ports)
//!
//! The API the transport and sync layers use to drive the collector.

use serde::{Deserialize, Serialize};
use shared_types::{Did, Oid, Sindex};

use crate::domain::SenderFilterIndex;
use crate::error::CollectorResult;

/// Filter to embed in an outgoing filter-announcement message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterAnnouncement {
    /// Serialized `BloomFilter`
    pub bytes: Vec<u8>,
    /// Index of the last segment folded into `bytes`
    pub index: SenderFilterIndex,
    /// Update counter at the time of computation; echoed back in the ack
    pub update_seq: u64,
}

/// Primary collector API (Driving Port)
///
/// Implementations are bound to the core thread. Callers on other threads
/// go through `CollectorHandle`.
pub trait CollectorApi {
    /// A remote device announced the objects it may have.
    ///
    /// # Errors
    /// - `InvalidFilter` if `filter_bytes` does not decode
    /// - `UnknownStore` if the store is not registered
    fn add_filter(&self, sidx: Sindex, did: Did, filter_bytes: &[u8]) -> CollectorResult<()>;

    /// A device became reachable for this store.
    fn device_online(&self, sidx: Sindex, did: Did) -> CollectorResult<()>;

    /// A device is no longer reachable for this store.
    fn device_offline(&self, sidx: Sindex, did: Did) -> CollectorResult<()>;

    /// A remote device acknowledged a filter computed by
    /// `compute_filter_to_send`.
    ///
    /// Stale acknowledgements (`update_seq` older than the current counter)
    /// are ignored.
    fn acknowledge_filter(
        &self,
        sidx: Sindex,
        did: Did,
        index: SenderFilterIndex,
        update_seq: u64,
    ) -> CollectorResult<()>;

    /// Filter to announce to `did`, or `None` if there is nothing to send.
    ///
    /// `from_base` requests the full history instead of the delta since the
    /// device's last acknowledgement.
    fn compute_filter_to_send(
        &self,
        sidx: Sindex,
        did: Did,
        from_base: bool,
    ) -> CollectorResult<Option<FilterAnnouncement>>;

    /// The version of a local object changed.
    fn object_updated(&self, sidx: Sindex, oid: Oid) -> CollectorResult<()>;
}
