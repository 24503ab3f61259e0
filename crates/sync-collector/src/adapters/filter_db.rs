//! Filter tables
//!
//! Maps the persisted schema onto `KeyValueStore` keys:
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | collector filters | `cf/` sidx did | filter bytes |
//! | sender filters | `sf/` sidx index | filter bytes |
//! | sender device indices | `sd/` sidx did | index |
//!
//! Store and index components are big-endian so prefix scans return rows in
//! numeric order. Reads take an optional `Trans` and see its staged writes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use shared_types::{Did, Sindex, UNIQUE_ID_LEN};
use tracing::debug;

use super::trans::{CacheEffect, Trans};
use crate::domain::{BloomFilter, SenderFilterIndex};
use crate::error::StorageError;
use crate::ports::{InMemoryKVStore, KeyValueStore};

const COLLECTOR_FILTER_PREFIX: &[u8] = b"cf/";
const SENDER_FILTER_PREFIX: &[u8] = b"sf/";
const SENDER_DEVICE_PREFIX: &[u8] = b"sd/";

fn table_prefix(table: &[u8], sidx: Sindex) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + 4 + UNIQUE_ID_LEN);
    key.extend_from_slice(table);
    key.extend_from_slice(&sidx.to_be_bytes());
    key
}

fn collector_filter_key(sidx: Sindex, did: Did) -> Vec<u8> {
    let mut key = table_prefix(COLLECTOR_FILTER_PREFIX, sidx);
    key.extend_from_slice(did.as_bytes());
    key
}

fn sender_filter_key(sidx: Sindex, index: SenderFilterIndex) -> Vec<u8> {
    let mut key = table_prefix(SENDER_FILTER_PREFIX, sidx);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn sender_device_key(sidx: Sindex, did: Did) -> Vec<u8> {
    let mut key = table_prefix(SENDER_DEVICE_PREFIX, sidx);
    key.extend_from_slice(did.as_bytes());
    key
}

fn corrupted(key: &[u8], reason: impl ToString) -> StorageError {
    StorageError::Corrupted {
        key: hex::encode(key),
        reason: reason.to_string(),
    }
}

fn decode_filter(key: &[u8], value: &[u8]) -> Result<BloomFilter, StorageError> {
    BloomFilter::from_bytes(value).map_err(|e| corrupted(key, e))
}

fn decode_index(key: &[u8], value: &[u8]) -> Result<SenderFilterIndex, StorageError> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| corrupted(key, "index is not 8 bytes"))?;
    Ok(SenderFilterIndex::from_be_bytes(bytes))
}

/// Typed access to the filter tables
#[derive(Clone)]
pub struct FilterDb {
    kv: Rc<RefCell<dyn KeyValueStore>>,
}

impl FilterDb {
    pub fn new(kv: Rc<RefCell<dyn KeyValueStore>>) -> Self {
        Self { kv }
    }

    /// Database backed by a fresh `InMemoryKVStore`
    pub fn in_memory() -> Self {
        Self::new(Rc::new(RefCell::new(InMemoryKVStore::new())))
    }

    /// Apply the transaction's writes atomically, then release its effects.
    ///
    /// On error nothing is written and the effects are dropped with the
    /// transaction.
    pub fn commit(&self, t: Trans) -> Result<Vec<CacheEffect>, StorageError> {
        let (ops, effects) = t.into_parts();
        if !ops.is_empty() {
            let count = ops.len();
            self.kv.borrow_mut().atomic_batch_write(ops)?;
            debug!(writes = count, effects = effects.len(), "Transaction committed");
        }
        Ok(effects)
    }

    fn get_raw(&self, t: Option<&Trans>, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(staged) = t.and_then(|t| t.staged(key)) {
            return Ok(staged.map(<[u8]>::to_vec));
        }
        self.kv.borrow().get(key)
    }

    fn scan_raw(
        &self,
        t: Option<&Trans>,
        prefix: &[u8],
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> =
            self.kv.borrow().prefix_scan(prefix)?.into_iter().collect();
        if let Some(t) = t {
            for (key, value) in t.staged_with_prefix(prefix) {
                match value {
                    Some(value) => {
                        rows.insert(key.clone(), value.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Collector filters
    // -------------------------------------------------------------------------

    pub fn collector_filter(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
        did: Did,
    ) -> Result<Option<BloomFilter>, StorageError> {
        let key = collector_filter_key(sidx, did);
        self.get_raw(t, &key)?
            .map(|v| decode_filter(&key, &v))
            .transpose()
    }

    pub fn set_collector_filter(
        &self,
        t: &mut Trans,
        sidx: Sindex,
        did: Did,
        filter: &BloomFilter,
    ) {
        t.put(collector_filter_key(sidx, did), filter.to_bytes());
    }

    pub fn delete_collector_filter(&self, t: &mut Trans, sidx: Sindex, did: Did) {
        t.delete(collector_filter_key(sidx, did));
    }

    /// Devices that have a persisted collector filter in this store
    pub fn collector_filter_devices(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
    ) -> Result<Vec<Did>, StorageError> {
        let prefix = table_prefix(COLLECTOR_FILTER_PREFIX, sidx);
        self.scan_raw(t, &prefix)?
            .keys()
            .map(|key| {
                Did::from_slice(&key[prefix.len()..])
                    .ok_or_else(|| corrupted(key, "bad device id"))
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Sender filters
    // -------------------------------------------------------------------------

    pub fn sender_filter(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
        index: SenderFilterIndex,
    ) -> Result<Option<BloomFilter>, StorageError> {
        let key = sender_filter_key(sidx, index);
        self.get_raw(t, &key)?
            .map(|v| decode_filter(&key, &v))
            .transpose()
    }

    /// All sender filter segments of the store, ascending by index
    pub fn sender_filters(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
    ) -> Result<Vec<(SenderFilterIndex, BloomFilter)>, StorageError> {
        let prefix = table_prefix(SENDER_FILTER_PREFIX, sidx);
        self.scan_raw(t, &prefix)?
            .iter()
            .map(|(key, value)| {
                let index = decode_index(key, &key[prefix.len()..])?;
                Ok((index, decode_filter(key, value)?))
            })
            .collect()
    }

    /// Segments with index in `[from, to)`, ascending
    pub fn sender_filters_between(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
        from: SenderFilterIndex,
        to: SenderFilterIndex,
    ) -> Result<Vec<(SenderFilterIndex, BloomFilter)>, StorageError> {
        Ok(self
            .sender_filters(t, sidx)?
            .into_iter()
            .filter(|(index, _)| *index >= from && *index < to)
            .collect())
    }

    /// Segment with the highest index
    pub fn last_sender_filter(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
    ) -> Result<Option<(SenderFilterIndex, BloomFilter)>, StorageError> {
        Ok(self.sender_filters(t, sidx)?.pop())
    }

    /// Segment with the highest index strictly below `index`
    pub fn sender_filter_before(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
        index: SenderFilterIndex,
    ) -> Result<Option<(SenderFilterIndex, BloomFilter)>, StorageError> {
        Ok(self
            .sender_filters(t, sidx)?
            .into_iter()
            .take_while(|(i, _)| *i < index)
            .last())
    }

    /// Whether `t` already writes (or deletes) this segment
    pub fn is_sender_filter_staged(
        &self,
        t: &Trans,
        sidx: Sindex,
        index: SenderFilterIndex,
    ) -> bool {
        t.staged(&sender_filter_key(sidx, index)).is_some()
    }

    pub fn set_sender_filter(
        &self,
        t: &mut Trans,
        sidx: Sindex,
        index: SenderFilterIndex,
        filter: &BloomFilter,
    ) {
        t.put(sender_filter_key(sidx, index), filter.to_bytes());
    }

    pub fn delete_sender_filter(&self, t: &mut Trans, sidx: Sindex, index: SenderFilterIndex) {
        t.delete(sender_filter_key(sidx, index));
    }

    // -------------------------------------------------------------------------
    // Sender device indices
    // -------------------------------------------------------------------------

    pub fn sender_device_index(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
        did: Did,
    ) -> Result<Option<SenderFilterIndex>, StorageError> {
        let key = sender_device_key(sidx, did);
        self.get_raw(t, &key)?
            .map(|v| decode_index(&key, &v))
            .transpose()
    }

    pub fn set_sender_device_index(
        &self,
        t: &mut Trans,
        sidx: Sindex,
        did: Did,
        index: SenderFilterIndex,
    ) {
        t.put(sender_device_key(sidx, did), index.to_be_bytes().to_vec());
    }

    /// Every device with a recorded index in this store
    pub fn sender_device_indices(
        &self,
        t: Option<&Trans>,
        sidx: Sindex,
    ) -> Result<Vec<(Did, SenderFilterIndex)>, StorageError> {
        let prefix = table_prefix(SENDER_DEVICE_PREFIX, sidx);
        self.scan_raw(t, &prefix)?
            .iter()
            .map(|(key, value)| {
                let did = Did::from_slice(&key[prefix.len()..])
                    .ok_or_else(|| corrupted(key, "bad device id"))?;
                Ok((did, decode_index(key, value)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::Oid;

    fn filter_of(byte: u8) -> BloomFilter {
        BloomFilter::from_oids(&[Oid([byte; 16])])
    }

    #[test]
    fn test_reads_see_staged_writes_before_commit() {
        let db = FilterDb::in_memory();
        let sidx = Sindex(1);
        let did = Did([1; 16]);
        let mut t = Trans::new();

        db.set_collector_filter(&mut t, sidx, did, &filter_of(1));

        let staged = db.collector_filter(Some(&t), sidx, did).unwrap();
        assert_eq!(staged, Some(filter_of(1)));
        let durable = db.collector_filter(None, sidx, did).unwrap();
        assert_eq!(durable, None, "Not durable yet");

        db.commit(t).unwrap();
        let durable = db.collector_filter(None, sidx, did).unwrap();
        assert_eq!(durable, Some(filter_of(1)));
    }

    #[test]
    fn test_aborted_transaction_writes_nothing() {
        let db = FilterDb::in_memory();
        let mut t = Trans::new();
        db.set_sender_filter(&mut t, Sindex(1), SenderFilterIndex::BASE, &filter_of(2));
        t.abort();

        assert!(db.sender_filters(None, Sindex(1)).unwrap().is_empty());
    }

    #[test]
    fn test_staged_delete_hides_durable_row() {
        let db = FilterDb::in_memory();
        let sidx = Sindex(1);
        let did = Did([3; 16]);

        let mut t = Trans::new();
        db.set_collector_filter(&mut t, sidx, did, &filter_of(3));
        db.commit(t).unwrap();

        let mut t = Trans::new();
        db.delete_collector_filter(&mut t, sidx, did);
        let staged = db.collector_filter_devices(Some(&t), sidx).unwrap();
        assert!(staged.is_empty());
        assert_eq!(db.collector_filter_devices(None, sidx).unwrap(), vec![did]);
    }

    #[test]
    fn test_sender_filters_are_ordered_and_scoped_by_store() {
        let db = FilterDb::in_memory();
        let mut t = Trans::new();
        db.set_sender_filter(&mut t, Sindex(1), SenderFilterIndex(300), &filter_of(3));
        db.set_sender_filter(&mut t, Sindex(1), SenderFilterIndex(2), &filter_of(2));
        db.set_sender_filter(&mut t, Sindex(1), SenderFilterIndex::BASE, &filter_of(1));
        db.set_sender_filter(&mut t, Sindex(2), SenderFilterIndex(7), &filter_of(9));
        db.commit(t).unwrap();

        let indices: Vec<u64> = db
            .sender_filters(None, Sindex(1))
            .unwrap()
            .into_iter()
            .map(|(i, _)| i.0)
            .collect();
        assert_eq!(indices, vec![0, 2, 300]);

        let (last, _) = db.last_sender_filter(None, Sindex(1)).unwrap().unwrap();
        assert_eq!(last, SenderFilterIndex(300));

        let (before, _) = db
            .sender_filter_before(None, Sindex(1), SenderFilterIndex(300))
            .unwrap()
            .unwrap();
        assert_eq!(before, SenderFilterIndex(2));
        assert!(db
            .sender_filter_before(None, Sindex(1), SenderFilterIndex::BASE)
            .unwrap()
            .is_none());

        let (from, to) = (SenderFilterIndex(1), SenderFilterIndex(300));
        let between = db
            .sender_filters_between(None, Sindex(1), from, to)
            .unwrap();
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].0, SenderFilterIndex(2));
    }

    #[test]
    fn test_sender_device_indices_roundtrip() {
        let db = FilterDb::in_memory();
        let sidx = Sindex(4);
        let d1 = Did([1; 16]);
        let d2 = Did([2; 16]);

        let mut t = Trans::new();
        db.set_sender_device_index(&mut t, sidx, d1, SenderFilterIndex(5));
        db.set_sender_device_index(&mut t, sidx, d2, SenderFilterIndex(9));
        db.commit(t).unwrap();

        let index = db.sender_device_index(None, sidx, d1).unwrap();
        assert_eq!(index, Some(SenderFilterIndex(5)));
        assert_eq!(
            db.sender_device_indices(None, sidx).unwrap(),
            vec![(d1, SenderFilterIndex(5)), (d2, SenderFilterIndex(9))]
        );
    }

    #[test]
    fn test_corrupted_row_is_reported() {
        let kv = Rc::new(RefCell::new(InMemoryKVStore::new()));
        let sidx = Sindex(1);
        let did = Did([1; 16]);
        kv.borrow_mut()
            .put(&collector_filter_key(sidx, did), b"junk")
            .unwrap();

        let db = FilterDb::new(kv);
        assert!(matches!(
            db.collector_filter(None, sidx, did),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_failed_commit_surfaces_storage_error() {
        let kv = Rc::new(RefCell::new(InMemoryKVStore::new()));
        kv.borrow_mut().set_fail_writes(true);
        let db = FilterDb::new(kv.clone());

        let mut t = Trans::new();
        db.set_collector_filter(&mut t, Sindex(1), Did([1; 16]), &filter_of(1));
        assert!(matches!(db.commit(t), Err(StorageError::Io(_))));
        assert!(kv.borrow().is_empty());
    }
}
