// crates/bacnet-rs/src/device.rs
//! Local device configuration and the peer capability cache.

use crate::error::BacnetError;
use crate::pdu::Address;
use crate::types::Segmentation;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, trace};

/// Administrative communication state set by DeviceCommunicationControl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommunicationControl {
    #[default]
    Enable,
    /// Only DCC, ReinitializeDevice and Who-Is are processed; nothing is
    /// initiated.
    Disable,
    /// Everything incoming is processed, but the only initiated request is
    /// I-Am.
    DisableInitiation,
}

/// Static configuration of the local device. The defaults are the
/// protocol defaults; applications override what they need.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_identifier: u32,
    pub vendor_identifier: u16,
    pub number_of_apdu_retries: u8,
    pub apdu_timeout_ms: u64,
    pub segment_timeout_ms: u64,
    /// How long a server transaction waits for the application to respond.
    pub application_timeout_ms: u64,
    pub max_apdu_length_accepted: usize,
    pub max_segments_accepted: Option<u8>,
    pub proposed_window_size: u8,
    pub segmentation_supported: Segmentation,
    /// Largest NPDU the local datalink can carry, when known.
    pub max_npdu_length: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            device_identifier: 0,
            vendor_identifier: 0,
            number_of_apdu_retries: 3,
            apdu_timeout_ms: 3000,
            segment_timeout_ms: 1500,
            application_timeout_ms: 3000,
            max_apdu_length_accepted: 1024,
            max_segments_accepted: Some(2),
            proposed_window_size: 2,
            segmentation_supported: Segmentation::NoSegmentation,
            max_npdu_length: None,
        }
    }
}

impl DeviceConfig {
    /// Reject impossible settings before a stack is assembled.
    pub fn validate(&self) -> Result<(), BacnetError> {
        if self.proposed_window_size == 0 || self.proposed_window_size > 127 {
            return Err(BacnetError::Configuration(
                "proposed window size must be 1..=127",
            ));
        }
        if self.apdu_timeout_ms == 0 || self.segment_timeout_ms == 0 {
            return Err(BacnetError::Configuration("timeouts must be non-zero"));
        }
        if self.max_apdu_length_accepted < 50 {
            return Err(BacnetError::Configuration(
                "max APDU length below the protocol minimum",
            ));
        }
        Ok(())
    }
}

/// Index of a record in the cache arena.
pub type RecordId = usize;

/// What is known about a peer device, learned from I-Am broadcasts or
/// explicit updates.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_identifier: u32,
    pub address: Address,
    pub max_apdu_length_accepted: usize,
    pub segmentation_supported: Segmentation,
    /// `None` means unknown, or more than 64.
    pub max_segments_accepted: Option<u8>,
    pub vendor_id: Option<u16>,
    pub max_npdu_length: Option<usize>,
    ref_count: u32,
    /// The keys this record is currently filed under, so key changes can
    /// rewrite both indices.
    cache_keys: (u32, Address),
}

impl DeviceInfo {
    fn new(device_identifier: u32, address: Address) -> Self {
        DeviceInfo {
            device_identifier,
            address: address.clone(),
            max_apdu_length_accepted: 1024,
            segmentation_supported: Segmentation::NoSegmentation,
            max_segments_accepted: None,
            vendor_id: None,
            max_npdu_length: None,
            ref_count: 0,
            cache_keys: (device_identifier, address),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Peer capability store, indexed by both device instance and address.
/// Records in use by a segmentation state machine are pinned through the
/// reference count.
#[derive(Debug, Default)]
pub struct DeviceInfoCache {
    records: Vec<Option<DeviceInfo>>,
    by_id: BTreeMap<u32, RecordId>,
    by_address: BTreeMap<Address, RecordId>,
    free: Vec<RecordId>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: RecordId) -> Option<&DeviceInfo> {
        self.records.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut DeviceInfo> {
        self.records.get_mut(id).and_then(|slot| slot.as_mut())
    }

    pub fn lookup_address(&self, address: &Address) -> Option<RecordId> {
        self.by_address.get(address).copied()
    }

    pub fn lookup_id(&self, device_identifier: u32) -> Option<RecordId> {
        self.by_id.get(&device_identifier).copied()
    }

    /// Look a record up by address and pin it for a transaction.
    pub fn acquire_address(&mut self, address: &Address) -> Option<RecordId> {
        let id = self.lookup_address(address)?;
        if let Some(info) = self.get_mut(id) {
            info.ref_count += 1;
            trace!("device info {} acquired, refs={}", id, info.ref_count);
        }
        Some(id)
    }

    /// Unpin a record. Releasing a record nobody holds is a protocol
    /// engine bug.
    pub fn release(&mut self, id: RecordId) -> Result<(), BacnetError> {
        let info = self.get_mut(id).ok_or(BacnetError::ReferenceCount)?;
        if info.ref_count == 0 {
            return Err(BacnetError::ReferenceCount);
        }
        info.ref_count -= 1;
        trace!("device info {} released, refs={}", id, info.ref_count);
        Ok(())
    }

    fn allocate(&mut self, info: DeviceInfo) -> RecordId {
        if let Some(id) = self.free.pop() {
            self.records[id] = Some(info);
            id
        } else {
            self.records.push(Some(info));
            self.records.len() - 1
        }
    }

    /// Re-file a record after its identifier or address changed. Both
    /// indices are rewritten together so they never disagree.
    pub fn update_record(&mut self, id: RecordId) {
        let (new_id, new_addr, old_keys) = match self.get(id) {
            Some(info) => (
                info.device_identifier,
                info.address.clone(),
                info.cache_keys.clone(),
            ),
            None => return,
        };

        if old_keys.0 != new_id {
            debug!("device identifier updated: {} -> {}", old_keys.0, new_id);
            self.by_id.remove(&old_keys.0);
        }
        if old_keys.1 != new_addr {
            debug!("device address updated: {} -> {}", old_keys.1, new_addr);
            self.by_address.remove(&old_keys.1);
        }
        self.by_id.insert(new_id, id);
        self.by_address.insert(new_addr.clone(), id);
        if let Some(info) = self.get_mut(id) {
            info.cache_keys = (new_id, new_addr);
        }
    }

    /// Upsert a record from the contents of an I-Am broadcast. The record
    /// is located by device instance first, then by source address, and
    /// created when neither key is known.
    pub fn iam_device_info(
        &mut self,
        device_instance: u32,
        source: Address,
        max_apdu_length_accepted: usize,
        segmentation_supported: Segmentation,
        vendor_id: u16,
    ) -> RecordId {
        let id = self
            .lookup_id(device_instance)
            .or_else(|| self.lookup_address(&source))
            .unwrap_or_else(|| self.allocate(DeviceInfo::new(device_instance, source.clone())));

        if let Some(info) = self.get_mut(id) {
            info.device_identifier = device_instance;
            info.address = source;
            info.max_apdu_length_accepted = max_apdu_length_accepted;
            info.segmentation_supported = segmentation_supported;
            info.vendor_id = Some(vendor_id);
        }
        self.update_record(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Address {
        Address::local_station_ip([10, 0, 0, last], 47808)
    }

    #[test]
    fn test_iam_creates_and_indexes_record() {
        let mut cache = DeviceInfoCache::new();
        let id = cache.iam_device_info(900, addr(1), 480, Segmentation::SegmentedBoth, 42);

        assert_eq!(cache.lookup_id(900), Some(id));
        assert_eq!(cache.lookup_address(&addr(1)), Some(id));
        let info = cache.get(id).unwrap();
        assert_eq!(info.max_apdu_length_accepted, 480);
        assert_eq!(info.vendor_id, Some(42));
    }

    #[test]
    fn test_address_change_rewrites_both_indices() {
        let mut cache = DeviceInfoCache::new();
        let id = cache.iam_device_info(900, addr(1), 1024, Segmentation::NoSegmentation, 42);
        // The device moved to a different IP.
        let id2 = cache.iam_device_info(900, addr(2), 1024, Segmentation::NoSegmentation, 42);

        assert_eq!(id, id2);
        assert_eq!(cache.lookup_address(&addr(1)), None);
        assert_eq!(cache.lookup_address(&addr(2)), Some(id));
        assert_eq!(cache.lookup_id(900), Some(id));
    }

    #[test]
    fn test_acquire_release_discipline() {
        let mut cache = DeviceInfoCache::new();
        let id = cache.iam_device_info(900, addr(1), 1024, Segmentation::NoSegmentation, 42);

        assert_eq!(cache.acquire_address(&addr(1)), Some(id));
        assert_eq!(cache.get(id).unwrap().ref_count(), 1);
        cache.release(id).unwrap();
        assert_eq!(cache.get(id).unwrap().ref_count(), 0);
        assert_eq!(cache.release(id), Err(BacnetError::ReferenceCount));
    }

    #[test]
    fn test_acquire_unknown_peer_is_none() {
        let mut cache = DeviceInfoCache::new();
        assert_eq!(cache.acquire_address(&addr(9)), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(DeviceConfig::default().validate().is_ok());
        let mut config = DeviceConfig::default();
        config.proposed_window_size = 0;
        assert!(config.validate().is_err());
        config.proposed_window_size = 128;
        assert!(config.validate().is_err());
    }
}
