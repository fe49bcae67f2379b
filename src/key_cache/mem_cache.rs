//! Load state of every key known since startup.

use super::eviction::{EvictionCandidate, EvictionPolicy};
use crate::interface::{KeyUuid, TcsErr, TcsKeyHandle, TpmDigest, TpmKeyHandle, SRK_TPM_HANDLE, SRK_UUID};
use crate::tpm::TpmKey;
use digest::Digest as _;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use zeroize::Zeroizing;

const FIRST_TCS_KEY_HANDLE: TcsKeyHandle = 0x0000_1000;

/// The stable handle of the storage root key.
pub const SRK_TCS_HANDLE: TcsKeyHandle = SRK_TPM_HANDLE;

pub struct MemCacheEntry {
    pub tcs_handle: TcsKeyHandle,
    /// `None` while evicted.
    pub tpm_slot: Option<TpmKeyHandle>,
    /// Set for keys loaded through their registration.
    pub uuid: Option<KeyUuid>,
    pub key: TpmKey,
    /// The wrapped key, for reloading after an eviction.
    pub blob: Zeroizing<Vec<u8>>,
    /// Holds a reference on the parent's entry, so that the key stays
    /// reloadable.
    pub parent: Option<TcsKeyHandle>,
    /// Number of contexts and child entries referencing the key.
    pub ref_cnt: u32,
    lru_seqno: u64,
}

fn fingerprint(pub_key: &[u8]) -> TpmDigest {
    let mut fp = TpmDigest::default();
    fp.copy_from_slice(&sha1::Sha1::digest(pub_key));
    fp
}

pub struct MemCache {
    last_tcs_handle: TcsKeyHandle,
    last_lru_seqno: u64,
    entries: BTreeMap<TcsKeyHandle, MemCacheEntry>,
    /// SHA-1 of the public key to stable handle.
    by_pub_key: HashMap<TpmDigest, TcsKeyHandle>,
}

impl MemCache {
    /// A cache knowing only about the storage root key, whose public part is
    /// filled in from its registration if available.
    pub fn new(srk: Option<TpmKey>) -> Self {
        let mut cache = Self {
            last_tcs_handle: FIRST_TCS_KEY_HANDLE - 1,
            last_lru_seqno: 0,
            entries: BTreeMap::new(),
            by_pub_key: HashMap::new(),
        };
        let srk = srk.unwrap_or_default();
        if !srk.pub_key.is_empty() {
            cache
                .by_pub_key
                .insert(fingerprint(&srk.pub_key), SRK_TCS_HANDLE);
        }
        cache.entries.insert(
            SRK_TCS_HANDLE,
            MemCacheEntry {
                tcs_handle: SRK_TCS_HANDLE,
                tpm_slot: Some(SRK_TPM_HANDLE),
                uuid: Some(SRK_UUID),
                key: srk,
                blob: Zeroizing::new(Vec::new()),
                parent: None,
                ref_cnt: 1,
                lru_seqno: 0,
            },
        );
        cache
    }

    fn next_lru_seqno(&mut self) -> u64 {
        self.last_lru_seqno = self.last_lru_seqno.wrapping_add(1);
        self.last_lru_seqno
    }

    fn allocate_handle(&mut self) -> Result<TcsKeyHandle, TcsErr> {
        let start = self.last_tcs_handle;
        let mut handle = start;
        loop {
            handle = handle.wrapping_add(1);
            if handle == start {
                return Err(tcs_err_rc!(OUTOFMEMORY));
            }
            if handle != 0 && !self.entries.contains_key(&handle) {
                self.last_tcs_handle = handle;
                return Ok(handle);
            }
        }
    }

    pub fn get(&self, tcs_handle: TcsKeyHandle) -> Option<&MemCacheEntry> {
        self.entries.get(&tcs_handle)
    }

    pub fn contains(&self, tcs_handle: TcsKeyHandle) -> bool {
        self.entries.contains_key(&tcs_handle)
    }

    pub fn find_resident_slot(&self, tcs_handle: TcsKeyHandle) -> Option<TpmKeyHandle> {
        self.entries.get(&tcs_handle).and_then(|e| e.tpm_slot)
    }

    pub fn find_by_public_key(&self, pub_key: &[u8]) -> Option<TcsKeyHandle> {
        self.by_pub_key.get(&fingerprint(pub_key)).copied()
    }

    pub fn handles_by_uuid(&self, uuid: &KeyUuid) -> Option<(TcsKeyHandle, Option<TpmKeyHandle>)> {
        self.entries
            .values()
            .find(|e| e.uuid.as_ref() == Some(uuid))
            .map(|e| (e.tcs_handle, e.tpm_slot))
    }

    /// Add a freshly loaded key under a newly allocated stable handle. The
    /// new entry starts out unreferenced and takes a reference on `parent`.
    pub fn insert_resident(
        &mut self,
        tpm_slot: TpmKeyHandle,
        key: TpmKey,
        blob: &[u8],
        parent: TcsKeyHandle,
    ) -> Result<TcsKeyHandle, TcsErr> {
        let fp = fingerprint(&key.pub_key);
        if self.by_pub_key.contains_key(&fp) {
            return Err(tcs_err_internal!());
        }
        if !self.entries.contains_key(&parent) {
            return Err(tcs_err_rc!(INVALID_KEYHANDLE));
        }
        let tcs_handle = self.allocate_handle()?;
        self.inc_ref(parent)?;
        let lru_seqno = self.next_lru_seqno();
        self.by_pub_key.insert(fp, tcs_handle);
        self.entries.insert(
            tcs_handle,
            MemCacheEntry {
                tcs_handle,
                tpm_slot: Some(tpm_slot),
                uuid: None,
                key,
                blob: Zeroizing::new(blob.to_vec()),
                parent: Some(parent),
                ref_cnt: 0,
                lru_seqno,
            },
        );
        debug!(tcs_handle, tpm_slot, "added memory cache entry");
        Ok(tcs_handle)
    }

    pub fn update_slot(
        &mut self,
        tcs_handle: TcsKeyHandle,
        tpm_slot: Option<TpmKeyHandle>,
    ) -> Result<(), TcsErr> {
        let lru_seqno = self.next_lru_seqno();
        let entry = self
            .entries
            .get_mut(&tcs_handle)
            .ok_or(tcs_err_rc!(INVALID_KEYHANDLE))?;
        entry.tpm_slot = tpm_slot;
        if tpm_slot.is_some() {
            entry.lru_seqno = lru_seqno;
        }
        Ok(())
    }

    /// Mark whichever key occupies `tpm_slot` as having moved to `new_slot`.
    pub fn set_slot_by_slot(&mut self, tpm_slot: TpmKeyHandle, new_slot: Option<TpmKeyHandle>) {
        for entry in self.entries.values_mut() {
            if entry.tpm_slot == Some(tpm_slot) {
                entry.tpm_slot = new_slot;
            }
        }
    }

    /// Move the parent reference over to `parent`. Returns the entries
    /// removed for having lost their last reference with it.
    pub fn set_parent(
        &mut self,
        tcs_handle: TcsKeyHandle,
        parent: TcsKeyHandle,
    ) -> Result<Vec<MemCacheEntry>, TcsErr> {
        if !self.entries.contains_key(&parent) {
            return Err(tcs_err_rc!(INVALID_KEYHANDLE));
        }
        let entry = self
            .entries
            .get_mut(&tcs_handle)
            .ok_or(tcs_err_rc!(INVALID_KEYHANDLE))?;
        let prev_parent = entry.parent.replace(parent);
        if prev_parent == Some(parent) {
            return Ok(Vec::new());
        }
        self.inc_ref(parent)?;
        Ok(match prev_parent {
            Some(prev_parent) => self.dec_ref(prev_parent),
            None => Vec::new(),
        })
    }

    pub fn set_uuid(&mut self, tcs_handle: TcsKeyHandle, uuid: &KeyUuid) -> Result<(), TcsErr> {
        let entry = self
            .entries
            .get_mut(&tcs_handle)
            .ok_or(tcs_err_rc!(INVALID_KEYHANDLE))?;
        entry.uuid = Some(*uuid);
        Ok(())
    }

    /// Note a use of a resident key, for the benefit of LRU eviction.
    pub fn touch(&mut self, tcs_handle: TcsKeyHandle) {
        let lru_seqno = self.next_lru_seqno();
        if let Some(entry) = self.entries.get_mut(&tcs_handle) {
            entry.lru_seqno = lru_seqno;
        }
    }

    pub fn inc_ref(&mut self, tcs_handle: TcsKeyHandle) -> Result<(), TcsErr> {
        let entry = self
            .entries
            .get_mut(&tcs_handle)
            .ok_or(tcs_err_rc!(INVALID_KEYHANDLE))?;
        entry.ref_cnt += 1;
        Ok(())
    }

    /// Remove an unreferenced entry along with whatever ancestors thereby
    /// lose their last reference, child first.
    fn remove_unreferenced(&mut self, tcs_handle: TcsKeyHandle) -> Vec<MemCacheEntry> {
        let mut removed = Vec::new();
        let mut cur = Some(tcs_handle);
        while let Some(tcs_handle) = cur.take() {
            if tcs_handle == SRK_TCS_HANDLE {
                break;
            }
            match self.entries.get(&tcs_handle) {
                Some(entry) if entry.ref_cnt == 0 => (),
                _ => break,
            }
            let entry = match self.entries.remove(&tcs_handle) {
                Some(entry) => entry,
                None => break,
            };
            self.by_pub_key.remove(&fingerprint(&entry.key.pub_key));
            debug!(tcs_handle, "removed memory cache entry");
            if let Some(parent) = entry.parent {
                if let Some(parent_entry) = self.entries.get_mut(&parent) {
                    parent_entry.ref_cnt = parent_entry.ref_cnt.saturating_sub(1);
                    cur = Some(parent);
                }
            }
            removed.push(entry);
        }
        removed
    }

    /// Drop a reference. Entries losing their last reference get removed
    /// from the cache and returned, the caller must evict those still
    /// resident from the chip. The SRK's entry is never removed.
    pub fn dec_ref(&mut self, tcs_handle: TcsKeyHandle) -> Vec<MemCacheEntry> {
        match self.entries.get_mut(&tcs_handle) {
            Some(entry) => entry.ref_cnt = entry.ref_cnt.saturating_sub(1),
            None => return Vec::new(),
        }
        self.remove_unreferenced(tcs_handle)
    }

    /// Undo an [`insert_resident()`](Self::insert_resident) which never got
    /// its first reference.
    pub fn remove_if_unreferenced(&mut self, tcs_handle: TcsKeyHandle) -> Vec<MemCacheEntry> {
        self.remove_unreferenced(tcs_handle)
    }

    pub fn is_uuid_loaded(&self, uuid: &KeyUuid) -> bool {
        matches!(self.handles_by_uuid(uuid), Some((_, Some(_))))
    }

    /// Ask `policy` for a resident key to evict, never `protect` nor the
    /// SRK.
    pub fn select_eviction_victim(
        &self,
        protect: TcsKeyHandle,
        policy: &dyn EvictionPolicy,
    ) -> Option<TcsKeyHandle> {
        let mut candidates = self.entries.values().filter_map(|e| match e.tpm_slot {
            Some(tpm_slot) if e.tcs_handle != protect && e.tcs_handle != SRK_TCS_HANDLE => {
                Some(EvictionCandidate {
                    tcs_handle: e.tcs_handle,
                    tpm_slot,
                    lru_seqno: e.lru_seqno,
                })
            }
            _ => None,
        });
        policy.select_victim(&mut candidates, self.last_lru_seqno)
    }
}

#[cfg(test)]
use super::eviction::LruEvictionPolicy;

#[test]
fn test_mem_cache_slot_tracking() {
    use crate::tpm::key_blob::test_key;

    let mut cache = MemCache::new(Some(test_key(b"srk", 0)));
    assert_eq!(cache.find_by_public_key(b"srk"), Some(SRK_TCS_HANDLE));
    assert_eq!(cache.find_resident_slot(SRK_TCS_HANDLE), Some(SRK_TPM_HANDLE));

    let key = test_key(b"k1", 0);
    let blob = key.to_blob().unwrap();
    let h = cache
        .insert_resident(0x0100_0000, key.clone(), &blob, SRK_TCS_HANDLE)
        .unwrap();
    assert_eq!(cache.find_by_public_key(b"k1"), Some(h));
    assert_eq!(
        cache.insert_resident(0x0100_0001, key, &blob, SRK_TCS_HANDLE),
        Err(tcs_err_internal!())
    );

    cache.set_slot_by_slot(0x0100_0000, None);
    assert_eq!(cache.find_resident_slot(h), None);
    assert!(cache.contains(h));
    cache.update_slot(h, Some(0x0100_0005)).unwrap();
    assert_eq!(cache.find_resident_slot(h), Some(0x0100_0005));

    cache.inc_ref(h).unwrap();
    cache.inc_ref(h).unwrap();
    assert!(cache.dec_ref(h).is_empty());
    let removed = cache.dec_ref(h);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].tpm_slot, Some(0x0100_0005));
    assert!(!cache.contains(h));
    assert_eq!(cache.find_by_public_key(b"k1"), None);
    assert!(cache.dec_ref(SRK_TCS_HANDLE).is_empty());
    assert!(cache.contains(SRK_TCS_HANDLE));
}

#[test]
fn test_eviction_victim_selection() {
    use crate::tpm::key_blob::test_key;

    let mut cache = MemCache::new(None);
    let mut handles = Vec::new();
    for (i, name) in [b"k1", b"k2", b"k3"].iter().enumerate() {
        let key = test_key(*name, 0);
        let blob = key.to_blob().unwrap();
        handles.push(
            cache
                .insert_resident(0x0100_0000 + i as u32, key, &blob, SRK_TCS_HANDLE)
                .unwrap(),
        );
    }
    let policy = LruEvictionPolicy;
    assert_eq!(cache.select_eviction_victim(SRK_TCS_HANDLE, &policy), Some(handles[0]));
    // The protected key is skipped even though it's the oldest.
    assert_eq!(cache.select_eviction_victim(handles[0], &policy), Some(handles[1]));
    // Unloaded keys are no candidates, used ones become young again.
    cache.update_slot(handles[1], None).unwrap();
    cache.touch(handles[0]);
    assert_eq!(cache.select_eviction_victim(SRK_TCS_HANDLE, &policy), Some(handles[2]));
    cache.update_slot(handles[2], None).unwrap();
    assert_eq!(cache.select_eviction_victim(handles[0], &policy), None);
}

#[test]
fn test_child_keeps_parent_entry() {
    use crate::tpm::key_blob::test_key;

    fn insert(cache: &mut MemCache, name: &[u8], slot: TpmKeyHandle, parent: TcsKeyHandle) -> TcsKeyHandle {
        let key = test_key(name, 0);
        let blob = key.to_blob().unwrap();
        cache.insert_resident(slot, key, &blob, parent).unwrap()
    }

    let mut cache = MemCache::new(None);
    let p = insert(&mut cache, b"p", 0x0100_0000, SRK_TCS_HANDLE);
    let c = insert(&mut cache, b"c", 0x0100_0001, p);
    assert_eq!(
        cache.insert_resident(0x0100_0002, test_key(b"x", 0), &[], 0xdead),
        Err(tcs_err_rc!(INVALID_KEYHANDLE))
    );
    cache.inc_ref(p).unwrap();
    cache.inc_ref(c).unwrap();

    // The parent's own user is gone, the child still needs it.
    assert!(cache.dec_ref(p).is_empty());
    assert!(cache.contains(p));

    // Releasing the child takes the parent along, child first.
    let removed: Vec<_> = cache.dec_ref(c).into_iter().map(|e| e.tcs_handle).collect();
    assert_eq!(removed, vec![c, p]);
    assert!(!cache.contains(p));
    assert!(cache.contains(SRK_TCS_HANDLE));
}

#[test]
fn test_reparenting_moves_reference() {
    use crate::tpm::key_blob::test_key;

    let mut cache = MemCache::new(None);
    let mut handles = Vec::new();
    for (i, name) in [b"p1", b"p2", b"c0"].iter().enumerate() {
        let key = test_key(*name, 0);
        let blob = key.to_blob().unwrap();
        handles.push(
            cache
                .insert_resident(0x0100_0000 + i as u32, key, &blob, SRK_TCS_HANDLE)
                .unwrap(),
        );
    }
    let (p1, p2, c) = (handles[0], handles[1], handles[2]);
    cache.inc_ref(p2).unwrap();
    cache.inc_ref(c).unwrap();

    // Nothing but the child referenced p1.
    assert!(cache.set_parent(c, p1).unwrap().is_empty());
    let removed = cache.set_parent(c, p2).unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].tcs_handle, p1);
    assert!(cache.set_parent(c, p2).unwrap().is_empty());
    assert_eq!(cache.get(p2).map(|e| e.ref_cnt), Some(2));

    // Unreferenced entries get rolled back, referenced ones stay.
    assert!(cache.remove_if_unreferenced(p2).is_empty());
    assert!(cache.contains(p2));
}
