//! In-memory mirror of the key registrations held by the [`KeyStore`](crate::store::KeyStore).

use crate::interface::{KeyUuid, TcsErr, TpmVersion, NULL_UUID};
use crate::store::StoredKey;
use crate::tpm::TpmKey;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCacheEntry {
    pub uuid: KeyUuid,
    /// [`NULL_UUID`] for root keys.
    pub parent_uuid: KeyUuid,
    pub pub_key: Vec<u8>,
    pub blob_size: usize,
    pub vendor_data: Vec<u8>,
    pub version: TpmVersion,
    pub auth_data_usage: u8,
}

impl DiskCacheEntry {
    pub fn new(uuid: KeyUuid, stored: &StoredKey) -> Result<Self, TcsErr> {
        let (key, _) = TpmKey::from_blob(&stored.blob)?;
        Ok(Self {
            uuid,
            parent_uuid: stored.parent_uuid,
            pub_key: stored.pub_key.clone(),
            blob_size: stored.blob.len(),
            vendor_data: stored.vendor_data.clone(),
            version: key.version,
            auth_data_usage: key.auth_data_usage,
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent_uuid == NULL_UUID
    }
}

/// Registered keys, enumerated in registration order.
#[derive(Default)]
pub struct DiskCache {
    last_seqno: u64,
    entries: BTreeMap<u64, DiskCacheEntry>,
    seqnos: HashMap<KeyUuid, u64>,
}

impl DiskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, uuid: &KeyUuid) -> bool {
        self.seqnos.contains_key(uuid)
    }

    pub fn get(&self, uuid: &KeyUuid) -> Option<&DiskCacheEntry> {
        self.seqnos.get(uuid).and_then(|seqno| self.entries.get(seqno))
    }

    pub fn parent_of(&self, uuid: &KeyUuid) -> Option<KeyUuid> {
        self.get(uuid).map(|entry| entry.parent_uuid)
    }

    pub fn insert(&mut self, entry: DiskCacheEntry) -> Result<(), TcsErr> {
        if self.is_registered(&entry.uuid) {
            return Err(tcs_err_rc!(KEY_ALREADY_REGISTERED));
        }
        self.last_seqno += 1;
        self.seqnos.insert(entry.uuid, self.last_seqno);
        self.entries.insert(self.last_seqno, entry);
        Ok(())
    }

    pub fn remove(&mut self, uuid: &KeyUuid) -> Result<DiskCacheEntry, TcsErr> {
        self.seqnos
            .remove(uuid)
            .and_then(|seqno| self.entries.remove(&seqno))
            .ok_or(tcs_err_rc!(PS_KEY_NOTFOUND))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiskCacheEntry> {
        self.entries.values()
    }

    pub fn find_by_pub_key(&self, pub_key: &[u8]) -> Option<&DiskCacheEntry> {
        self.iter().find(|entry| entry.pub_key == pub_key)
    }

    /// The entries from `uuid` up to its root, leaf first.
    ///
    /// Chains longer than `max_len` entries are considered corrupt.
    pub fn lookup_parent_chain(
        &self,
        uuid: &KeyUuid,
        max_len: usize,
    ) -> Result<Vec<&DiskCacheEntry>, TcsErr> {
        let mut chain = Vec::new();
        let mut cur = *uuid;
        loop {
            if chain.len() >= max_len {
                return Err(tcs_err_rc!(PS_KEY_NOTFOUND));
            }
            let entry = self.get(&cur).ok_or(tcs_err_rc!(PS_KEY_NOTFOUND))?;
            chain.push(entry);
            if entry.is_root() {
                return Ok(chain);
            }
            cur = entry.parent_uuid;
        }
    }
}

#[cfg(test)]
fn test_entry(uuid: u128, parent_uuid: KeyUuid) -> DiskCacheEntry {
    DiskCacheEntry {
        uuid: KeyUuid::from_u128(uuid),
        parent_uuid,
        pub_key: uuid.to_be_bytes().to_vec(),
        blob_size: 0,
        vendor_data: Vec::new(),
        version: TpmVersion::default(),
        auth_data_usage: 0,
    }
}

#[test]
fn test_parent_chain() {
    let mut cache = DiskCache::new();
    cache.insert(test_entry(1, NULL_UUID)).unwrap();
    cache.insert(test_entry(2, KeyUuid::from_u128(1))).unwrap();
    cache.insert(test_entry(3, KeyUuid::from_u128(2))).unwrap();
    assert_eq!(
        cache.insert(test_entry(3, NULL_UUID)),
        Err(tcs_err_rc!(KEY_ALREADY_REGISTERED))
    );

    let chain: Vec<_> = cache
        .lookup_parent_chain(&KeyUuid::from_u128(3), 10)
        .unwrap()
        .into_iter()
        .map(|e| e.uuid.as_u128())
        .collect();
    assert_eq!(chain, vec![3, 2, 1]);
    assert_eq!(
        cache.lookup_parent_chain(&KeyUuid::from_u128(3), 2),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );

    cache.remove(&KeyUuid::from_u128(2)).unwrap();
    assert_eq!(
        cache.lookup_parent_chain(&KeyUuid::from_u128(3), 10),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
    assert_eq!(
        cache.remove(&KeyUuid::from_u128(2)),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
}

#[test]
fn test_parent_chain_cycle_is_bounded() {
    let mut cache = DiskCache::new();
    cache.insert(test_entry(1, KeyUuid::from_u128(2))).unwrap();
    cache.insert(test_entry(2, KeyUuid::from_u128(1))).unwrap();
    assert_eq!(
        cache.lookup_parent_chain(&KeyUuid::from_u128(1), 10),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
}
