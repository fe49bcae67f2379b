//! Persistent key registration storage.

use crate::interface::{KeyUuid, TcsErr};
use crate::sync_types::{self, RwLock as _};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

/// One registered key as kept by the persistent store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredKey {
    pub parent_uuid: KeyUuid,
    /// `TPM_STORE_PUBKEY` key material, as found in the wrapped blob.
    pub pub_key: Vec<u8>,
    pub blob: Zeroizing<Vec<u8>>,
    pub vendor_data: Vec<u8>,
}

/// Durable key UUID to key record mapping.
///
/// Implementations report unknown UUIDs as `PS_KEY_NOTFOUND`.
pub trait KeyStore: Send + Sync {
    fn get(&self, uuid: &KeyUuid) -> Result<StoredKey, TcsErr>;
    fn put(&self, uuid: &KeyUuid, key: &StoredKey) -> Result<(), TcsErr>;
    fn delete(&self, uuid: &KeyUuid) -> Result<(), TcsErr>;
    /// All records, in registration order, for populating the caches at
    /// startup.
    fn entries(&self) -> Result<Vec<(KeyUuid, StoredKey)>, TcsErr>;
}

/// A volatile [`KeyStore`].
pub struct MemoryKeyStore<ST: sync_types::SyncTypes> {
    keys: ST::RwLock<MemoryKeyStoreInner>,
}

#[derive(Default)]
struct MemoryKeyStoreInner {
    next_seqno: u64,
    by_seqno: BTreeMap<u64, (KeyUuid, StoredKey)>,
    seqnos: BTreeMap<KeyUuid, u64>,
}

impl<ST: sync_types::SyncTypes> MemoryKeyStore<ST> {
    pub fn new() -> Self {
        Self {
            keys: ST::RwLock::from(MemoryKeyStoreInner::default()),
        }
    }
}

impl<ST: sync_types::SyncTypes> Default for MemoryKeyStore<ST> {
    fn default() -> Self {
        Self::new()
    }
}

impl<ST: sync_types::SyncTypes> KeyStore for MemoryKeyStore<ST> {
    fn get(&self, uuid: &KeyUuid) -> Result<StoredKey, TcsErr> {
        let keys = self.keys.read();
        keys.seqnos
            .get(uuid)
            .and_then(|seqno| keys.by_seqno.get(seqno))
            .map(|(_, key)| key.clone())
            .ok_or(tcs_err_rc!(PS_KEY_NOTFOUND))
    }

    fn put(&self, uuid: &KeyUuid, key: &StoredKey) -> Result<(), TcsErr> {
        let mut keys = self.keys.write();
        match keys.seqnos.get(uuid).copied() {
            Some(seqno) => {
                keys.by_seqno.insert(seqno, (*uuid, key.clone()));
            }
            None => {
                let seqno = keys.next_seqno;
                keys.next_seqno += 1;
                keys.seqnos.insert(*uuid, seqno);
                keys.by_seqno.insert(seqno, (*uuid, key.clone()));
            }
        }
        Ok(())
    }

    fn delete(&self, uuid: &KeyUuid) -> Result<(), TcsErr> {
        let mut keys = self.keys.write();
        let seqno = keys.seqnos.remove(uuid).ok_or(tcs_err_rc!(PS_KEY_NOTFOUND))?;
        keys.by_seqno.remove(&seqno);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(KeyUuid, StoredKey)>, TcsErr> {
        Ok(self.keys.read().by_seqno.values().cloned().collect())
    }
}

#[cfg(test)]
fn test_record(parent_uuid: KeyUuid, pub_key: &[u8]) -> StoredKey {
    StoredKey {
        parent_uuid,
        pub_key: pub_key.to_vec(),
        blob: Zeroizing::new(vec![1, 2, 3]),
        vendor_data: Vec::new(),
    }
}

#[test]
fn test_memory_store_preserves_registration_order() {
    use crate::interface::SRK_UUID;
    use uuid::Uuid;

    let store = MemoryKeyStore::<sync_types::ParkingLotSyncTypes>::new();
    let a = Uuid::from_u128(0xa);
    let b = Uuid::from_u128(0xb);
    let c = Uuid::from_u128(0xc);
    store.put(&c, &test_record(SRK_UUID, b"c")).unwrap();
    store.put(&a, &test_record(SRK_UUID, b"a")).unwrap();
    store.put(&b, &test_record(a, b"b")).unwrap();
    // Overwriting keeps the original position.
    store.put(&c, &test_record(SRK_UUID, b"c2")).unwrap();

    let order: Vec<_> = store.entries().unwrap().into_iter().map(|(u, _)| u).collect();
    assert_eq!(order, vec![c, a, b]);
    assert_eq!(store.get(&c).unwrap().pub_key, b"c2");

    store.delete(&a).unwrap();
    assert_eq!(store.get(&a), Err(tcs_err_rc!(PS_KEY_NOTFOUND)));
    assert_eq!(store.delete(&a), Err(tcs_err_rc!(PS_KEY_NOTFOUND)));
    assert_eq!(store.entries().unwrap().len(), 2);
}
