//! Registration and load state tracking for keys.
//!
//! The [`DiskCache`] mirrors the registrations in the [`KeyStore`], the
//! [`MemCache`] tracks every key loaded since startup along with its current
//! chip slot, if any. Where both are needed at once, the disk cache is always
//! locked first.

use crate::interface::{EnumFilter, KeyInfo, KeyUuid, TcsErr, TcsKeyHandle, TpmKeyHandle, NULL_UUID, SRK_UUID};
use crate::store::{KeyStore, StoredKey};
use crate::sync_types::{self, Lock as _};
use crate::tpm::key_blob::TPM_ALG_RSA;
use crate::tpm::{Tpm, TpmChannel, TpmKey};
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub mod disk_cache;
pub mod eviction;
pub mod mem_cache;

pub use disk_cache::{DiskCache, DiskCacheEntry};
pub use eviction::{EvictionCandidate, EvictionPolicy, LruEvictionPolicy};
pub use mem_cache::{MemCache, MemCacheEntry, SRK_TCS_HANDLE};

/// What's needed to (re)load a known key.
pub struct ReloadInfo {
    pub tpm_slot: Option<TpmKeyHandle>,
    pub parent: Option<TcsKeyHandle>,
    pub key: TpmKey,
    pub blob: Zeroizing<Vec<u8>>,
}

pub struct KeyCache<ST: sync_types::SyncTypes, S: KeyStore> {
    store: S,
    disk: ST::Lock<DiskCache>,
    mem: ST::Lock<MemCache>,
    max_key_chain_len: usize,
    policy: Box<dyn EvictionPolicy>,
}

impl<ST: sync_types::SyncTypes, S: KeyStore> KeyCache<ST, S> {
    /// Populate the caches from the registrations found in `store`.
    pub fn new(
        store: S,
        max_key_chain_len: usize,
        policy: Box<dyn EvictionPolicy>,
    ) -> Result<Self, TcsErr> {
        let mut disk = DiskCache::new();
        let mut srk = None;
        for (uuid, stored) in store.entries()? {
            let entry = match DiskCacheEntry::new(uuid, &stored) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(%uuid, "skipping unparseable key registration: {}", e);
                    continue;
                }
            };
            if uuid == SRK_UUID {
                srk = Some(TpmKey::from_blob(&stored.blob)?.0);
            }
            disk.insert(entry)?;
        }
        debug!(keys = disk.iter().count(), "loaded key registrations");

        Ok(Self {
            store,
            disk: ST::Lock::from(disk),
            mem: ST::Lock::from(MemCache::new(srk)),
            max_key_chain_len,
            policy,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_registered(&self, uuid: &KeyUuid) -> bool {
        self.disk.lock().is_registered(uuid)
    }

    /// Register the wrapped key `blob` under `uuid`.
    ///
    /// The parent must be registered itself, unless it's [`NULL_UUID`].
    pub fn register(
        &self,
        uuid: &KeyUuid,
        parent_uuid: &KeyUuid,
        blob: &[u8],
        vendor_data: &[u8],
    ) -> Result<(), TcsErr> {
        if *uuid == NULL_UUID {
            return Err(tcs_err_rc!(BAD_PARAMETER));
        }
        let (key, _) = TpmKey::from_blob(blob)?;
        let stored = StoredKey {
            parent_uuid: *parent_uuid,
            pub_key: key.pub_key,
            blob: Zeroizing::new(blob.to_vec()),
            vendor_data: vendor_data.to_vec(),
        };
        let entry = DiskCacheEntry::new(*uuid, &stored)?;

        let mut disk = self.disk.lock();
        if disk.is_registered(uuid) {
            debug!(%uuid, "key is already registered");
            return Err(tcs_err_rc!(KEY_ALREADY_REGISTERED));
        }
        if *parent_uuid != NULL_UUID && !disk.is_registered(parent_uuid) {
            debug!(%uuid, %parent_uuid, "parent key is not registered");
            return Err(tcs_err_rc!(PS_KEY_NOTFOUND));
        }
        self.store.put(uuid, &stored)?;
        disk.insert(entry)
    }

    /// Remove a registration. Keys loaded from it stay loaded.
    pub fn unregister(&self, uuid: &KeyUuid) -> Result<(), TcsErr> {
        let mut disk = self.disk.lock();
        if !disk.is_registered(uuid) {
            return Err(tcs_err_rc!(PS_KEY_NOTFOUND));
        }
        self.store.delete(uuid)?;
        disk.remove(uuid).map(|_| ())
    }

    pub fn parent_of(&self, uuid: &KeyUuid) -> Option<KeyUuid> {
        self.disk.lock().parent_of(uuid)
    }

    pub fn lookup_parent_chain(&self, uuid: &KeyUuid) -> Result<Vec<DiskCacheEntry>, TcsErr> {
        Ok(self
            .disk
            .lock()
            .lookup_parent_chain(uuid, self.max_key_chain_len)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// The registration whose public key matches `pub_key`.
    pub fn find_registered_by_pub_key(&self, pub_key: &[u8]) -> Option<KeyUuid> {
        self.disk.lock().find_by_pub_key(pub_key).map(|e| e.uuid)
    }

    fn key_info(entry: &DiskCacheEntry, mem: &MemCache) -> KeyInfo {
        KeyInfo {
            version: entry.version,
            key_uuid: entry.uuid,
            parent_key_uuid: entry.parent_uuid,
            auth_data_usage: entry.auth_data_usage,
            is_loaded: mem.is_uuid_loaded(&entry.uuid),
            vendor_data: entry.vendor_data.clone(),
        }
    }

    pub fn get_registered_key(&self, uuid: &KeyUuid) -> Result<KeyInfo, TcsErr> {
        let disk = self.disk.lock();
        let mem = self.mem.lock();
        let entry = disk.get(uuid).ok_or(tcs_err_rc!(PS_KEY_NOTFOUND))?;
        Ok(Self::key_info(entry, &mem))
    }

    pub fn get_registered_key_blob(&self, uuid: &KeyUuid) -> Result<Zeroizing<Vec<u8>>, TcsErr> {
        Ok(self.store.get(uuid)?.blob)
    }

    /// Look up a registered key's blob by its public key. Only RSA keys are
    /// supported.
    pub fn get_registered_key_by_public_info(
        &self,
        algorithm_id: u32,
        pub_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TcsErr> {
        if algorithm_id != TPM_ALG_RSA {
            debug!(algorithm_id, "unsupported key algorithm");
            return Err(tcs_err_rc!(FAIL));
        }
        let uuid = self
            .find_registered_by_pub_key(pub_key)
            .ok_or(tcs_err_rc!(PS_KEY_NOTFOUND))?;
        self.get_registered_key_blob(&uuid)
    }

    /// A consistent snapshot of the registrations selected by `filter`.
    pub fn enumerate(&self, filter: &EnumFilter) -> Result<Vec<KeyInfo>, TcsErr> {
        let disk = self.disk.lock();
        let mem = self.mem.lock();
        let entries: Vec<&DiskCacheEntry> = match filter {
            EnumFilter::All => disk.iter().collect(),
            EnumFilter::Chain(uuid) => disk.lookup_parent_chain(uuid, self.max_key_chain_len)?,
        };

        let mut infos = Vec::new();
        infos
            .try_reserve_exact(entries.len())
            .map_err(|_| tcs_err_rc!(OUTOFMEMORY))?;
        for entry in entries {
            infos.push(Self::key_info(entry, &mem));
        }
        Ok(infos)
    }

    pub fn find_resident_slot(&self, tcs_handle: TcsKeyHandle) -> Option<TpmKeyHandle> {
        self.mem.lock().find_resident_slot(tcs_handle)
    }

    pub fn is_known(&self, tcs_handle: TcsKeyHandle) -> bool {
        self.mem.lock().contains(tcs_handle)
    }

    pub fn find_by_public_key(&self, pub_key: &[u8]) -> Option<TcsKeyHandle> {
        self.mem.lock().find_by_public_key(pub_key)
    }

    pub fn handles_by_uuid(&self, uuid: &KeyUuid) -> Option<(TcsKeyHandle, Option<TpmKeyHandle>)> {
        self.mem.lock().handles_by_uuid(uuid)
    }

    pub fn reload_info(&self, tcs_handle: TcsKeyHandle) -> Option<ReloadInfo> {
        let mem = self.mem.lock();
        let entry = mem.get(tcs_handle)?;
        Some(ReloadInfo {
            tpm_slot: entry.tpm_slot,
            parent: entry.parent,
            key: entry.key.clone(),
            blob: entry.blob.clone(),
        })
    }

    pub fn insert_resident(
        &self,
        tpm_slot: TpmKeyHandle,
        key: TpmKey,
        blob: &[u8],
        parent: TcsKeyHandle,
    ) -> Result<TcsKeyHandle, TcsErr> {
        self.mem.lock().insert_resident(tpm_slot, key, blob, parent)
    }

    pub fn update_slot(
        &self,
        tcs_handle: TcsKeyHandle,
        tpm_slot: Option<TpmKeyHandle>,
    ) -> Result<(), TcsErr> {
        self.mem.lock().update_slot(tcs_handle, tpm_slot)
    }

    /// Move a key's parent reference, evicting the old parent if that was
    /// its last one.
    pub fn set_parent<C: TpmChannel>(
        &self,
        tpm: &Tpm<ST, C>,
        tcs_handle: TcsKeyHandle,
        parent: TcsKeyHandle,
    ) -> Result<(), TcsErr> {
        let removed = self.mem.lock().set_parent(tcs_handle, parent)?;
        Self::evict_removed(tpm, removed);
        Ok(())
    }

    pub fn set_uuid(&self, tcs_handle: TcsKeyHandle, uuid: &KeyUuid) -> Result<(), TcsErr> {
        self.mem.lock().set_uuid(tcs_handle, uuid)
    }

    pub fn touch(&self, tcs_handle: TcsKeyHandle) {
        self.mem.lock().touch(tcs_handle)
    }

    pub fn inc_ref(&self, tcs_handle: TcsKeyHandle) -> Result<(), TcsErr> {
        self.mem.lock().inc_ref(tcs_handle)
    }

    fn evict_removed<C: TpmChannel>(tpm: &Tpm<ST, C>, removed: Vec<MemCacheEntry>) {
        for entry in removed {
            let tcs_handle = entry.tcs_handle;
            if let Some(tpm_slot) = entry.tpm_slot {
                if let Err(e) = tpm.evict_key(tpm_slot) {
                    warn!(tcs_handle, tpm_slot, "failed to evict unreferenced key: {}", e);
                }
            }
        }
    }

    /// Drop a reference, evicting and forgetting the key once unreferenced.
    /// Parents only kept around for the key go along with it.
    pub fn dec_ref<C: TpmChannel>(&self, tpm: &Tpm<ST, C>, tcs_handle: TcsKeyHandle) {
        let removed = self.mem.lock().dec_ref(tcs_handle);
        Self::evict_removed(tpm, removed);
    }

    /// Evict and forget a key which never got referenced.
    pub fn drop_if_unreferenced<C: TpmChannel>(&self, tpm: &Tpm<ST, C>, tcs_handle: TcsKeyHandle) {
        let removed = self.mem.lock().remove_if_unreferenced(tcs_handle);
        Self::evict_removed(tpm, removed);
    }

    pub fn select_eviction_victim(&self, protect: TcsKeyHandle) -> Option<TcsKeyHandle> {
        self.mem
            .lock()
            .select_eviction_victim(protect, self.policy.as_ref())
    }

    /// Evict a key from the chip, keeping its stable handle valid for a
    /// later reload. Evicting a non-resident key is a no-op.
    pub fn evict<C: TpmChannel>(&self, tpm: &Tpm<ST, C>, tcs_handle: TcsKeyHandle) -> Result<(), TcsErr> {
        if tcs_handle == SRK_TCS_HANDLE {
            return Err(tcs_err_rc!(BAD_PARAMETER));
        }
        let tpm_slot = match self.find_resident_slot(tcs_handle) {
            Some(tpm_slot) => tpm_slot,
            None => return Ok(()),
        };
        tpm.evict_key(tpm_slot)?;
        self.mem.lock().set_slot_by_slot(tpm_slot, None);
        debug!(tcs_handle, tpm_slot, "evicted key");
        Ok(())
    }
}

#[cfg(test)]
fn test_key_cache(
    store: crate::store::MemoryKeyStore<sync_types::ParkingLotSyncTypes>,
) -> KeyCache<sync_types::ParkingLotSyncTypes, crate::store::MemoryKeyStore<sync_types::ParkingLotSyncTypes>> {
    KeyCache::new(store, 4, Box::new(LruEvictionPolicy)).unwrap()
}

#[cfg(test)]
fn test_blob(pub_key: &[u8]) -> Vec<u8> {
    crate::tpm::key_blob::test_key(pub_key, 0).to_blob().unwrap().to_vec()
}

#[test]
fn test_register_round_trip() {
    let cache = test_key_cache(Default::default());
    let a = KeyUuid::from_u128(0xa);
    let b = KeyUuid::from_u128(0xb);

    cache.register(&SRK_UUID, &NULL_UUID, &test_blob(b"srk"), &[]).unwrap();
    cache.register(&a, &SRK_UUID, &test_blob(b"a"), b"vendor").unwrap();
    assert!(cache.is_registered(&a));
    assert_eq!(
        cache.register(&a, &SRK_UUID, &test_blob(b"a"), &[]),
        Err(tcs_err_rc!(KEY_ALREADY_REGISTERED))
    );
    assert_eq!(
        cache.register(&b, &KeyUuid::from_u128(0xdead), &test_blob(b"b"), &[]),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
    assert_eq!(
        cache.register(&b, &a, &[0u8; 3], &[]),
        Err(tcs_err_rc!(BAD_PARAMETER))
    );

    let info = cache.get_registered_key(&a).unwrap();
    assert_eq!(info.parent_key_uuid, SRK_UUID);
    assert_eq!(info.vendor_data, b"vendor");
    assert!(!info.is_loaded);
    assert_eq!(cache.store().get(&a).unwrap().pub_key, b"a");
    assert_eq!(cache.find_registered_by_pub_key(b"a"), Some(a));
    assert_eq!(
        *cache.get_registered_key_by_public_info(TPM_ALG_RSA, b"a").unwrap(),
        test_blob(b"a")
    );
    assert_eq!(
        cache.get_registered_key_by_public_info(TPM_ALG_RSA, b"nope"),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
    assert_eq!(
        cache.get_registered_key_by_public_info(0x0000_0006, b"a"),
        Err(tcs_err_rc!(FAIL))
    );

    cache.unregister(&a).unwrap();
    assert!(!cache.is_registered(&a));
    assert_eq!(cache.unregister(&a), Err(tcs_err_rc!(PS_KEY_NOTFOUND)));
    assert_eq!(
        cache.store().get(&a),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
}

#[test]
fn test_enumerate() {
    let store = crate::store::MemoryKeyStore::<sync_types::ParkingLotSyncTypes>::new();
    let uuids: Vec<_> = (2..6u128).map(KeyUuid::from_u128).collect();
    let put = |uuid: &KeyUuid, parent: &KeyUuid, pub_key: &[u8]| {
        let blob = test_blob(pub_key);
        store
            .put(
                uuid,
                &StoredKey {
                    parent_uuid: *parent,
                    pub_key: pub_key.to_vec(),
                    blob: Zeroizing::new(blob),
                    vendor_data: Vec::new(),
                },
            )
            .unwrap();
    };
    put(&SRK_UUID, &NULL_UUID, b"srk");
    put(&uuids[0], &SRK_UUID, b"k2");
    put(&uuids[1], &uuids[0], b"k3");
    put(&uuids[2], &uuids[1], b"k4");
    // Broken link.
    put(&uuids[3], &KeyUuid::from_u128(0x99), b"k5");
    let cache = test_key_cache(store);

    let all = cache.enumerate(&EnumFilter::All).unwrap();
    let all_uuids: Vec<_> = all.iter().map(|i| i.key_uuid).collect();
    assert_eq!(all_uuids, [&[SRK_UUID][..], &uuids[..]].concat());
    // Only the SRK is resident.
    assert!(all[0].is_loaded);
    assert!(all[1..].iter().all(|i| !i.is_loaded));

    let chain: Vec<_> = cache
        .enumerate(&EnumFilter::Chain(uuids[2]))
        .unwrap()
        .into_iter()
        .map(|i| i.key_uuid)
        .collect();
    assert_eq!(chain, vec![uuids[2], uuids[1], uuids[0], SRK_UUID]);

    assert_eq!(
        cache.enumerate(&EnumFilter::Chain(uuids[3])),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
    assert_eq!(
        cache.enumerate(&EnumFilter::Chain(KeyUuid::from_u128(0x77))),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
}
