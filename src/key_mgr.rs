//! Key load orchestration.
//!
//! Clients load keys either from a wrapped blob under an already known parent
//! or through their registration, in which case the key's ancestry gets
//! loaded as needed. Either way, the client receives a stable handle which
//! stays valid across evictions: whenever the key is needed again, it's
//! transparently reloaded, its parents first.

use crate::auth_mgr::AuthSessionGuard;
use crate::interface::{
    KeyUuid, LoadKeyInfo, TcsContextHandle, TcsErr, TcsKeyHandle, TpmAuth, TpmKeyHandle, NULL_UUID,
    SRK_TPM_HANDLE,
};
use crate::key_cache::SRK_TCS_HANDLE;
use crate::resource_manager::ResourceManager;
use crate::store::KeyStore;
use crate::sync_types::{self, Lock as _};
use crate::tpm::commands::TPM_ORD_LOAD_KEY;
use crate::tpm::{TpmChannel, TpmKey};
use digest::Digest as _;
use tracing::{debug, warn};

impl<ST: sync_types::SyncTypes, C: TpmChannel, S: KeyStore> ResourceManager<ST, C, S> {
    /// Verify that a client supplied auth session belongs to `context` and
    /// arrange for it to get released once the request is done.
    fn guard_auth_session(
        &self,
        context: TcsContextHandle,
        auth: Option<&TpmAuth>,
    ) -> Result<Option<AuthSessionGuard<'_, ST, C>>, TcsErr> {
        match auth {
            Some(auth) => {
                self.auth_mgr.check(context, auth.auth_handle)?;
                Ok(Some(self.auth_mgr.release_on_drop(&self.tpm, auth.auth_handle)))
            }
            None => Ok(None),
        }
    }

    /// Account for `context` using the key. A key loaded just now for it is
    /// dropped again on failure.
    fn take_key_reference(&self, context: TcsContextHandle, tcs_handle: TcsKeyHandle) -> Result<(), TcsErr> {
        let r = match self.contexts.mark_key_loaded(context, tcs_handle) {
            Ok(true) => self.key_cache.inc_ref(tcs_handle),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if r.is_err() {
            self.key_cache.drop_if_unreferenced(&self.tpm, tcs_handle);
        }
        r
    }

    /// Make room in the chip if needed and load `blob` under the parent
    /// resident at `parent_slot`.
    fn load_into_chip(
        &self,
        parent: TcsKeyHandle,
        parent_slot: TpmKeyHandle,
        key: &TpmKey,
        blob: &[u8],
        auth: Option<&mut TpmAuth>,
    ) -> Result<TpmKeyHandle, TcsErr> {
        while !self.tpm.can_load_key(&key.algorithm_parms)? {
            // The parent must stay resident for the load.
            let victim = match self.key_cache.select_eviction_victim(parent) {
                Some(victim) => victim,
                None => {
                    warn!(parent, "no room for key and nothing to evict");
                    return Err(tcs_err_rc!(RESOURCES));
                }
            };
            self.key_cache.evict(&self.tpm, victim)?;
        }

        let tpm_slot = self.tpm.load_key(parent_slot, blob, auth)?;
        debug!(parent, parent_slot, tpm_slot, "loaded key");
        Ok(tpm_slot)
    }

    /// Find the chip slot of a known key, reloading it and its ancestry if
    /// evicted. The recorded slot of a resident key is trusted.
    fn load_key_shim_locked(&self, tcs_handle: TcsKeyHandle, depth: usize) -> Result<TpmKeyHandle, TcsErr> {
        if tcs_handle == SRK_TCS_HANDLE {
            return Ok(SRK_TPM_HANDLE);
        }
        if depth >= self.config.max_key_chain_len {
            warn!(tcs_handle, "key chain too long");
            return Err(tcs_err_rc!(KM_LOADFAILED));
        }

        let reload = match self.key_cache.reload_info(tcs_handle) {
            Some(reload) => reload,
            None => {
                debug!(tcs_handle, "unknown key");
                return Err(tcs_err_rc!(KM_LOADFAILED));
            }
        };
        if let Some(tpm_slot) = reload.tpm_slot {
            self.key_cache.touch(tcs_handle);
            return Ok(tpm_slot);
        }

        // Roots other than the SRK can't be reloaded.
        let parent = reload.parent.ok_or(tcs_err_rc!(KM_LOADFAILED))?;
        let parent_slot = self.resolve_parent_slot(parent, depth + 1)?;
        let tpm_slot = self.load_into_chip(parent, parent_slot, &reload.key, &reload.blob, None)?;
        self.key_cache.update_slot(tcs_handle, Some(tpm_slot))?;
        debug!(tcs_handle, tpm_slot, "reloaded key");
        Ok(tpm_slot)
    }

    fn resolve_parent_slot(&self, parent: TcsKeyHandle, depth: usize) -> Result<TpmKeyHandle, TcsErr> {
        if !self.key_cache.is_known(parent) {
            debug!(parent, "parent key unknown");
            return Err(tcs_err_rc!(KM_LOADFAILED));
        }
        self.load_key_shim_locked(parent, depth)
    }

    /// Like [`load_key_shim_locked()`](Self::load_key_shim_locked), but
    /// confirm a resident key's presence with the chip first.
    fn ensure_key_loaded_locked(&self, tcs_handle: TcsKeyHandle) -> Result<TpmKeyHandle, TcsErr> {
        if tcs_handle == SRK_TCS_HANDLE {
            return Ok(SRK_TPM_HANDLE);
        }
        if let Some(tpm_slot) = self.key_cache.find_resident_slot(tcs_handle) {
            if self.tpm.is_key_loaded(tpm_slot) {
                self.key_cache.touch(tcs_handle);
                return Ok(tpm_slot);
            }
            debug!(tcs_handle, tpm_slot, "key vanished from the chip");
            self.key_cache.update_slot(tcs_handle, None)?;
        }
        self.load_key_shim_locked(tcs_handle, 0)
    }

    fn load_key_by_blob_locked(
        &self,
        context: TcsContextHandle,
        parent: TcsKeyHandle,
        blob: &[u8],
        auth: Option<&mut TpmAuth>,
    ) -> Result<TcsKeyHandle, TcsErr> {
        let (key, key_len) = TpmKey::from_blob(blob)?;
        let blob = &blob[..key_len];
        let parent_slot = self.resolve_parent_slot(parent, 0)?;

        let known = self.key_cache.find_by_public_key(&key.pub_key);
        if known == Some(SRK_TCS_HANDLE) {
            self.take_key_reference(context, SRK_TCS_HANDLE)?;
            return Ok(SRK_TCS_HANDLE);
        }
        let prev_slot = known.and_then(|h| self.key_cache.find_resident_slot(h));
        if let (Some(tcs_handle), Some(tpm_slot), None) = (known, prev_slot, auth.as_ref()) {
            if self.tpm.is_key_loaded(tpm_slot) {
                debug!(tcs_handle, tpm_slot, "key already loaded");
                self.key_cache.touch(tcs_handle);
                self.take_key_reference(context, tcs_handle)?;
                return Ok(tcs_handle);
            }
        }

        let tpm_slot = self.load_into_chip(parent, parent_slot, &key, blob, auth)?;
        let tcs_handle = match known {
            Some(tcs_handle) => {
                if let Some(prev_slot) = prev_slot.filter(|s| *s != tpm_slot) {
                    if self.tpm.is_key_loaded(prev_slot) {
                        if let Err(e) = self.tpm.evict_key(prev_slot) {
                            warn!(tcs_handle, prev_slot, "failed to evict stale key copy: {}", e);
                        }
                    }
                }
                self.key_cache.update_slot(tcs_handle, Some(tpm_slot))?;
                self.key_cache.set_parent(&self.tpm, tcs_handle, parent)?;
                tcs_handle
            }
            None => self.key_cache.insert_resident(tpm_slot, key, blob, parent)?,
        };
        self.take_key_reference(context, tcs_handle)?;
        Ok(tcs_handle)
    }

    /// Load a wrapped key under a known parent, returning the key's stable
    /// handle.
    ///
    /// A supplied auth session is consumed, whatever the outcome.
    pub fn load_key_by_blob(
        &self,
        context: TcsContextHandle,
        parent: TcsKeyHandle,
        blob: &[u8],
        auth: Option<&mut TpmAuth>,
    ) -> Result<TcsKeyHandle, TcsErr> {
        self.contexts.verify(context)?;
        let _auth_session = self.guard_auth_session(context, auth.as_deref())?;
        let _load = self.key_load_lock.lock();
        self.load_key_by_blob_locked(context, parent, blob, auth)
    }

    fn load_key_by_uuid_locked(
        &self,
        context: TcsContextHandle,
        uuid: &KeyUuid,
        mut load_info: Option<&mut LoadKeyInfo>,
        depth: usize,
    ) -> Result<TcsKeyHandle, TcsErr> {
        if depth >= self.config.max_key_chain_len {
            warn!(%uuid, "key chain too long");
            return Err(tcs_err_rc!(KM_LOADFAILED));
        }

        // A retry after an authorization failure, with the parent loaded
        // already.
        if let Some(load_info) = load_info.as_deref_mut() {
            if load_info.parent_key_uuid != NULL_UUID {
                let blob = self.key_cache.get_registered_key_blob(&load_info.key_uuid)?;
                let (parent, _) = self
                    .key_cache
                    .handles_by_uuid(&load_info.parent_key_uuid)
                    .ok_or(tcs_err_rc!(KM_LOADFAILED))?;
                let tcs_handle =
                    self.load_key_by_blob_locked(context, parent, &blob, load_info.auth_data.as_mut())?;
                self.key_cache.set_uuid(tcs_handle, &load_info.key_uuid)?;
                return Ok(tcs_handle);
            }
        }

        if let Some((tcs_handle, Some(_))) = self.key_cache.handles_by_uuid(uuid) {
            self.key_cache.touch(tcs_handle);
            self.take_key_reference(context, tcs_handle)?;
            return Ok(tcs_handle);
        }

        let blob = self.key_cache.get_registered_key_blob(uuid)?;
        let parent_uuid = match self.key_cache.parent_of(uuid) {
            Some(parent_uuid) if parent_uuid != NULL_UUID => parent_uuid,
            _ => {
                debug!(%uuid, "no loadable parent");
                return Err(tcs_err_rc!(KM_LOADFAILED));
            }
        };
        let parent = self.load_key_by_uuid_locked(context, &parent_uuid, load_info.as_deref_mut(), depth + 1)?;

        let tcs_handle = match self.load_key_by_blob_locked(context, parent, &blob, None) {
            Ok(tcs_handle) => tcs_handle,
            Err(e) if e.is_rc(tcs_rc!(AUTHFAIL)) && load_info.is_some() => {
                if let Some(load_info) = load_info {
                    load_info.key_uuid = *uuid;
                    load_info.parent_key_uuid = parent_uuid;
                    load_info.param_digest.copy_from_slice(
                        &sha1::Sha1::new()
                            .chain_update(TPM_ORD_LOAD_KEY.to_be_bytes())
                            .chain_update(&*blob)
                            .finalize(),
                    );
                }
                debug!(%uuid, %parent_uuid, "parent requires authorization");
                return Err(tcs_err_rc!(KM_LOADFAILED));
            }
            Err(e) => return Err(e),
        };
        self.key_cache.set_uuid(tcs_handle, uuid)?;
        Ok(tcs_handle)
    }

    /// Load a registered key, along with any of its ancestors not loaded
    /// yet.
    ///
    /// Should a parent require authorization, `load_info` gets filled in
    /// with what's needed to retry the failing step with an auth session
    /// and `KM_LOADFAILED` is returned. A retry is requested by passing a
    /// `load_info` with the parent's UUID set.
    pub fn load_key_by_uuid(
        &self,
        context: TcsContextHandle,
        uuid: &KeyUuid,
        load_info: Option<&mut LoadKeyInfo>,
    ) -> Result<TcsKeyHandle, TcsErr> {
        self.contexts.verify(context)?;
        let retry_auth = load_info
            .as_deref()
            .filter(|load_info| load_info.parent_key_uuid != NULL_UUID)
            .and_then(|load_info| load_info.auth_data.as_ref());
        let _auth_session = self.guard_auth_session(context, retry_auth)?;
        let _load = self.key_load_lock.lock();
        self.load_key_by_uuid_locked(context, uuid, load_info, 0)
    }

    /// Get the chip slot of a key known by its stable handle, reloading it if
    /// needed.
    pub fn load_key_shim(&self, context: TcsContextHandle, tcs_handle: TcsKeyHandle) -> Result<TpmKeyHandle, TcsErr> {
        self.contexts.verify(context)?;
        let _load = self.key_load_lock.lock();
        self.load_key_shim_locked(tcs_handle, 0)
    }

    /// Make sure a key is actually present in the chip, reloading it if
    /// needed.
    pub fn ensure_key_loaded(
        &self,
        context: TcsContextHandle,
        tcs_handle: TcsKeyHandle,
    ) -> Result<TpmKeyHandle, TcsErr> {
        self.contexts.verify(context)?;
        let _load = self.key_load_lock.lock();
        self.ensure_key_loaded_locked(tcs_handle)
    }

    /// Evict a key from the chip. Its stable handle remains valid and the
    /// key gets reloaded on next use.
    pub fn evict_key(&self, context: TcsContextHandle, tcs_handle: TcsKeyHandle) -> Result<(), TcsErr> {
        self.contexts.verify(context)?;
        let _load = self.key_load_lock.lock();
        self.key_cache.evict(&self.tpm, tcs_handle)
    }

    /// Returns the marshalled `TPM_PUBKEY` of a key.
    pub fn get_pub_key(
        &self,
        context: TcsContextHandle,
        tcs_handle: TcsKeyHandle,
        auth: Option<&mut TpmAuth>,
    ) -> Result<Vec<u8>, TcsErr> {
        self.contexts.verify(context)?;
        let _auth_session = self.guard_auth_session(context, auth.as_deref())?;
        let _load = self.key_load_lock.lock();
        let tpm_slot = self.ensure_key_loaded_locked(tcs_handle).map_err(|e| {
            debug!(tcs_handle, "failed to load key: {}", e);
            tcs_err_rc!(KM_LOADFAILED)
        })?;
        self.tpm.get_pub_key(tpm_slot, auth)
    }
}

#[cfg(test)]
use crate::{config::ResourceManagerConfig, interface::SRK_UUID, resource_manager::test_resource_manager};

#[cfg(test)]
fn test_blob(pub_key: &[u8], auth_data_usage: u8) -> Vec<u8> {
    crate::tpm::key_blob::test_key(pub_key, auth_data_usage)
        .to_blob()
        .unwrap()
        .to_vec()
}

/// Register a chain of keys below the SRK, root first.
#[cfg(test)]
fn register_chain(
    rm: &crate::resource_manager::TestResourceManager,
    context: TcsContextHandle,
    pub_keys: &[&[u8]],
) -> Vec<KeyUuid> {
    let mut parent = SRK_UUID;
    let mut uuids = Vec::new();
    for (i, pub_key) in pub_keys.iter().enumerate() {
        let uuid = KeyUuid::from_u128(0x100 + i as u128);
        rm.register_key(context, &uuid, &parent, &test_blob(pub_key, 0), &[])
            .unwrap();
        uuids.push(uuid);
        parent = uuid;
    }
    uuids
}

#[test]
fn test_load_by_uuid_loads_ancestry_root_first() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let uuids = register_chain(&rm, ctx, &[b"a", b"b", b"c"]);

    let c = rm.load_key_by_uuid(ctx, &uuids[2], None).unwrap();
    assert_eq!(
        rm.tpm().channel().load_log(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
    // Loaded already, nothing to do.
    assert_eq!(rm.load_key_by_uuid(ctx, &uuids[2], None), Ok(c));
    assert_eq!(rm.tpm().channel().load_log().len(), 3);

    let infos = rm
        .enum_registered_keys(ctx, &crate::interface::EnumFilter::All)
        .unwrap();
    assert_eq!(infos.len(), 4);
    assert!(infos.iter().all(|info| info.is_loaded));

    assert_eq!(rm.load_key_by_uuid(ctx, &SRK_UUID, None), Ok(SRK_TCS_HANDLE));
    assert_eq!(rm.tpm().channel().load_log().len(), 3);

    assert_eq!(
        rm.load_key_by_uuid(ctx, &KeyUuid::from_u128(0x999), None),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
}

#[test]
fn test_evicted_key_reloads_under_same_handle() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let uuids = register_chain(&rm, ctx, &[b"a", b"b"]);
    let a = rm.load_key_by_uuid(ctx, &uuids[0], None).unwrap();
    let b = rm.load_key_by_uuid(ctx, &uuids[1], None).unwrap();

    rm.evict_key(ctx, b).unwrap();
    rm.evict_key(ctx, a).unwrap();
    assert_eq!(rm.tpm().channel().loaded_keys(), 0);
    // Evicting twice is fine.
    rm.evict_key(ctx, a).unwrap();
    assert_eq!(rm.evict_key(ctx, SRK_TCS_HANDLE), Err(tcs_err_rc!(BAD_PARAMETER)));

    // The child's reload brings back its parent first.
    let slot = rm.ensure_key_loaded(ctx, b).unwrap();
    assert_eq!(rm.key_cache().find_resident_slot(b), Some(slot));
    assert!(rm.key_cache().find_resident_slot(a).is_some());
    assert_eq!(rm.tpm().channel().load_log()[2..], [b"a".to_vec(), b"b".to_vec()]);

    // Loading the same blob again yields the same handle.
    let blob = rm.get_registered_key_blob(ctx, &uuids[1]).unwrap();
    assert_eq!(rm.load_key_by_blob(ctx, a, &blob, None), Ok(b));
    assert_eq!(rm.tpm().channel().load_log().len(), 4);

    // A key dropped by the chip behind our back gets noticed.
    rm.tpm().channel().forget_key(slot);
    let pub_key = rm.get_pub_key(ctx, b, None).unwrap();
    assert!(pub_key.ends_with(b"b"));
    assert_eq!(rm.tpm().channel().load_log().len(), 5);
}

#[test]
fn test_load_by_blob() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();

    let mut blob = test_blob(b"k", 0);
    blob.extend_from_slice(&[0xff; 4]);
    let k = rm.load_key_by_blob(ctx, SRK_TCS_HANDLE, &blob, None).unwrap();
    assert_ne!(k, SRK_TCS_HANDLE);
    assert_eq!(rm.tpm().channel().loaded_keys(), 1);

    assert_eq!(
        rm.load_key_by_blob(ctx, 0xdead, &test_blob(b"l", 0), None),
        Err(tcs_err_rc!(KM_LOADFAILED))
    );
    assert_eq!(
        rm.load_key_by_blob(ctx, SRK_TCS_HANDLE, &blob[..8], None),
        Err(tcs_err_rc!(BAD_PARAMETER))
    );
    assert_eq!(
        rm.load_key_by_blob(0x7777, SRK_TCS_HANDLE, &blob, None),
        Err(tcs_err_rc!(INVALID_CONTEXT))
    );
    // The SRK is never loaded.
    assert_eq!(
        rm.load_key_by_blob(ctx, SRK_TCS_HANDLE, &test_blob(b"srk", 0), None),
        Ok(SRK_TCS_HANDLE)
    );
    assert_eq!(rm.tpm().channel().load_log().len(), 1);
}

#[test]
fn test_auth_session_released_after_load() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let other = rm.open_context().unwrap();
    rm.tpm().channel().set_srk_auth_data_usage(1);

    let grant = rm.oiap(ctx).unwrap();
    let mut auth = TpmAuth {
        auth_handle: grant.auth_handle,
        continue_auth_session: true,
        ..Default::default()
    };
    // Sessions of other contexts are refused.
    assert_eq!(
        rm.load_key_by_blob(other, SRK_TCS_HANDLE, &test_blob(b"k", 0), Some(&mut auth)),
        Err(tcs_err_rc!(INTERNAL_ERROR))
    );
    assert_eq!(rm.auth_mgr().open_sessions(), 1);

    rm.load_key_by_blob(ctx, SRK_TCS_HANDLE, &test_blob(b"k", 0), Some(&mut auth))
        .unwrap();
    assert_ne!(auth.nonce_even, [0u8; 20]);
    assert_eq!(rm.auth_mgr().open_sessions(), 0);
    assert_eq!(rm.tpm().channel().open_auth_sessions(), 0);

    // Released on failure, too.
    let grant = rm.oiap(ctx).unwrap();
    let mut auth = TpmAuth {
        auth_handle: grant.auth_handle,
        ..Default::default()
    };
    assert_eq!(
        rm.load_key_by_blob(ctx, 0xdead, &test_blob(b"l", 0), Some(&mut auth)),
        Err(tcs_err_rc!(KM_LOADFAILED))
    );
    assert_eq!(rm.auth_mgr().open_sessions(), 0);
}

#[test]
fn test_load_by_uuid_authfail_retry() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let a = KeyUuid::from_u128(0xa);
    let b = KeyUuid::from_u128(0xb);
    // Loading b requires authorization for a.
    rm.register_key(ctx, &a, &SRK_UUID, &test_blob(b"a", 1), &[]).unwrap();
    let b_blob = test_blob(b"b", 0);
    rm.register_key(ctx, &b, &a, &b_blob, &[]).unwrap();

    let mut load_info = LoadKeyInfo::default();
    assert_eq!(
        rm.load_key_by_uuid(ctx, &b, Some(&mut load_info)),
        Err(tcs_err_rc!(KM_LOADFAILED))
    );
    assert_eq!(load_info.key_uuid, b);
    assert_eq!(load_info.parent_key_uuid, a);
    let mut expected_digest = sha1::Sha1::new();
    expected_digest.update(TPM_ORD_LOAD_KEY.to_be_bytes());
    expected_digest.update(&b_blob);
    assert_eq!(load_info.param_digest[..], expected_digest.finalize()[..]);
    // Without retry information, the plain error is reported.
    assert_eq!(
        rm.load_key_by_uuid(ctx, &b, None),
        Err(tcs_err_rc!(AUTHFAIL))
    );

    let grant = rm.oiap(ctx).unwrap();
    load_info.auth_data = Some(TpmAuth {
        auth_handle: grant.auth_handle,
        ..Default::default()
    });
    let b_handle = rm.load_key_by_uuid(ctx, &b, Some(&mut load_info)).unwrap();
    assert_eq!(rm.auth_mgr().open_sessions(), 0);
    // The retried key is known by its UUID from now on.
    assert_eq!(rm.load_key_by_uuid(ctx, &b, None), Ok(b_handle));
}

#[test]
fn test_capacity_evicts_least_recently_used() {
    let rm = test_resource_manager(2, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let k1 = rm
        .load_key_by_blob(ctx, SRK_TCS_HANDLE, &test_blob(b"k1", 0), None)
        .unwrap();
    let k2 = rm
        .load_key_by_blob(ctx, SRK_TCS_HANDLE, &test_blob(b"k2", 0), None)
        .unwrap();
    rm.ensure_key_loaded(ctx, k1).unwrap();

    let k3 = rm
        .load_key_by_blob(ctx, SRK_TCS_HANDLE, &test_blob(b"k3", 0), None)
        .unwrap();
    assert_eq!(rm.tpm().channel().evictions(), 1);
    assert!(rm.key_cache().find_resident_slot(k1).is_some());
    assert_eq!(rm.key_cache().find_resident_slot(k2), None);
    assert!(rm.key_cache().find_resident_slot(k3).is_some());

    // Eviction failures surface.
    rm.tpm().channel().set_fail_evictions(true);
    assert!(rm.ensure_key_loaded(ctx, k2).is_err());
    rm.tpm().channel().set_fail_evictions(false);
    rm.ensure_key_loaded(ctx, k2).unwrap();
    assert_eq!(rm.tpm().channel().loaded_keys(), 2);
}

#[test]
fn test_no_eviction_victim() {
    let rm = test_resource_manager(1, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let a = rm
        .load_key_by_blob(ctx, SRK_TCS_HANDLE, &test_blob(b"a", 0), None)
        .unwrap();
    // The parent is the only resident key and must stay.
    assert_eq!(
        rm.load_key_by_blob(ctx, a, &test_blob(b"b", 0), None),
        Err(tcs_err_rc!(RESOURCES))
    );
}

#[test]
fn test_close_context_drops_key_references() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx1 = rm.open_context().unwrap();
    let ctx2 = rm.open_context().unwrap();
    let k = rm
        .load_key_by_blob(ctx1, SRK_TCS_HANDLE, &test_blob(b"k", 0), None)
        .unwrap();
    assert_eq!(
        rm.load_key_by_blob(ctx2, SRK_TCS_HANDLE, &test_blob(b"k", 0), None),
        Ok(k)
    );

    rm.close_context(ctx1).unwrap();
    assert!(rm.key_cache().is_known(k));
    assert_eq!(rm.tpm().channel().loaded_keys(), 1);

    rm.close_context(ctx2).unwrap();
    assert!(!rm.key_cache().is_known(k));
    assert_eq!(rm.tpm().channel().loaded_keys(), 0);
    assert!(rm.key_cache().is_known(SRK_TCS_HANDLE));
}

#[test]
fn test_get_pub_key() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let srk_pub = rm.get_pub_key(ctx, SRK_TCS_HANDLE, None).unwrap();
    assert!(srk_pub.ends_with(b"srk"));
    assert_eq!(
        rm.get_pub_key(ctx, 0xdead, None),
        Err(tcs_err_rc!(KM_LOADFAILED))
    );

    let k = rm
        .load_key_by_blob(ctx, SRK_TCS_HANDLE, &test_blob(b"k", 1), None)
        .unwrap();
    assert_eq!(rm.get_pub_key(ctx, k, None), Err(tcs_err_rc!(AUTHFAIL)));
    let grant = rm.oiap(ctx).unwrap();
    let mut auth = TpmAuth {
        auth_handle: grant.auth_handle,
        ..Default::default()
    };
    assert!(rm.get_pub_key(ctx, k, Some(&mut auth)).unwrap().ends_with(b"k"));
    assert_eq!(rm.auth_mgr().open_sessions(), 0);
}

#[test]
fn test_parent_outlives_its_loader() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx1 = rm.open_context().unwrap();
    let ctx2 = rm.open_context().unwrap();
    let p = rm
        .load_key_by_blob(ctx1, SRK_TCS_HANDLE, &test_blob(b"p", 0), None)
        .unwrap();
    let c = rm.load_key_by_blob(ctx2, p, &test_blob(b"c", 0), None).unwrap();

    // The child still needs its parent for reloads.
    rm.close_context(ctx1).unwrap();
    assert!(rm.key_cache().is_known(p));
    rm.evict_key(ctx2, c).unwrap();
    rm.evict_key(ctx2, p).unwrap();
    assert_eq!(rm.tpm().channel().loaded_keys(), 0);
    let slot = rm.ensure_key_loaded(ctx2, c).unwrap();
    assert_eq!(rm.key_cache().find_resident_slot(c), Some(slot));
    assert!(rm.key_cache().find_resident_slot(p).is_some());

    // The last user of the child takes both along.
    rm.close_context(ctx2).unwrap();
    assert!(!rm.key_cache().is_known(c));
    assert!(!rm.key_cache().is_known(p));
    assert_eq!(rm.tpm().channel().loaded_keys(), 0);
}

#[test]
fn test_unregistered_key_stays_loaded() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    let uuids = register_chain(&rm, ctx, &[b"a"]);
    let a = rm.load_key_by_uuid(ctx, &uuids[0], None).unwrap();

    rm.unregister_key(ctx, &uuids[0]).unwrap();
    assert!(rm.key_cache().find_resident_slot(a).is_some());
    rm.ensure_key_loaded(ctx, a).unwrap();
    // Reloading works off the loaded copy's blob.
    rm.evict_key(ctx, a).unwrap();
    let slot = rm.ensure_key_loaded(ctx, a).unwrap();
    assert_eq!(rm.key_cache().find_resident_slot(a), Some(slot));
    assert_eq!(rm.tpm().channel().load_log().len(), 2);

    let registered: Vec<_> = rm
        .enum_registered_keys(ctx, &crate::interface::EnumFilter::All)
        .unwrap()
        .into_iter()
        .map(|info| info.key_uuid)
        .collect();
    assert_eq!(registered, vec![SRK_UUID]);
    assert_eq!(
        rm.get_registered_key(ctx, &uuids[0]),
        Err(tcs_err_rc!(PS_KEY_NOTFOUND))
    );
}

#[test]
fn test_load_for_closed_context_is_undone() {
    let rm = test_resource_manager(8, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    rm.close_context(ctx).unwrap();

    // The context got closed while its load was in flight.
    let _load = rm.key_load_lock.lock();
    assert_eq!(
        rm.load_key_by_blob_locked(ctx, SRK_TCS_HANDLE, &test_blob(b"k", 0), None),
        Err(tcs_err_rc!(INVALID_CONTEXT))
    );
    assert_eq!(rm.tpm().channel().load_log().len(), 1);
    assert_eq!(rm.key_cache().find_by_public_key(b"k"), None);
    assert_eq!(rm.tpm().channel().loaded_keys(), 0);
}
