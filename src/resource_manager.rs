//! The resource manager instance owning all shared state.

use crate::auth_mgr::AuthManager;
use crate::config::ResourceManagerConfig;
use crate::contexts::Contexts;
use crate::interface::{
    AuthSessionGrant, AuthSessionRequest, EnumFilter, KeyInfo, KeyUuid, TcsAuthHandle,
    TcsContextHandle, TcsErr, TpmNonce,
};
use crate::key_cache::{EvictionPolicy, KeyCache, LruEvictionPolicy};
use crate::store::KeyStore;
use crate::sync_types::{self, Lock as _};
use crate::tpm::{Tpm, TpmChannel};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Arbitrates a single TPM 1.2 chip between concurrent client contexts.
///
/// Auth sessions are admitted against the chip's session limit, keys are
/// swapped in and out of the chip's slots behind stable handles.
pub struct ResourceManager<ST: sync_types::SyncTypes, C: TpmChannel, S: KeyStore> {
    pub(crate) config: ResourceManagerConfig,
    pub(crate) tpm: Tpm<ST, C>,
    pub(crate) auth_mgr: AuthManager<ST>,
    pub(crate) contexts: Contexts<ST>,
    pub(crate) key_cache: KeyCache<ST, S>,
    /// Serializes key loads and evictions, so that a key made resident for
    /// one request isn't evicted for another before it got used.
    pub(crate) key_load_lock: ST::Lock<()>,
}

impl<ST: sync_types::SyncTypes, C: TpmChannel, S: KeyStore> ResourceManager<ST, C, S> {
    pub fn new(config: ResourceManagerConfig, channel: C, store: S) -> Result<Self, TcsErr> {
        Self::with_eviction_policy(config, channel, store, Box::new(LruEvictionPolicy))
    }

    pub fn with_eviction_policy(
        config: ResourceManagerConfig,
        channel: C,
        store: S,
        policy: Box<dyn EvictionPolicy>,
    ) -> Result<Self, TcsErr> {
        config.check_params()?;
        let tpm = Tpm::new(channel);
        let max_auth_sessions = match config.max_auth_sessions {
            Some(max_auth_sessions) => max_auth_sessions,
            None => tpm.max_auth_sessions()?,
        };
        let auth_mgr = AuthManager::new(&config, max_auth_sessions)?;
        let key_cache = KeyCache::new(store, config.max_key_chain_len, policy)?;
        info!(
            max_auth_sessions,
            num_workers = config.num_workers,
            "resource manager initialized"
        );

        Ok(Self {
            config,
            tpm,
            auth_mgr,
            contexts: Contexts::new(),
            key_cache,
            key_load_lock: ST::Lock::from(()),
        })
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    pub fn tpm(&self) -> &Tpm<ST, C> {
        &self.tpm
    }

    pub fn auth_mgr(&self) -> &AuthManager<ST> {
        &self.auth_mgr
    }

    pub fn key_cache(&self) -> &KeyCache<ST, S> {
        &self.key_cache
    }

    pub fn open_context(&self) -> Result<TcsContextHandle, TcsErr> {
        self.contexts.open()
    }

    /// Tear down a context: its auth sessions get closed and its key
    /// references dropped, evicting keys nobody references anymore.
    pub fn close_context(&self, context: TcsContextHandle) -> Result<(), TcsErr> {
        let keys = self.contexts.close(context)?;
        let sessions = self.auth_mgr.close_context(&self.tpm, context);

        let _load = self.key_load_lock.lock();
        for key in keys.iter() {
            self.key_cache.dec_ref(&self.tpm, *key);
        }
        debug!(context, sessions, keys = keys.len(), "released context resources");
        Ok(())
    }

    /// Open an OIAP session, waiting for a free slot if needed.
    pub fn oiap(&self, context: TcsContextHandle) -> Result<AuthSessionGrant, TcsErr> {
        self.contexts.verify(context)?;
        self.auth_mgr
            .acquire(&self.tpm, context, &AuthSessionRequest::Oiap)
    }

    /// Open an OSAP session, waiting for a free slot if needed.
    pub fn osap(
        &self,
        context: TcsContextHandle,
        entity_type: u16,
        entity_value: u32,
        nonce_odd_osap: &TpmNonce,
    ) -> Result<AuthSessionGrant, TcsErr> {
        self.contexts.verify(context)?;
        let request = AuthSessionRequest::Osap {
            entity_type,
            entity_value,
            nonce_odd_osap: *nonce_odd_osap,
        };
        self.auth_mgr.acquire(&self.tpm, context, &request)
    }

    pub fn terminate_handle(
        &self,
        context: TcsContextHandle,
        auth_handle: TcsAuthHandle,
    ) -> Result<(), TcsErr> {
        self.contexts.verify(context)?;
        self.auth_mgr.check(context, auth_handle)?;
        self.auth_mgr.release(&self.tpm, auth_handle);
        Ok(())
    }

    pub fn register_key(
        &self,
        context: TcsContextHandle,
        uuid: &KeyUuid,
        parent_uuid: &KeyUuid,
        blob: &[u8],
        vendor_data: &[u8],
    ) -> Result<(), TcsErr> {
        self.contexts.verify(context)?;
        self.key_cache.register(uuid, parent_uuid, blob, vendor_data)
    }

    pub fn unregister_key(&self, context: TcsContextHandle, uuid: &KeyUuid) -> Result<(), TcsErr> {
        self.contexts.verify(context)?;
        self.key_cache.unregister(uuid)
    }

    pub fn enum_registered_keys(
        &self,
        context: TcsContextHandle,
        filter: &EnumFilter,
    ) -> Result<Vec<KeyInfo>, TcsErr> {
        self.contexts.verify(context)?;
        self.key_cache.enumerate(filter)
    }

    pub fn get_registered_key(
        &self,
        context: TcsContextHandle,
        uuid: &KeyUuid,
    ) -> Result<KeyInfo, TcsErr> {
        self.contexts.verify(context)?;
        self.key_cache.get_registered_key(uuid)
    }

    pub fn get_registered_key_blob(
        &self,
        context: TcsContextHandle,
        uuid: &KeyUuid,
    ) -> Result<Zeroizing<Vec<u8>>, TcsErr> {
        self.contexts.verify(context)?;
        self.key_cache.get_registered_key_blob(uuid)
    }

    pub fn get_registered_key_by_public_info(
        &self,
        context: TcsContextHandle,
        algorithm_id: u32,
        pub_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TcsErr> {
        self.contexts.verify(context)?;
        self.key_cache
            .get_registered_key_by_public_info(algorithm_id, pub_key)
    }

    /// Wake up every thread waiting for an auth session, making them and any
    /// later session requests fail.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.auth_mgr.shutdown();
    }
}

#[cfg(test)]
pub(crate) type TestResourceManager = ResourceManager<
    sync_types::ParkingLotSyncTypes,
    crate::test::tpm::TestTpm,
    crate::store::MemoryKeyStore<sync_types::ParkingLotSyncTypes>,
>;

/// A resource manager on a [`TestTpm`](crate::test::tpm::TestTpm) with room
/// for `max_keys` keys besides the SRK, whose registration is
/// pre-populated.
#[cfg(test)]
pub(crate) fn test_resource_manager(
    max_keys: usize,
    max_auth_sessions: u16,
    config: ResourceManagerConfig,
) -> TestResourceManager {
    use crate::interface::{NULL_UUID, SRK_UUID};
    use crate::store::{MemoryKeyStore, StoredKey};

    crate::test::init_logging();
    let srk = crate::tpm::key_blob::test_key(b"srk", 0);
    let store = MemoryKeyStore::new();
    store
        .put(
            &SRK_UUID,
            &StoredKey {
                parent_uuid: NULL_UUID,
                pub_key: srk.pub_key.clone(),
                blob: srk.to_blob().unwrap(),
                vendor_data: Vec::new(),
            },
        )
        .unwrap();
    ResourceManager::new(
        config,
        crate::test::tpm::TestTpm::new(max_keys, max_auth_sessions),
        store,
    )
    .unwrap()
}

#[test]
fn test_session_limit_queried_from_chip() {
    let rm = test_resource_manager(4, 3, ResourceManagerConfig::default());
    assert_eq!(rm.auth_mgr().max_auth_sessions(), 3);

    let config = ResourceManagerConfig {
        max_auth_sessions: Some(2),
        ..Default::default()
    };
    let rm = test_resource_manager(4, 3, config);
    assert_eq!(rm.auth_mgr().max_auth_sessions(), 2);
}

#[test]
fn test_close_context_releases_sessions() {
    let rm = test_resource_manager(4, 4, ResourceManagerConfig::default());
    let ctx1 = rm.open_context().unwrap();
    let ctx2 = rm.open_context().unwrap();

    let grant = rm.oiap(ctx1).unwrap();
    rm.osap(ctx1, 0x0001, 0x4000_0000, &[7u8; 20]).unwrap();
    assert_eq!(rm.tpm().channel().open_auth_sessions(), 2);
    assert_eq!(
        rm.terminate_handle(ctx2, grant.auth_handle),
        Err(tcs_err_rc!(INTERNAL_ERROR))
    );

    rm.close_context(ctx1).unwrap();
    assert_eq!(rm.tpm().channel().open_auth_sessions(), 0);
    assert_eq!(rm.auth_mgr().open_sessions(), 0);
    assert_eq!(rm.oiap(ctx1), Err(tcs_err_rc!(INVALID_CONTEXT)));
    assert_eq!(rm.close_context(ctx1), Err(tcs_err_rc!(INVALID_CONTEXT)));

    let grant = rm.oiap(ctx2).unwrap();
    rm.terminate_handle(ctx2, grant.auth_handle).unwrap();
    assert_eq!(rm.tpm().channel().open_auth_sessions(), 0);
}

#[test]
fn test_shutdown_fails_session_requests() {
    let rm = test_resource_manager(4, 4, ResourceManagerConfig::default());
    let ctx = rm.open_context().unwrap();
    rm.shutdown();
    assert_eq!(rm.oiap(ctx), Err(tcs_err_rc!(FAIL)));
}
