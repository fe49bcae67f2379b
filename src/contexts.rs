//! Client context bookkeeping.

use crate::interface::{TcsContextHandle, TcsErr, TcsKeyHandle};
use crate::sync_types::{self, Lock as _};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Default)]
struct Context {
    /// Memory cache entries this context holds a reference on.
    loaded_keys: BTreeSet<TcsKeyHandle>,
}

struct ContextsInner {
    last_handle: TcsContextHandle,
    contexts: BTreeMap<TcsContextHandle, Context>,
}

pub struct Contexts<ST: sync_types::SyncTypes> {
    inner: ST::Lock<ContextsInner>,
}

impl<ST: sync_types::SyncTypes> Contexts<ST> {
    pub fn new() -> Self {
        Self {
            inner: ST::Lock::from(ContextsInner {
                last_handle: 0,
                contexts: BTreeMap::new(),
            }),
        }
    }

    pub fn open(&self) -> Result<TcsContextHandle, TcsErr> {
        let mut inner = self.inner.lock();
        let mut handle = inner.last_handle;
        // Zero is never a valid context handle.
        loop {
            handle = handle.wrapping_add(1);
            if handle == inner.last_handle {
                return Err(tcs_err_rc!(OUTOFMEMORY));
            }
            if handle != 0 && !inner.contexts.contains_key(&handle) {
                break;
            }
        }
        inner.last_handle = handle;
        inner.contexts.insert(handle, Context::default());
        debug!(context = handle, "opened context");
        Ok(handle)
    }

    pub fn verify(&self, context: TcsContextHandle) -> Result<(), TcsErr> {
        if self.inner.lock().contexts.contains_key(&context) {
            Ok(())
        } else {
            debug!(context, "invalid context");
            Err(tcs_err_rc!(INVALID_CONTEXT))
        }
    }

    /// Record that `context` holds a reference on `key`.
    ///
    /// Returns whether the reference is new, in which case the caller must
    /// account for it in the memory cache.
    pub fn mark_key_loaded(&self, context: TcsContextHandle, key: TcsKeyHandle) -> Result<bool, TcsErr> {
        let mut inner = self.inner.lock();
        let ctx = inner
            .contexts
            .get_mut(&context)
            .ok_or(tcs_err_rc!(INVALID_CONTEXT))?;
        Ok(ctx.loaded_keys.insert(key))
    }

    /// Remove `context`, returning the keys it held references on.
    pub fn close(&self, context: TcsContextHandle) -> Result<Vec<TcsKeyHandle>, TcsErr> {
        let ctx = self
            .inner
            .lock()
            .contexts
            .remove(&context)
            .ok_or(tcs_err_rc!(INVALID_CONTEXT))?;
        debug!(context, keys = ctx.loaded_keys.len(), "closed context");
        Ok(ctx.loaded_keys.into_iter().collect())
    }
}

impl<ST: sync_types::SyncTypes> Default for Contexts<ST> {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_context_lifecycle() {
    let contexts = Contexts::<sync_types::ParkingLotSyncTypes>::new();
    let a = contexts.open().unwrap();
    let b = contexts.open().unwrap();
    assert_ne!(a, 0);
    assert_ne!(a, b);
    assert!(contexts.verify(a).is_ok());

    assert!(contexts.mark_key_loaded(a, 0x10).unwrap());
    assert!(!contexts.mark_key_loaded(a, 0x10).unwrap());
    assert!(contexts.mark_key_loaded(a, 0x11).unwrap());
    assert_eq!(contexts.close(a).unwrap(), vec![0x10, 0x11]);

    assert_eq!(contexts.verify(a), Err(tcs_err_rc!(INVALID_CONTEXT)));
    assert_eq!(contexts.close(a), Err(tcs_err_rc!(INVALID_CONTEXT)));
    assert_eq!(
        contexts.mark_key_loaded(a, 0x10),
        Err(tcs_err_rc!(INVALID_CONTEXT))
    );
    assert!(contexts.verify(b).is_ok());
}
