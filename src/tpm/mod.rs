//! Access to the TPM 1.2 chip.
//!
//! [`TpmChannel`] is the raw, externally provided transport. [`Tpm`] wraps it
//! with a request lock, so that at most one command is in flight at any
//! time, and provides typed wrappers for the handful of commands the resource
//! manager issues on its own.

use crate::interface::{
    AuthSessionGrant, AuthSessionRequest, TcsAuthHandle, TcsErr, TpmAuth, TpmKeyHandle,
};
use crate::sync_types::{self, Lock as _};
use tracing::{debug, warn};

pub mod commands;
pub mod key_blob;
pub mod marshal;

pub use key_blob::{TpmKey, TpmKeyParms, TpmPubkey};

/// Transport to the TPM device.
///
/// Implementations transmit a complete, marshalled command and return the
/// complete response. A transport failure is reported as an error rather
/// than as a response carrying a TPM return code.
pub trait TpmChannel: Send + Sync {
    fn submit(&self, command: &[u8]) -> Result<Vec<u8>, TcsErr>;
}

pub struct Tpm<ST: sync_types::SyncTypes, C: TpmChannel> {
    channel: C,
    req_lock: ST::Lock<()>,
}

impl<ST: sync_types::SyncTypes, C: TpmChannel> Tpm<ST, C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            req_lock: ST::Lock::from(()),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Submit a raw command, serialized against every other command.
    pub fn transmit(&self, command: &[u8]) -> Result<Vec<u8>, TcsErr> {
        let _req = self.req_lock.lock();
        self.channel.submit(command)
    }

    pub fn load_key(
        &self,
        parent_slot: TpmKeyHandle,
        wrapped_key: &[u8],
        auth: Option<&mut TpmAuth>,
    ) -> Result<TpmKeyHandle, TcsErr> {
        let cmd = commands::load_key(parent_slot, wrapped_key, auth.as_deref())?;
        let rsp = self.transmit(&cmd)?;
        commands::parse_load_key(&rsp, auth)
    }

    pub fn evict_key(&self, slot: TpmKeyHandle) -> Result<(), TcsErr> {
        let rsp = self.transmit(&commands::evict_key(slot)?)?;
        commands::parse_empty(&rsp)
    }

    pub fn terminate_handle(&self, handle: TcsAuthHandle) -> Result<(), TcsErr> {
        let rsp = self.transmit(&commands::terminate_handle(handle)?)?;
        commands::parse_empty(&rsp)
    }

    /// Create an auth session on the chip.
    pub fn start_auth_session(
        &self,
        request: &AuthSessionRequest,
    ) -> Result<AuthSessionGrant, TcsErr> {
        match request {
            AuthSessionRequest::Oiap => {
                let rsp = self.transmit(&commands::oiap()?)?;
                let (auth_handle, nonce_even) = commands::parse_oiap(&rsp)?;
                Ok(AuthSessionGrant {
                    auth_handle,
                    nonce_even,
                    nonce_even_osap: None,
                })
            }
            AuthSessionRequest::Osap {
                entity_type,
                entity_value,
                nonce_odd_osap,
            } => {
                let cmd = commands::osap(*entity_type, *entity_value, nonce_odd_osap)?;
                let rsp = self.transmit(&cmd)?;
                let (auth_handle, nonce_even, nonce_even_osap) = commands::parse_osap(&rsp)?;
                Ok(AuthSessionGrant {
                    auth_handle,
                    nonce_even,
                    nonce_even_osap: Some(nonce_even_osap),
                })
            }
        }
    }

    /// Returns the marshalled `TPM_PUBKEY` of a loaded key.
    pub fn get_pub_key(
        &self,
        slot: TpmKeyHandle,
        auth: Option<&mut TpmAuth>,
    ) -> Result<Vec<u8>, TcsErr> {
        let cmd = commands::get_pub_key(slot, auth.as_deref())?;
        let rsp = self.transmit(&cmd)?;
        commands::parse_get_pub_key(&rsp, auth)
    }

    /// Whether the chip has room to load a key with the given parameters.
    pub fn can_load_key(&self, parms: &TpmKeyParms) -> Result<bool, TcsErr> {
        let rsp = self.transmit(&commands::check_loaded(parms)?)?;
        commands::parse_check_loaded(&rsp)
    }

    pub fn loaded_key_handles(&self) -> Result<Vec<TpmKeyHandle>, TcsErr> {
        let rsp = self.transmit(&commands::key_handles()?)?;
        commands::parse_key_handles(&rsp)
    }

    /// Whether the given slot currently holds a key.
    ///
    /// Query failures are treated as "not loaded", making the caller fall
    /// back to a reload.
    pub fn is_key_loaded(&self, slot: TpmKeyHandle) -> bool {
        match self.loaded_key_handles() {
            Ok(handles) => handles.contains(&slot),
            Err(e) => {
                warn!("key handle list query failed: {}", e);
                false
            }
        }
    }

    pub fn max_auth_sessions(&self) -> Result<u16, TcsErr> {
        let rsp = self.transmit(&commands::property(commands::TPM_CAP_PROP_MAX_AUTHSESS)?)?;
        let max = commands::parse_property(&rsp)?;
        debug!(max, "chip auth session limit");
        u16::try_from(max).map_err(|_| tcs_err_rc!(TPM_UNEXPECTED))
    }
}
