use crate::interface::{TcsErr, TcsRc, TpmAuth, TpmKeyHandle, SRK_TPM_HANDLE};
use crate::sync_types::Lock as _;
use crate::sync_types::{ParkingLotSyncTypes, SyncTypes};
use crate::tpm::commands;
use crate::tpm::key_blob::{TpmKey, TpmKeyParms, TpmPubkey};
use crate::tpm::marshal::{CommandBuffer, ResponseBuffer};
use crate::tpm::TpmChannel;
use std::collections::{BTreeMap, BTreeSet};

const FIRST_KEY_SLOT: TpmKeyHandle = 0x0100_0000;
const FIRST_AUTH_HANDLE: u32 = 0x0200_0000;

struct TestLoadedKey {
    algorithm_parms: TpmKeyParms,
    pub_key: Vec<u8>,
    auth_data_usage: u8,
}

struct TestTpmState {
    max_keys: usize,
    max_auth_sessions: u16,
    keys: BTreeMap<TpmKeyHandle, TestLoadedKey>,
    next_key_slot: TpmKeyHandle,
    auth_sessions: BTreeSet<u32>,
    next_auth_handle: u32,
    srk: TestLoadedKey,
    /// Public keys of every successful LoadKey, in order.
    load_log: Vec<Vec<u8>>,
    evictions: usize,
    fail_evictions: bool,
}

/// A TPM 1.2 chip simulation speaking the command subset the resource
/// manager issues.
///
/// Key slots and auth sessions are limited as configured. LoadKey under a
/// parent whose usage requires authorization fails with `AUTHFAIL` unless an
/// auth session is presented. HMACs are not verified.
pub struct TestTpm {
    state: <ParkingLotSyncTypes as SyncTypes>::Lock<TestTpmState>,
}

impl TestTpm {
    pub fn new(max_keys: usize, max_auth_sessions: u16) -> Self {
        let srk = crate::tpm::key_blob::test_key(b"srk", 0);
        Self {
            state: <ParkingLotSyncTypes as SyncTypes>::Lock::from(TestTpmState {
                max_keys,
                max_auth_sessions,
                keys: BTreeMap::new(),
                next_key_slot: FIRST_KEY_SLOT,
                auth_sessions: BTreeSet::new(),
                next_auth_handle: FIRST_AUTH_HANDLE,
                srk: TestLoadedKey {
                    algorithm_parms: srk.algorithm_parms,
                    pub_key: srk.pub_key,
                    auth_data_usage: 0,
                },
                load_log: Vec::new(),
                evictions: 0,
                fail_evictions: false,
            }),
        }
    }

    pub fn set_srk_auth_data_usage(&self, auth_data_usage: u8) {
        self.state.lock().srk.auth_data_usage = auth_data_usage;
    }

    pub fn set_fail_evictions(&self, fail: bool) {
        self.state.lock().fail_evictions = fail;
    }

    pub fn loaded_keys(&self) -> usize {
        self.state.lock().keys.len()
    }

    pub fn load_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().load_log.clone()
    }

    pub fn evictions(&self) -> usize {
        self.state.lock().evictions
    }

    pub fn open_auth_sessions(&self) -> usize {
        self.state.lock().auth_sessions.len()
    }

    /// Drop a key behind the resource manager's back, like a chip reset
    /// would.
    pub fn forget_key(&self, slot: TpmKeyHandle) {
        self.state.lock().keys.remove(&slot);
    }

    fn execute(
        state: &mut TestTpmState,
        tag: u16,
        ordinal: u32,
        params: &mut ResponseBuffer<'_>,
        rsp: &mut CommandBuffer,
    ) -> Result<bool, u32> {
        let auth1 = tag == commands::TPM_TAG_RQU_AUTH1_COMMAND;
        match ordinal {
            commands::TPM_ORD_OIAP => {
                let handle = Self::new_auth_session(state)?;
                rsp.put_u32(handle);
                rsp.put_bytes(&[handle as u8; 20]);
            }
            commands::TPM_ORD_OSAP => {
                let _entity_type = params.get_u16().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let _entity_value = params.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let nonce_odd_osap: [u8; 20] =
                    params.get_array().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let handle = Self::new_auth_session(state)?;
                rsp.put_u32(handle);
                rsp.put_bytes(&[handle as u8; 20]);
                rsp.put_bytes(&nonce_odd_osap.map(|b| !b));
            }
            commands::TPM_ORD_TERMINATE_HANDLE => {
                let handle = params.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                if !state.auth_sessions.remove(&handle) {
                    return Err(TcsRc::INVALID_AUTHHANDLE);
                }
            }
            commands::TPM_ORD_LOAD_KEY => {
                let parent_slot = params.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let key = TpmKey::unmarshal(params).map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let auth = if auth1 {
                    Some(Self::check_auth(state, params)?)
                } else {
                    None
                };
                let parent_auth_data_usage = if parent_slot == SRK_TPM_HANDLE {
                    state.srk.auth_data_usage
                } else {
                    state
                        .keys
                        .get(&parent_slot)
                        .ok_or(TcsRc::INVALID_KEYHANDLE)?
                        .auth_data_usage
                };
                if parent_auth_data_usage != 0 && auth.is_none() {
                    return Err(TcsRc::AUTHFAIL);
                }
                if state.keys.len() >= state.max_keys {
                    return Err(TcsRc::RESOURCES);
                }
                let slot = state.next_key_slot;
                state.next_key_slot += 1;
                state.load_log.push(key.pub_key.clone());
                state.keys.insert(
                    slot,
                    TestLoadedKey {
                        algorithm_parms: key.algorithm_parms,
                        pub_key: key.pub_key,
                        auth_data_usage: key.auth_data_usage,
                    },
                );
                rsp.put_u32(slot);
                if let Some(auth) = auth {
                    Self::put_auth(rsp, &auth);
                }
            }
            commands::TPM_ORD_EVICT_KEY => {
                let slot = params.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                if state.fail_evictions {
                    return Err(TcsRc::BAD_PARAMETER_TPM);
                }
                state.keys.remove(&slot).ok_or(TcsRc::INVALID_KEYHANDLE)?;
                state.evictions += 1;
            }
            commands::TPM_ORD_GET_PUB_KEY => {
                let slot = params.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let auth = if auth1 {
                    Some(Self::check_auth(state, params)?)
                } else {
                    None
                };
                let key = if slot == SRK_TPM_HANDLE {
                    &state.srk
                } else {
                    state.keys.get(&slot).ok_or(TcsRc::INVALID_KEYHANDLE)?
                };
                if key.auth_data_usage != 0 && auth.is_none() {
                    return Err(TcsRc::AUTHFAIL);
                }
                TpmPubkey {
                    algorithm_parms: key.algorithm_parms.clone(),
                    pub_key: key.pub_key.clone(),
                }
                .marshal(rsp)
                .map_err(|_| TcsRc::SIZE)?;
                if let Some(auth) = auth {
                    Self::put_auth(rsp, &auth);
                }
            }
            commands::TPM_ORD_GET_CAPABILITY => {
                let cap_area = params.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let sub_cap = params.get_sized().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                let mut cap = CommandBuffer::new();
                match cap_area {
                    commands::TPM_CAP_CHECK_LOADED => {
                        let mut sub_cap = ResponseBuffer::new(sub_cap);
                        TpmKeyParms::unmarshal(&mut sub_cap)
                            .map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
                        cap.put_bool(state.keys.len() < state.max_keys);
                    }
                    commands::TPM_CAP_KEY_HANDLE => {
                        cap.put_u16(state.keys.len() as u16);
                        for slot in state.keys.keys() {
                            cap.put_u32(*slot);
                        }
                    }
                    commands::TPM_CAP_PROPERTY => {
                        let mut sub_cap = ResponseBuffer::new(sub_cap);
                        match sub_cap.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)? {
                            commands::TPM_CAP_PROP_MAX_AUTHSESS => {
                                cap.put_u32(state.max_auth_sessions as u32)
                            }
                            commands::TPM_CAP_PROP_MAX_KEYS => cap.put_u32(state.max_keys as u32),
                            _ => return Err(TcsRc::BAD_PARAMETER_TPM),
                        }
                    }
                    _ => return Err(TcsRc::BAD_PARAMETER_TPM),
                }
                rsp.put_sized(cap.as_bytes()).map_err(|_| TcsRc::SIZE)?;
            }
            _ => return Err(TcsRc::BAD_ORDINAL),
        }
        Ok(auth1)
    }

    fn new_auth_session(state: &mut TestTpmState) -> Result<u32, u32> {
        if state.auth_sessions.len() >= state.max_auth_sessions as usize {
            return Err(TcsRc::RESOURCES);
        }
        let handle = state.next_auth_handle;
        state.next_auth_handle += 1;
        state.auth_sessions.insert(handle);
        Ok(handle)
    }

    fn check_auth(state: &TestTpmState, params: &mut ResponseBuffer<'_>) -> Result<TpmAuth, u32> {
        let mut auth = TpmAuth {
            auth_handle: params.get_u32().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?,
            ..Default::default()
        };
        auth.nonce_odd = params.get_array().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
        auth.continue_auth_session = params.get_bool().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
        auth.hmac = params.get_array().map_err(|_| TcsRc::BAD_PARAMETER_TPM)?;
        if !state.auth_sessions.contains(&auth.auth_handle) {
            return Err(TcsRc::INVALID_AUTHHANDLE);
        }
        Ok(auth)
    }

    fn put_auth(rsp: &mut CommandBuffer, auth: &TpmAuth) {
        rsp.put_bytes(&auth.nonce_odd.map(|b| b ^ 0x5a));
        rsp.put_bool(auth.continue_auth_session);
        rsp.put_bytes(&[0xac; 20]);
    }
}

impl TpmChannel for TestTpm {
    fn submit(&self, command: &[u8]) -> Result<Vec<u8>, TcsErr> {
        let mut cmd = ResponseBuffer::new(command);
        let tag = cmd.get_u16()?;
        let size = cmd.get_u32()?;
        let ordinal = cmd.get_u32()?;

        let mut params = CommandBuffer::new();
        let result = if size as usize != command.len() {
            Err(TcsRc::SIZE)
        } else if tag != commands::TPM_TAG_RQU_COMMAND
            && tag != commands::TPM_TAG_RQU_AUTH1_COMMAND
        {
            Err(TcsRc::BADTAG)
        } else {
            Self::execute(&mut *self.state.lock(), tag, ordinal, &mut cmd, &mut params)
        };

        let mut rsp = CommandBuffer::new();
        let (rsp_tag, rc) = match result {
            Ok(true) => (commands::TPM_TAG_RSP_AUTH1_COMMAND, 0),
            Ok(false) => (commands::TPM_TAG_RSP_COMMAND, 0),
            Err(rc) => {
                params = CommandBuffer::new();
                (commands::TPM_TAG_RSP_COMMAND, rc)
            }
        };
        rsp.put_u16(rsp_tag);
        rsp.put_u32((commands::HEADER_SIZE + params.len()) as u32);
        rsp.put_u32(rc);
        rsp.put_bytes(params.as_bytes());
        Ok(rsp.into_vec())
    }
}

#[test]
fn test_tpm_key_slot_capacity() {
    use crate::tpm::Tpm;

    let tpm = Tpm::<ParkingLotSyncTypes, _>::new(TestTpm::new(1, 2));
    let key = crate::tpm::key_blob::test_key(b"k1", 0);
    let blob = key.to_blob().unwrap();
    assert!(tpm.can_load_key(&key.algorithm_parms).unwrap());
    let slot = tpm.load_key(SRK_TPM_HANDLE, &blob, None).unwrap();
    assert!(tpm.is_key_loaded(slot));
    assert!(!tpm.can_load_key(&key.algorithm_parms).unwrap());
    assert_eq!(
        tpm.load_key(SRK_TPM_HANDLE, &blob, None),
        Err(tcs_err_rc!(RESOURCES))
    );
    assert_eq!(tpm.get_pub_key(slot, None).unwrap().len(), 4 + 2 + 2 + 4 + 12 + 4 + 2);
    tpm.evict_key(slot).unwrap();
    assert!(!tpm.is_key_loaded(slot));
    assert_eq!(tpm.max_auth_sessions().unwrap(), 2);
}
