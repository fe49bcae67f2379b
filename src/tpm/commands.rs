//! Framing of the few TPM 1.2 commands the resource manager issues itself.

use super::key_blob::{TpmKeyParms, TpmPubkey};
use super::marshal::{CommandBuffer, ResponseBuffer};
use crate::interface::{TcsAuthHandle, TcsErr, TpmAuth, TpmKeyHandle, TpmNonce};

pub const TPM_TAG_RQU_COMMAND: u16 = 0x00c1;
pub const TPM_TAG_RQU_AUTH1_COMMAND: u16 = 0x00c2;
pub const TPM_TAG_RSP_COMMAND: u16 = 0x00c4;
pub const TPM_TAG_RSP_AUTH1_COMMAND: u16 = 0x00c5;

pub const TPM_ORD_OIAP: u32 = 0x0000_000a;
pub const TPM_ORD_OSAP: u32 = 0x0000_000b;
pub const TPM_ORD_LOAD_KEY: u32 = 0x0000_0020;
pub const TPM_ORD_GET_PUB_KEY: u32 = 0x0000_0021;
pub const TPM_ORD_EVICT_KEY: u32 = 0x0000_0022;
pub const TPM_ORD_GET_CAPABILITY: u32 = 0x0000_0065;
pub const TPM_ORD_TERMINATE_HANDLE: u32 = 0x0000_0096;

pub const TPM_CAP_PROPERTY: u32 = 0x0000_0005;
pub const TPM_CAP_KEY_HANDLE: u32 = 0x0000_0007;
pub const TPM_CAP_CHECK_LOADED: u32 = 0x0000_000a;

pub const TPM_CAP_PROP_MAX_AUTHSESS: u32 = 0x0000_010d;
pub const TPM_CAP_PROP_MAX_KEYS: u32 = 0x0000_0110;

/// tag + paramSize + ordinal or returnCode
pub const HEADER_SIZE: usize = 10;

fn begin(tag: u16, ordinal: u32) -> CommandBuffer {
    let mut buf = CommandBuffer::new();
    buf.put_u16(tag);
    // paramSize, patched in finish().
    buf.put_u32(0);
    buf.put_u32(ordinal);
    buf
}

fn finish(mut buf: CommandBuffer) -> Result<Vec<u8>, TcsErr> {
    let size = u32::try_from(buf.len()).map_err(|_| tcs_err_rc!(BAD_PARAMETER))?;
    buf.update_u32(2, size);
    Ok(buf.into_vec())
}

fn put_auth(buf: &mut CommandBuffer, auth: &TpmAuth) {
    buf.put_u32(auth.auth_handle);
    buf.put_bytes(&auth.nonce_odd);
    buf.put_bool(auth.continue_auth_session);
    buf.put_bytes(&auth.hmac);
}

fn get_auth(buf: &mut ResponseBuffer<'_>, auth: &mut TpmAuth) -> Result<(), TcsErr> {
    auth.nonce_even = buf.get_array()?;
    auth.continue_auth_session = buf.get_bool()?;
    auth.hmac = buf.get_array()?;
    Ok(())
}

/// Validate a response's header and position a cursor on its parameters.
///
/// A non-zero chip return code is passed through unchanged.
pub fn parse_response(response: &[u8]) -> Result<ResponseBuffer<'_>, TcsErr> {
    let mut buf = ResponseBuffer::new(response);
    let tag = buf.get_u16()?;
    if tag != TPM_TAG_RSP_COMMAND && tag != TPM_TAG_RSP_AUTH1_COMMAND {
        return Err(tcs_err_rc!(TPM_UNEXPECTED));
    }
    let size = buf.get_u32()? as usize;
    if size != response.len() {
        return Err(tcs_err_rc!(TPM_UNEXPECTED));
    }
    match buf.get_u32()? {
        0 => Ok(buf),
        rc => Err(TcsErr::Rc(rc)),
    }
}

pub fn load_key(
    parent_slot: TpmKeyHandle,
    wrapped_key: &[u8],
    auth: Option<&TpmAuth>,
) -> Result<Vec<u8>, TcsErr> {
    let tag = match auth {
        Some(_) => TPM_TAG_RQU_AUTH1_COMMAND,
        None => TPM_TAG_RQU_COMMAND,
    };
    let mut buf = begin(tag, TPM_ORD_LOAD_KEY);
    buf.put_u32(parent_slot);
    buf.put_bytes(wrapped_key);
    if let Some(auth) = auth {
        put_auth(&mut buf, auth);
    }
    finish(buf)
}

pub fn parse_load_key(
    response: &[u8],
    auth: Option<&mut TpmAuth>,
) -> Result<TpmKeyHandle, TcsErr> {
    let mut buf = parse_response(response)?;
    let slot = buf.get_u32()?;
    if let Some(auth) = auth {
        get_auth(&mut buf, auth)?;
    }
    Ok(slot)
}

pub fn evict_key(slot: TpmKeyHandle) -> Result<Vec<u8>, TcsErr> {
    let mut buf = begin(TPM_TAG_RQU_COMMAND, TPM_ORD_EVICT_KEY);
    buf.put_u32(slot);
    finish(buf)
}

pub fn terminate_handle(handle: TcsAuthHandle) -> Result<Vec<u8>, TcsErr> {
    let mut buf = begin(TPM_TAG_RQU_COMMAND, TPM_ORD_TERMINATE_HANDLE);
    buf.put_u32(handle);
    finish(buf)
}

/// Parse a response carrying no output parameters.
pub fn parse_empty(response: &[u8]) -> Result<(), TcsErr> {
    parse_response(response).map(|_| ())
}

pub fn oiap() -> Result<Vec<u8>, TcsErr> {
    finish(begin(TPM_TAG_RQU_COMMAND, TPM_ORD_OIAP))
}

pub fn parse_oiap(response: &[u8]) -> Result<(TcsAuthHandle, TpmNonce), TcsErr> {
    let mut buf = parse_response(response)?;
    Ok((buf.get_u32()?, buf.get_array()?))
}

pub fn osap(
    entity_type: u16,
    entity_value: u32,
    nonce_odd_osap: &TpmNonce,
) -> Result<Vec<u8>, TcsErr> {
    let mut buf = begin(TPM_TAG_RQU_COMMAND, TPM_ORD_OSAP);
    buf.put_u16(entity_type);
    buf.put_u32(entity_value);
    buf.put_bytes(nonce_odd_osap);
    finish(buf)
}

pub fn parse_osap(response: &[u8]) -> Result<(TcsAuthHandle, TpmNonce, TpmNonce), TcsErr> {
    let mut buf = parse_response(response)?;
    Ok((buf.get_u32()?, buf.get_array()?, buf.get_array()?))
}

pub fn get_pub_key(slot: TpmKeyHandle, auth: Option<&TpmAuth>) -> Result<Vec<u8>, TcsErr> {
    let tag = match auth {
        Some(_) => TPM_TAG_RQU_AUTH1_COMMAND,
        None => TPM_TAG_RQU_COMMAND,
    };
    let mut buf = begin(tag, TPM_ORD_GET_PUB_KEY);
    buf.put_u32(slot);
    if let Some(auth) = auth {
        put_auth(&mut buf, auth);
    }
    finish(buf)
}

/// Returns the marshalled `TPM_PUBKEY` as sent by the chip.
pub fn parse_get_pub_key(response: &[u8], auth: Option<&mut TpmAuth>) -> Result<Vec<u8>, TcsErr> {
    let mut buf = parse_response(response)?;
    let begin = buf.position();
    TpmPubkey::unmarshal(&mut buf)?;
    let pub_key = response[begin..buf.position()].to_vec();
    if let Some(auth) = auth {
        get_auth(&mut buf, auth)?;
    }
    Ok(pub_key)
}

fn get_capability(cap_area: u32, sub_cap: &[u8]) -> Result<Vec<u8>, TcsErr> {
    let mut buf = begin(TPM_TAG_RQU_COMMAND, TPM_ORD_GET_CAPABILITY);
    buf.put_u32(cap_area);
    buf.put_sized(sub_cap)?;
    finish(buf)
}

fn parse_get_capability(response: &[u8]) -> Result<ResponseBuffer<'_>, TcsErr> {
    let mut buf = parse_response(response)?;
    let resp = buf.get_sized()?;
    Ok(ResponseBuffer::new(resp))
}

pub fn check_loaded(parms: &TpmKeyParms) -> Result<Vec<u8>, TcsErr> {
    let mut sub_cap = CommandBuffer::new();
    parms.marshal(&mut sub_cap)?;
    get_capability(TPM_CAP_CHECK_LOADED, sub_cap.as_bytes())
}

pub fn parse_check_loaded(response: &[u8]) -> Result<bool, TcsErr> {
    parse_get_capability(response)?.get_bool()
}

pub fn key_handles() -> Result<Vec<u8>, TcsErr> {
    get_capability(TPM_CAP_KEY_HANDLE, &[])
}

/// Parse a `TPM_KEY_HANDLE_LIST`.
pub fn parse_key_handles(response: &[u8]) -> Result<Vec<TpmKeyHandle>, TcsErr> {
    let mut buf = parse_get_capability(response)?;
    let count = buf.get_u16()?;
    let mut handles = Vec::new();
    handles
        .try_reserve_exact(count as usize)
        .map_err(|_| tcs_err_rc!(OUTOFMEMORY))?;
    for _ in 0..count {
        handles.push(buf.get_u32()?);
    }
    Ok(handles)
}

pub fn property(prop: u32) -> Result<Vec<u8>, TcsErr> {
    get_capability(TPM_CAP_PROPERTY, &prop.to_be_bytes())
}

pub fn parse_property(response: &[u8]) -> Result<u32, TcsErr> {
    parse_get_capability(response)?.get_u32()
}

#[test]
fn test_load_key_framing() {
    let blob = [0xaau8; 5];
    let cmd = load_key(0x0100_0001, &blob, None).unwrap();
    assert_eq!(&cmd[0..2], &TPM_TAG_RQU_COMMAND.to_be_bytes());
    assert_eq!(&cmd[2..6], &(cmd.len() as u32).to_be_bytes());
    assert_eq!(&cmd[6..10], &TPM_ORD_LOAD_KEY.to_be_bytes());
    assert_eq!(&cmd[10..14], &0x0100_0001u32.to_be_bytes());
    assert_eq!(&cmd[14..], &blob);

    let auth = TpmAuth {
        auth_handle: 0x0200_0000,
        continue_auth_session: true,
        ..Default::default()
    };
    let cmd = load_key(0x0100_0001, &blob, Some(&auth)).unwrap();
    assert_eq!(&cmd[0..2], &TPM_TAG_RQU_AUTH1_COMMAND.to_be_bytes());
    // authHandle + nonceOdd + continueAuthSession + pubAuth
    assert_eq!(cmd.len(), HEADER_SIZE + 4 + blob.len() + 4 + 20 + 1 + 20);
    assert_eq!(&cmd[19..23], &0x0200_0000u32.to_be_bytes());
}

#[test]
fn test_parse_response_passes_chip_errors_through() {
    let mut rsp = CommandBuffer::new();
    rsp.put_u16(TPM_TAG_RSP_COMMAND);
    rsp.put_u32(10);
    rsp.put_u32(tcs_rc!(AUTHFAIL));
    assert_eq!(
        parse_load_key(rsp.as_bytes(), None),
        Err(tcs_err_rc!(AUTHFAIL))
    );

    let mut rsp = CommandBuffer::new();
    rsp.put_u16(TPM_TAG_RSP_COMMAND);
    rsp.put_u32(99);
    rsp.put_u32(0);
    assert_eq!(parse_empty(rsp.as_bytes()), Err(tcs_err_rc!(TPM_UNEXPECTED)));
}
