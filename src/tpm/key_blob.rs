//! The TPM 1.2 `TPM_KEY` wrapped key structure.
//!
//! Only the public part matters to the resource manager: the algorithm
//! parameters are needed to ask the chip whether a key fits, the public key
//! identifies the key across loads. The encrypted part is carried opaquely.

use super::marshal::{CommandBuffer, ResponseBuffer};
use crate::interface::{TcsErr, TpmVersion};
use zeroize::Zeroizing;

pub const TPM_ALG_RSA: u32 = 0x0000_0001;

/// `TPM_KEY_PARMS`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TpmKeyParms {
    pub algorithm_id: u32,
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub parms: Vec<u8>,
}

impl TpmKeyParms {
    pub fn unmarshal(buf: &mut ResponseBuffer<'_>) -> Result<Self, TcsErr> {
        Ok(Self {
            algorithm_id: buf.get_u32()?,
            enc_scheme: buf.get_u16()?,
            sig_scheme: buf.get_u16()?,
            parms: buf.get_sized()?.to_vec(),
        })
    }

    pub fn marshal(&self, buf: &mut CommandBuffer) -> Result<(), TcsErr> {
        buf.put_u32(self.algorithm_id);
        buf.put_u16(self.enc_scheme);
        buf.put_u16(self.sig_scheme);
        buf.put_sized(&self.parms)
    }
}

/// `TPM_PUBKEY`, as returned by GetPubKey.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TpmPubkey {
    pub algorithm_parms: TpmKeyParms,
    pub pub_key: Vec<u8>,
}

impl TpmPubkey {
    pub fn unmarshal(buf: &mut ResponseBuffer<'_>) -> Result<Self, TcsErr> {
        Ok(Self {
            algorithm_parms: TpmKeyParms::unmarshal(buf)?,
            pub_key: buf.get_sized()?.to_vec(),
        })
    }

    pub fn marshal(&self, buf: &mut CommandBuffer) -> Result<(), TcsErr> {
        self.algorithm_parms.marshal(buf)?;
        buf.put_sized(&self.pub_key)
    }
}

/// `TPM_KEY`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TpmKey {
    pub version: TpmVersion,
    pub key_usage: u16,
    pub key_flags: u32,
    pub auth_data_usage: u8,
    pub algorithm_parms: TpmKeyParms,
    pub pcr_info: Vec<u8>,
    /// The `TPM_STORE_PUBKEY` key material.
    pub pub_key: Vec<u8>,
    pub enc_data: Zeroizing<Vec<u8>>,
}

impl TpmKey {
    /// Parse a wrapped key blob handed in by a client.
    ///
    /// Returns the key along with the number of bytes the structure spans,
    /// trailing data is not part of the key.
    pub fn from_blob(blob: &[u8]) -> Result<(Self, usize), TcsErr> {
        let mut buf = ResponseBuffer::new_client(blob);
        let key = Self::unmarshal(&mut buf)?;
        Ok((key, buf.position()))
    }

    pub fn unmarshal(buf: &mut ResponseBuffer<'_>) -> Result<Self, TcsErr> {
        let version = TpmVersion {
            major: buf.get_u8()?,
            minor: buf.get_u8()?,
            rev_major: buf.get_u8()?,
            rev_minor: buf.get_u8()?,
        };
        Ok(Self {
            version,
            key_usage: buf.get_u16()?,
            key_flags: buf.get_u32()?,
            auth_data_usage: buf.get_u8()?,
            algorithm_parms: TpmKeyParms::unmarshal(buf)?,
            pcr_info: buf.get_sized()?.to_vec(),
            pub_key: buf.get_sized()?.to_vec(),
            enc_data: Zeroizing::new(buf.get_sized()?.to_vec()),
        })
    }

    pub fn marshal(&self, buf: &mut CommandBuffer) -> Result<(), TcsErr> {
        buf.put_u8(self.version.major);
        buf.put_u8(self.version.minor);
        buf.put_u8(self.version.rev_major);
        buf.put_u8(self.version.rev_minor);
        buf.put_u16(self.key_usage);
        buf.put_u32(self.key_flags);
        buf.put_u8(self.auth_data_usage);
        self.algorithm_parms.marshal(buf)?;
        buf.put_sized(&self.pcr_info)?;
        buf.put_sized(&self.pub_key)?;
        buf.put_sized(&self.enc_data)
    }

    pub fn to_blob(&self) -> Result<Zeroizing<Vec<u8>>, TcsErr> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf)?;
        Ok(Zeroizing::new(buf.into_vec()))
    }
}

#[cfg(test)]
pub(crate) fn test_key(pub_key: &[u8], auth_data_usage: u8) -> TpmKey {
    TpmKey {
        version: TpmVersion {
            major: 1,
            minor: 1,
            rev_major: 0,
            rev_minor: 0,
        },
        key_usage: 0x0011,
        key_flags: 0,
        auth_data_usage,
        algorithm_parms: TpmKeyParms {
            algorithm_id: TPM_ALG_RSA,
            enc_scheme: 0x0003,
            sig_scheme: 0x0001,
            parms: vec![0, 0, 8, 0, 0, 0, 0, 2, 0, 0, 0, 0],
        },
        pcr_info: Vec::new(),
        pub_key: pub_key.to_vec(),
        enc_data: Zeroizing::new(vec![0xe5; 32]),
    }
}

#[test]
fn test_key_blob_parse_ignores_trailing_data() {
    let key = test_key(b"public key material", 1);
    let mut blob = key.to_blob().unwrap().to_vec();
    let key_len = blob.len();
    blob.extend_from_slice(&[0xff; 7]);

    let (parsed, consumed) = TpmKey::from_blob(&blob).unwrap();
    assert_eq!(consumed, key_len);
    assert_eq!(parsed, key);
    assert_eq!(parsed.pub_key, b"public key material");
}

#[test]
fn test_key_blob_parse_truncated() {
    let blob = test_key(b"pub", 0).to_blob().unwrap();
    assert_eq!(
        TpmKey::from_blob(&blob[..blob.len() - 1]).unwrap_err(),
        tcs_err_rc!(BAD_PARAMETER)
    );
}
