//! Handle, result code and exchange types shared across the resource manager
//! and its callers.

use thiserror::Error;
use uuid::Uuid;

/// TSS 1.2 result codes.
///
/// Codes returned by the chip itself live in the TPM layer (no layer bits
/// set), codes originating from the resource manager are tagged with
/// [`TCS_LAYER`](Self::TCS_LAYER).
pub struct TcsRc;

impl TcsRc {
    pub const SUCCESS: u32 = 0x0000;

    pub const LAYER_MASK: u32 = 0x3000;
    pub const TCS_LAYER: u32 = 0x2000;

    // TPM layer.
    pub const AUTHFAIL: u32 = 0x0001;
    pub const BAD_PARAMETER_TPM: u32 = 0x0003;
    pub const BAD_ORDINAL: u32 = 0x000a;
    pub const INVALID_KEYHANDLE: u32 = 0x000c;
    pub const RESOURCES: u32 = 0x0015;
    pub const SIZE: u32 = 0x0017;
    pub const BADTAG: u32 = 0x001e;
    pub const INVALID_AUTHHANDLE: u32 = 0x0022;

    // TCS layer.
    pub const FAIL: u32 = Self::TCS_LAYER | 0x0002;
    pub const BAD_PARAMETER: u32 = Self::TCS_LAYER | 0x0003;
    pub const INTERNAL_ERROR: u32 = Self::TCS_LAYER | 0x0004;
    pub const OUTOFMEMORY: u32 = Self::TCS_LAYER | 0x0005;
    pub const NOTIMPL: u32 = Self::TCS_LAYER | 0x0006;
    pub const KEY_ALREADY_REGISTERED: u32 = Self::TCS_LAYER | 0x0008;
    pub const TPM_UNEXPECTED: u32 = Self::TCS_LAYER | 0x0010;
    pub const COMM_FAILURE: u32 = Self::TCS_LAYER | 0x0011;
    pub const PS_KEY_NOTFOUND: u32 = Self::TCS_LAYER | 0x0020;
    pub const INVALID_CONTEXT: u32 = Self::TCS_LAYER | 0x0804;
    pub const KM_LOADFAILED: u32 = Self::TCS_LAYER | 0x0825;

    pub fn describe(rc: u32) -> &'static str {
        match rc {
            Self::SUCCESS => "success",
            Self::AUTHFAIL => "TPM authorization failure",
            Self::BAD_PARAMETER_TPM => "TPM rejected a parameter",
            Self::BAD_ORDINAL => "TPM does not implement the ordinal",
            Self::INVALID_KEYHANDLE => "invalid TPM key handle",
            Self::RESOURCES => "insufficient resources",
            Self::SIZE => "TPM command size mismatch",
            Self::BADTAG => "bad TPM command tag",
            Self::INVALID_AUTHHANDLE => "invalid TPM auth handle",
            Self::FAIL => "generic failure",
            Self::BAD_PARAMETER => "bad parameter",
            Self::INTERNAL_ERROR => "internal error",
            Self::OUTOFMEMORY => "out of memory",
            Self::NOTIMPL => "not implemented",
            Self::KEY_ALREADY_REGISTERED => "key already registered",
            Self::TPM_UNEXPECTED => "unexpected TPM response",
            Self::COMM_FAILURE => "TPM communication failure",
            Self::PS_KEY_NOTFOUND => "key not found in persistent storage",
            Self::INVALID_CONTEXT => "invalid TCS context",
            Self::KM_LOADFAILED => "key load failed",
            _ => "unrecognized result code",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TcsErr {
    #[error("{} (result code {:#06x})", TcsRc::describe(*.0), .0)]
    Rc(u32),
    #[error("internal error: inconsistent resource manager state")]
    InternalErr,
}

impl TcsErr {
    /// The single result code reported to the client for this error.
    pub fn rc(&self) -> u32 {
        match self {
            Self::Rc(rc) => *rc,
            Self::InternalErr => TcsRc::INTERNAL_ERROR,
        }
    }

    pub fn is_rc(&self, rc: u32) -> bool {
        self.rc() == rc
    }
}

pub type TcsContextHandle = u32;
pub type TcsKeyHandle = u32;
pub type TcsAuthHandle = u32;
pub type TpmKeyHandle = u32;

/// Permanent chip handle of the storage root key.
pub const SRK_TPM_HANDLE: TpmKeyHandle = 0x4000_0000;

pub type KeyUuid = Uuid;

/// Parent of every root key.
pub const NULL_UUID: KeyUuid = Uuid::nil();

/// The storage root key's well-known UUID.
pub const SRK_UUID: KeyUuid = Uuid::from_u128(1);

pub const NONCE_SIZE: usize = 20;
pub const DIGEST_SIZE: usize = 20;

pub type TpmNonce = [u8; NONCE_SIZE];
pub type TpmDigest = [u8; DIGEST_SIZE];

/// Authorization data accompanying a single-auth command, updated in place
/// with the chip's response values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TpmAuth {
    pub auth_handle: TcsAuthHandle,
    pub nonce_odd: TpmNonce,
    pub nonce_even: TpmNonce,
    pub continue_auth_session: bool,
    pub hmac: TpmDigest,
}

/// In/out parameter of a load by UUID, used to hand retry information back
/// to the caller after an authorization failure somewhere in the key's
/// ancestry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadKeyInfo {
    pub key_uuid: KeyUuid,
    pub parent_key_uuid: KeyUuid,
    /// SHA-1 over the LoadKey ordinal and the wrapped key blob.
    pub param_digest: TpmDigest,
    /// Authorization for the parent, used when retrying a load.
    pub auth_data: Option<TpmAuth>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TpmVersion {
    pub major: u8,
    pub minor: u8,
    pub rev_major: u8,
    pub rev_minor: u8,
}

/// Registration information for one key, as returned by enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    pub version: TpmVersion,
    pub key_uuid: KeyUuid,
    pub parent_key_uuid: KeyUuid,
    pub auth_data_usage: u8,
    pub is_loaded: bool,
    pub vendor_data: Vec<u8>,
}

/// Which registered keys an enumeration should report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnumFilter {
    /// Every valid registered key.
    All,
    /// The given key followed by its ancestors up to the root.
    Chain(KeyUuid),
}

/// The two TPM 1.2 authorization session protocols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthSessionRequest {
    Oiap,
    Osap {
        entity_type: u16,
        entity_value: u32,
        nonce_odd_osap: TpmNonce,
    },
}

/// Chip values handed back on successful session creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthSessionGrant {
    pub auth_handle: TcsAuthHandle,
    pub nonce_even: TpmNonce,
    /// Only set for OSAP sessions.
    pub nonce_even_osap: Option<TpmNonce>,
}
