//! Resource manager tunables.

use crate::interface::TcsErr;
use serde::Deserialize;

/// Default depth of the auth session wait queue.
pub const DEFAULT_OVERFLOW_AUTHS: usize = 16;

/// Default bound on the length of a key's parent chain.
pub const DEFAULT_MAX_KEY_CHAIN_LEN: usize = 10;

pub const DEFAULT_NUM_WORKERS: usize = 10;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceManagerConfig {
    /// Size of the worker thread pool serving client requests. At most
    /// `num_workers - 1` of them may ever be blocked waiting for an auth
    /// session.
    pub num_workers: usize,
    /// Capacity of the auth session wait queue.
    pub overflow_auths: usize,
    /// Maximum number of keys in a parent chain, the key itself included.
    pub max_key_chain_len: usize,
    /// Maximum number of concurrently open auth sessions. Queried from the
    /// chip if unset.
    pub max_auth_sessions: Option<u16>,
    /// Whether the chip supports saving and restoring auth session contexts.
    pub auth_ctx_swap: bool,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            overflow_auths: DEFAULT_OVERFLOW_AUTHS,
            max_key_chain_len: DEFAULT_MAX_KEY_CHAIN_LEN,
            max_auth_sessions: None,
            auth_ctx_swap: false,
        }
    }
}

impl ResourceManagerConfig {
    pub(crate) fn check_params(&self) -> Result<(), TcsErr> {
        if self.num_workers == 0 || self.overflow_auths == 0 || self.max_key_chain_len == 0 {
            return Err(tcs_err_rc!(BAD_PARAMETER));
        }
        if let Some(0) = self.max_auth_sessions {
            return Err(tcs_err_rc!(BAD_PARAMETER));
        }
        Ok(())
    }
}

#[test]
fn test_config_defaults_from_partial_document() {
    let config: ResourceManagerConfig =
        serde_json::from_str(r#"{ "num_workers": 4, "max_auth_sessions": 3 }"#).unwrap();
    assert_eq!(config.num_workers, 4);
    assert_eq!(config.max_auth_sessions, Some(3));
    assert_eq!(config.overflow_auths, DEFAULT_OVERFLOW_AUTHS);
    assert_eq!(config.max_key_chain_len, DEFAULT_MAX_KEY_CHAIN_LEN);
    assert!(!config.auth_ctx_swap);
    assert!(config.check_params().is_ok());
}

#[test]
fn test_config_rejects_degenerate_values() {
    let config = ResourceManagerConfig {
        num_workers: 0,
        ..Default::default()
    };
    assert_eq!(config.check_params(), Err(tcs_err_rc!(BAD_PARAMETER)));

    let config = ResourceManagerConfig {
        max_auth_sessions: Some(0),
        ..Default::default()
    };
    assert_eq!(config.check_params(), Err(tcs_err_rc!(BAD_PARAMETER)));

    assert!(serde_json::from_str::<ResourceManagerConfig>(r#"{ "threads": 4 }"#).is_err());
}
