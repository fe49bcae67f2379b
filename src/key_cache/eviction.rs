//! Choice of the key to evict when the chip runs out of key slots.

use crate::interface::{TcsKeyHandle, TpmKeyHandle};

/// A resident key eligible for eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub tcs_handle: TcsKeyHandle,
    pub tpm_slot: TpmKeyHandle,
    /// Value of the memory cache's use counter at the key's last load or
    /// use.
    pub lru_seqno: u64,
}

pub trait EvictionPolicy: Send + Sync {
    /// Pick one of `candidates`, or `None` to give up.
    ///
    /// `last_lru_seqno` is the memory cache's current use counter, all
    /// candidates' [`lru_seqno`](EvictionCandidate::lru_seqno) are at or
    /// below it.
    fn select_victim(
        &self,
        candidates: &mut dyn Iterator<Item = EvictionCandidate>,
        last_lru_seqno: u64,
    ) -> Option<TcsKeyHandle>;
}

/// Evict the least recently loaded or used key.
#[derive(Clone, Copy, Debug, Default)]
pub struct LruEvictionPolicy;

impl EvictionPolicy for LruEvictionPolicy {
    fn select_victim(
        &self,
        candidates: &mut dyn Iterator<Item = EvictionCandidate>,
        last_lru_seqno: u64,
    ) -> Option<TcsKeyHandle> {
        let mut found_victim: Option<(TcsKeyHandle, u64)> = None;
        for candidate in candidates {
            let age = last_lru_seqno.wrapping_sub(candidate.lru_seqno);
            match found_victim {
                Some((_, cur_victim_age)) if cur_victim_age >= age => (),
                _ => found_victim = Some((candidate.tcs_handle, age)),
            }
        }
        found_victim.map(|(tcs_handle, _)| tcs_handle)
    }
}

#[test]
fn test_lru_picks_oldest() {
    let candidates = [
        EvictionCandidate {
            tcs_handle: 1,
            tpm_slot: 0x100,
            lru_seqno: 7,
        },
        EvictionCandidate {
            tcs_handle: 2,
            tpm_slot: 0x101,
            lru_seqno: 3,
        },
        EvictionCandidate {
            tcs_handle: 3,
            tpm_slot: 0x102,
            lru_seqno: 9,
        },
    ];
    let policy = LruEvictionPolicy;
    assert_eq!(policy.select_victim(&mut candidates.iter().copied(), 10), Some(2));
    assert_eq!(policy.select_victim(&mut core::iter::empty(), 10), None);
}
