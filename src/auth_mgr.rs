//! Admission control for the chip's auth session slots.
//!
//! TPM 1.2 chips support only a handful of concurrently open authorization
//! sessions. Requests for new sessions exceeding that budget park the
//! calling worker thread in a bounded FIFO until some other thread releases
//! a session, with the restriction that at least one worker must always
//! remain runnable.

use crate::config::ResourceManagerConfig;
use crate::interface::{AuthSessionGrant, AuthSessionRequest, TcsAuthHandle, TcsContextHandle, TcsErr};
use crate::sync_types::{self, Lock as _};
use crate::tpm::{Tpm, TpmChannel};
use std::sync::atomic;
use std::{collections, num, sync, thread};
use tracing::{debug, error, warn};

/// Maximum number of auth sessions a single context may hold at a time.
pub const MAX_SESSIONS_PER_CONTEXT: usize = 2;

#[derive(Clone, Copy, Debug)]
struct AuthMapping {
    context: TcsContextHandle,
    auth_handle: TcsAuthHandle,
}

/// A worker thread parked in [`AuthManager::acquire()`].
struct AuthWaiter {
    waiter_id: num::NonZeroU64,
    thread: thread::Thread,
    woken: sync::Arc<atomic::AtomicBool>,
}

impl AuthWaiter {
    fn wake(self) {
        self.woken.store(true, atomic::Ordering::Release);
        self.thread.unpark();
    }
}

struct AuthManagerState {
    max_auth_sessions: u16,
    open_auth_sessions: u16,
    mappings: Vec<Option<AuthMapping>>,

    /// The parked waiters, oldest first. Its length is the number of
    /// sleeping worker threads.
    waiters: collections::VecDeque<AuthWaiter>,
    last_waiter_id: u64,

    shut_down: bool,
}

impl AuthManagerState {
    fn context_sessions(&self, context: TcsContextHandle) -> usize {
        self.mappings
            .iter()
            .filter(|m| matches!(m, Some(m) if m.context == context))
            .count()
    }

    fn free_sessions(&self) -> u16 {
        self.max_auth_sessions - self.open_auth_sessions
    }

    /// A context's second session needs one free slot, its first one needs
    /// two.
    fn admits(&self, context: TcsContextHandle) -> bool {
        match self.context_sessions(context) {
            0 => self.free_sessions() >= 2,
            n if n < MAX_SESSIONS_PER_CONTEXT => self.free_sessions() >= 1,
            _ => false,
        }
    }

    fn add(&mut self, context: TcsContextHandle, auth_handle: TcsAuthHandle) -> Result<(), TcsErr> {
        let slot = match self.mappings.iter_mut().find(|m| m.is_none()) {
            Some(slot) => slot,
            None => {
                error!("auth session table is full");
                return Err(tcs_err_internal!());
            }
        };
        *slot = Some(AuthMapping {
            context,
            auth_handle,
        });
        self.open_auth_sessions += 1;
        debug!(context, auth_handle, "added auth session");
        Ok(())
    }

    fn enqueue_waiter(
        &mut self,
        num_workers: usize,
        overflow_auths: usize,
        retry: bool,
    ) -> Result<sync::Arc<atomic::AtomicBool>, TcsErr> {
        // Never let the last runnable worker go to sleep, there would be
        // nobody left to wake the others.
        if self.waiters.len() >= num_workers - 1 {
            error!("auth session admission failing: too many threads already waiting");
            return Err(tcs_err_rc!(RESOURCES));
        }
        if self.waiters.len() >= overflow_auths {
            error!(
                "auth session wait queue is full, {} threads are waiting",
                self.waiters.len()
            );
            return Err(tcs_err_rc!(INTERNAL_ERROR));
        }

        self.last_waiter_id += 1;
        let waiter_id = num::NonZeroU64::new(self.last_waiter_id).ok_or(tcs_err_internal!())?;
        let woken = sync::Arc::new(atomic::AtomicBool::new(false));
        let waiter = AuthWaiter {
            waiter_id,
            thread: thread::current(),
            woken: woken.clone(),
        };
        // A waiter which lost the race for the slot it got woken for keeps
        // its seniority.
        if retry {
            self.waiters.push_front(waiter);
        } else {
            self.waiters.push_back(waiter);
        }
        Ok(woken)
    }

    fn wake_next(&mut self) {
        match self.waiters.pop_front() {
            Some(waiter) => {
                debug!(waiter_id = waiter.waiter_id.get(), "auth session slot opened, waking waiter");
                waiter.wake();
            }
            None => debug!("no auth session waiters to signal"),
        }
    }
}

/// The auth session table and its wait queue.
pub struct AuthManager<ST: sync_types::SyncTypes> {
    state: ST::Lock<AuthManagerState>,
    num_workers: usize,
    overflow_auths: usize,
    auth_ctx_swap: bool,
}

impl<ST: sync_types::SyncTypes> AuthManager<ST> {
    pub fn new(config: &ResourceManagerConfig, max_auth_sessions: u16) -> Result<Self, TcsErr> {
        config.check_params()?;
        if max_auth_sessions == 0 {
            return Err(tcs_err_rc!(BAD_PARAMETER));
        }

        let mut mappings = Vec::new();
        mappings
            .try_reserve_exact(max_auth_sessions as usize)
            .map_err(|_| tcs_err_rc!(OUTOFMEMORY))?;
        mappings.resize(max_auth_sessions as usize, None);
        let mut waiters = collections::VecDeque::new();
        waiters
            .try_reserve_exact(config.overflow_auths)
            .map_err(|_| tcs_err_rc!(OUTOFMEMORY))?;

        Ok(Self {
            state: ST::Lock::from(AuthManagerState {
                max_auth_sessions,
                open_auth_sessions: 0,
                mappings,
                waiters,
                last_waiter_id: 0,
                shut_down: false,
            }),
            num_workers: config.num_workers,
            overflow_auths: config.overflow_auths,
            auth_ctx_swap: config.auth_ctx_swap,
        })
    }

    pub fn max_auth_sessions(&self) -> u16 {
        self.state.lock().max_auth_sessions
    }

    pub fn open_sessions(&self) -> u16 {
        self.state.lock().open_auth_sessions
    }

    /// Number of worker threads currently parked waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Open a new auth session on behalf of `context`, waiting for a free
    /// slot if needed.
    ///
    /// # Errors:
    ///
    /// * [`TcsRc::RESOURCES`](crate::interface::TcsRc::RESOURCES) - Waiting
    ///   would have left no runnable worker thread.
    /// * [`TcsRc::INTERNAL_ERROR`](crate::interface::TcsRc::INTERNAL_ERROR) -
    ///   The wait queue is full, or session context swapping has been
    ///   configured.
    /// * [`TcsRc::FAIL`](crate::interface::TcsRc::FAIL) - The manager has
    ///   been [shut down](Self::shutdown).
    pub fn acquire<C: TpmChannel>(
        &self,
        tpm: &Tpm<ST, C>,
        context: TcsContextHandle,
        request: &AuthSessionRequest,
    ) -> Result<AuthSessionGrant, TcsErr> {
        let mut state = self.state.lock();
        let mut retry = false;
        loop {
            if state.shut_down {
                return Err(tcs_err_rc!(FAIL));
            }
            if state.admits(context) {
                break;
            }
            if self.auth_ctx_swap {
                error!("auth session context swapping requested, but not supported");
                return Err(tcs_err_rc!(INTERNAL_ERROR));
            }

            let woken = state.enqueue_waiter(self.num_workers, self.overflow_auths, retry)?;
            debug!(context, "going to sleep until an auth session slot opens");
            drop(state);
            while !woken.load(atomic::Ordering::Acquire) {
                thread::park();
            }
            state = self.state.lock();
            retry = true;
        }

        let grant = tpm.start_auth_session(request)?;
        if let Err(e) = state.add(context, grant.auth_handle) {
            if let Err(e) = tpm.terminate_handle(grant.auth_handle) {
                warn!("failed to terminate untracked auth session: {}", e);
            }
            return Err(e);
        }
        Ok(grant)
    }

    fn release_slot<C: TpmChannel>(
        &self,
        state: &mut AuthManagerState,
        tpm: &Tpm<ST, C>,
        index: usize,
    ) {
        let mapping = match state.mappings[index].take() {
            Some(mapping) => mapping,
            None => return,
        };
        state.open_auth_sessions -= 1;

        match tpm.terminate_handle(mapping.auth_handle) {
            Ok(()) => (),
            Err(e) if e.is_rc(tcs_rc!(INVALID_AUTHHANDLE)) => {
                error!(
                    "tried to close an invalid auth handle {:#x}",
                    mapping.auth_handle
                );
            }
            Err(e) => error!("TerminateHandle failed: {}", e),
        }
        debug!(
            context = mapping.context,
            auth_handle = mapping.auth_handle,
            "released auth session"
        );

        if self.auth_ctx_swap {
            error!("auth session context swapping requested, but not supported");
        } else {
            state.wake_next();
        }
    }

    /// Close the session `auth_handle` on the chip and hand its slot to the
    /// oldest waiter. Unknown handles are ignored.
    pub fn release<C: TpmChannel>(&self, tpm: &Tpm<ST, C>, auth_handle: TcsAuthHandle) {
        let mut state = self.state.lock();
        let index = state
            .mappings
            .iter()
            .position(|m| matches!(m, Some(m) if m.auth_handle == auth_handle));
        match index {
            Some(index) => self.release_slot(&mut *state, tpm, index),
            None => debug!(auth_handle, "no auth session to release"),
        }
    }

    /// Release every session owned by `context`, signalling one waiter per
    /// released session. Returns the number of sessions released.
    pub fn close_context<C: TpmChannel>(&self, tpm: &Tpm<ST, C>, context: TcsContextHandle) -> usize {
        let mut state = self.state.lock();
        let mut released = 0;
        for index in 0..state.mappings.len() {
            if matches!(state.mappings[index], Some(m) if m.context == context) {
                self.release_slot(&mut *state, tpm, index);
                released += 1;
            }
        }
        released
    }

    pub fn session_belongs_to(&self, context: TcsContextHandle, auth_handle: TcsAuthHandle) -> bool {
        self.state.lock().mappings.iter().any(
            |m| matches!(m, Some(m) if m.context == context && m.auth_handle == auth_handle),
        )
    }

    /// Verify that `auth_handle` had been issued to `context`.
    pub fn check(&self, context: TcsContextHandle, auth_handle: TcsAuthHandle) -> Result<(), TcsErr> {
        if self.session_belongs_to(context, auth_handle) {
            Ok(())
        } else {
            error!(context, auth_handle, "no such auth session for context");
            Err(tcs_err_rc!(INTERNAL_ERROR))
        }
    }

    /// Wrap a client supplied session into a guard releasing it when
    /// dropped.
    pub fn release_on_drop<'a, C: TpmChannel>(
        &'a self,
        tpm: &'a Tpm<ST, C>,
        auth_handle: TcsAuthHandle,
    ) -> AuthSessionGuard<'a, ST, C> {
        AuthSessionGuard {
            auth_mgr: self,
            tpm,
            auth_handle,
        }
    }

    /// Wake all waiters for teardown. They, as well as any subsequent
    /// [`acquire()`](Self::acquire), fail.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        while let Some(waiter) = state.waiters.pop_front() {
            waiter.wake();
        }
    }
}

/// Releases an auth session when going out of scope.
pub struct AuthSessionGuard<'a, ST: sync_types::SyncTypes, C: TpmChannel> {
    auth_mgr: &'a AuthManager<ST>,
    tpm: &'a Tpm<ST, C>,
    auth_handle: TcsAuthHandle,
}

impl<'a, ST: sync_types::SyncTypes, C: TpmChannel> Drop for AuthSessionGuard<'a, ST, C> {
    fn drop(&mut self) {
        self.auth_mgr.release(self.tpm, self.auth_handle);
    }
}

#[cfg(test)]
fn test_auth_mgr(
    max_auth_sessions: u16,
    num_workers: usize,
    overflow_auths: usize,
) -> (
    AuthManager<sync_types::ParkingLotSyncTypes>,
    Tpm<sync_types::ParkingLotSyncTypes, crate::test::tpm::TestTpm>,
) {
    crate::test::init_logging();
    let config = ResourceManagerConfig {
        num_workers,
        overflow_auths,
        ..Default::default()
    };
    let tpm = Tpm::new(crate::test::tpm::TestTpm::new(16, max_auth_sessions));
    (AuthManager::new(&config, max_auth_sessions).unwrap(), tpm)
}

#[cfg(test)]
fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "timed out");
        thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[cfg(test)]
fn assert_table_consistent<ST: sync_types::SyncTypes>(auth_mgr: &AuthManager<ST>) {
    let state = auth_mgr.state.lock();
    let occupied = state.mappings.iter().filter(|m| m.is_some()).count();
    assert_eq!(occupied, state.open_auth_sessions as usize);
    assert!(state.open_auth_sessions <= state.max_auth_sessions);
}

#[test]
fn test_admission_rule() {
    // A single worker never waits, denials surface right away.
    let (auth_mgr, tpm) = test_auth_mgr(4, 1, 16);
    let oiap = AuthSessionRequest::Oiap;

    // First sessions need two free slots.
    let a1 = auth_mgr.acquire(&tpm, 1, &oiap).unwrap();
    auth_mgr.acquire(&tpm, 2, &oiap).unwrap();
    auth_mgr.acquire(&tpm, 3, &oiap).unwrap();
    assert_eq!(auth_mgr.open_sessions(), 3);
    assert_eq!(auth_mgr.acquire(&tpm, 4, &oiap), Err(tcs_err_rc!(RESOURCES)));

    // A context's second session may take the last free slot.
    let a2 = auth_mgr.acquire(&tpm, 1, &oiap).unwrap();
    assert_eq!(auth_mgr.open_sessions(), 4);
    assert_table_consistent(&auth_mgr);

    auth_mgr.release(&tpm, a2.auth_handle);
    assert_eq!(auth_mgr.open_sessions(), 3);
    assert_eq!(tpm.channel().open_auth_sessions(), 3);
    // Releasing twice is harmless.
    auth_mgr.release(&tpm, a2.auth_handle);
    assert_eq!(auth_mgr.open_sessions(), 3);

    assert!(auth_mgr.session_belongs_to(1, a1.auth_handle));
    assert!(!auth_mgr.session_belongs_to(2, a1.auth_handle));
    assert_eq!(auth_mgr.check(2, a1.auth_handle), Err(tcs_err_rc!(INTERNAL_ERROR)));
    assert_table_consistent(&auth_mgr);
}

#[test]
fn test_per_context_cap() {
    let (auth_mgr, tpm) = test_auth_mgr(8, 1, 16);
    let oiap = AuthSessionRequest::Oiap;
    auth_mgr.acquire(&tpm, 7, &oiap).unwrap();
    let osap = AuthSessionRequest::Osap {
        entity_type: 0x0001,
        entity_value: 0x4000_0000,
        nonce_odd_osap: [0x11; 20],
    };
    let grant = auth_mgr.acquire(&tpm, 7, &osap).unwrap();
    assert!(grant.nonce_even_osap.is_some());
    // A single worker can never wait.
    assert_eq!(auth_mgr.acquire(&tpm, 7, &oiap), Err(tcs_err_rc!(RESOURCES)));
    assert_eq!(auth_mgr.open_sessions(), 2);
    assert_eq!(tpm.channel().open_auth_sessions(), 2);
}

#[test]
fn test_release_wakes_waiters_in_fifo_order() {
    // With five table entries, four fresh contexts get admitted, the rest
    // need to wait.
    let (auth_mgr, tpm) = test_auth_mgr(5, 10, 3);
    let oiap = AuthSessionRequest::Oiap;
    let grants: Vec<_> = (1..=4)
        .map(|ctx| auth_mgr.acquire(&tpm, ctx, &oiap).unwrap())
        .collect();

    let (tx, rx) = sync::mpsc::channel();
    thread::scope(|s| {
        let (auth_mgr, tpm) = (&auth_mgr, &tpm);
        for ctx in [5, 6] {
            let tx = tx.clone();
            s.spawn(move || {
                let grant = auth_mgr.acquire(tpm, ctx, &AuthSessionRequest::Oiap).unwrap();
                tx.send((ctx, grant.auth_handle)).unwrap();
            });
            wait_until(|| auth_mgr.waiting() == (ctx - 4) as usize);
        }
        assert!(rx.try_recv().is_err());

        auth_mgr.release(tpm, grants[2].auth_handle);
        let (ctx, _) = rx.recv().unwrap();
        assert_eq!(ctx, 5);
        assert_eq!(auth_mgr.waiting(), 1);
        assert!(rx.try_recv().is_err());

        auth_mgr.release(tpm, grants[0].auth_handle);
        let (ctx, _) = rx.recv().unwrap();
        assert_eq!(ctx, 6);
        assert_eq!(auth_mgr.waiting(), 0);
    });
    assert_eq!(auth_mgr.open_sessions(), 4);
    assert_table_consistent(&auth_mgr);
}

#[test]
fn test_last_worker_never_sleeps() {
    let (auth_mgr, tpm) = test_auth_mgr(5, 5, 16);
    let oiap = AuthSessionRequest::Oiap;
    let grants: Vec<_> = (1..=4)
        .map(|ctx| auth_mgr.acquire(&tpm, ctx, &oiap).unwrap())
        .collect();

    thread::scope(|s| {
        let (auth_mgr, tpm) = (&auth_mgr, &tpm);
        let waiters: Vec<_> = (10..14)
            .map(|ctx| s.spawn(move || auth_mgr.acquire(tpm, ctx, &AuthSessionRequest::Oiap)))
            .collect();
        wait_until(|| auth_mgr.waiting() == 4);

        assert_eq!(
            auth_mgr.acquire(tpm, 20, &AuthSessionRequest::Oiap),
            Err(tcs_err_rc!(RESOURCES))
        );

        for grant in grants.iter() {
            auth_mgr.release(tpm, grant.auth_handle);
        }
        for waiter in waiters {
            assert!(waiter.join().unwrap().is_ok());
        }
    });
    assert_table_consistent(&auth_mgr);
}

#[test]
fn test_full_wait_queue() {
    let (auth_mgr, tpm) = test_auth_mgr(2, 10, 1);
    auth_mgr.acquire(&tpm, 1, &AuthSessionRequest::Oiap).unwrap();

    thread::scope(|s| {
        let (auth_mgr, tpm) = (&auth_mgr, &tpm);
        let waiter = s.spawn(move || auth_mgr.acquire(tpm, 2, &AuthSessionRequest::Oiap));
        wait_until(|| auth_mgr.waiting() == 1);
        assert_eq!(
            auth_mgr.acquire(tpm, 3, &AuthSessionRequest::Oiap),
            Err(tcs_err_rc!(INTERNAL_ERROR))
        );
        auth_mgr.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(tcs_err_rc!(FAIL)));
    });
    assert_eq!(
        auth_mgr.acquire(&tpm, 1, &AuthSessionRequest::Oiap),
        Err(tcs_err_rc!(FAIL))
    );
}

#[test]
fn test_close_context_wakes_one_waiter_per_session() {
    let (auth_mgr, tpm) = test_auth_mgr(5, 10, 8);
    let oiap = AuthSessionRequest::Oiap;
    auth_mgr.acquire(&tpm, 1, &oiap).unwrap();
    auth_mgr.acquire(&tpm, 1, &oiap).unwrap();
    auth_mgr.acquire(&tpm, 2, &oiap).unwrap();
    auth_mgr.acquire(&tpm, 2, &oiap).unwrap();
    assert_eq!(auth_mgr.open_sessions(), 4);

    let (tx, rx) = sync::mpsc::channel();
    thread::scope(|s| {
        let (auth_mgr, tpm) = (&auth_mgr, &tpm);
        for (i, ctx) in [10, 11, 12].into_iter().enumerate() {
            let tx = tx.clone();
            s.spawn(move || {
                let res = auth_mgr.acquire(tpm, ctx, &AuthSessionRequest::Oiap);
                tx.send((ctx, res)).unwrap();
            });
            wait_until(|| auth_mgr.waiting() == i + 1);
        }

        // Closing the context frees two slots and signals exactly two
        // waiters, the third one stays queued.
        assert_eq!(auth_mgr.close_context(tpm, 1), 2);
        let mut woken: Vec<_> = (0..2).map(|_| rx.recv().unwrap()).collect();
        woken.sort_by_key(|(ctx, _)| *ctx);
        assert_eq!(woken[0].0, 10);
        assert_eq!(woken[1].0, 11);
        assert!(woken.iter().all(|(_, res)| res.is_ok()));
        assert_eq!(auth_mgr.waiting(), 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(auth_mgr.close_context(tpm, 2), 2);
        let (ctx, res) = rx.recv().unwrap();
        assert_eq!(ctx, 12);
        assert!(res.is_ok());
    });
    assert_eq!(auth_mgr.waiting(), 0);
    assert_table_consistent(&auth_mgr);
}

#[test]
fn test_auth_ctx_swap_is_unsupported() {
    let config = ResourceManagerConfig {
        auth_ctx_swap: true,
        ..Default::default()
    };
    let tpm = Tpm::<sync_types::ParkingLotSyncTypes, _>::new(crate::test::tpm::TestTpm::new(4, 2));
    let auth_mgr = AuthManager::<sync_types::ParkingLotSyncTypes>::new(&config, 2).unwrap();
    auth_mgr.acquire(&tpm, 1, &AuthSessionRequest::Oiap).unwrap();
    assert_eq!(
        auth_mgr.acquire(&tpm, 2, &AuthSessionRequest::Oiap),
        Err(tcs_err_rc!(INTERNAL_ERROR))
    );
}
