//! Lock abstractions the resource manager's shared tables are generic over.

use core::ops::{Deref, DerefMut};

pub trait Lock<T>: From<T> {
    type Guard<'a>: Deref<Target = T> + DerefMut
    where
        Self: 'a;

    fn lock(&self) -> Self::Guard<'_>;
}

pub trait RwLock<T>: From<T> {
    type ReadGuard<'a>: Deref<Target = T>
    where
        Self: 'a;
    type WriteGuard<'a>: Deref<Target = T> + DerefMut
    where
        Self: 'a;

    fn read(&self) -> Self::ReadGuard<'_>;
    fn write(&self) -> Self::WriteGuard<'_>;
}

pub trait SyncTypes: Send + Sync + 'static {
    type Lock<T: Send>: Lock<T> + Send + Sync;
    type RwLock<T: Send + Sync>: RwLock<T> + Send + Sync;
}

/// [`SyncTypes`] backed by [`parking_lot`]'s blocking primitives, for use
/// from the worker thread pool.
pub struct ParkingLotSyncTypes {}

impl SyncTypes for ParkingLotSyncTypes {
    type Lock<T: Send> = ParkingLotLock<T>;
    type RwLock<T: Send + Sync> = ParkingLotRwLock<T>;
}

pub struct ParkingLotLock<T> {
    inner: parking_lot::Mutex<T>,
}

impl<T> From<T> for ParkingLotLock<T> {
    fn from(value: T) -> Self {
        Self {
            inner: parking_lot::Mutex::new(value),
        }
    }
}

impl<T> Lock<T> for ParkingLotLock<T> {
    type Guard<'a> = parking_lot::MutexGuard<'a, T> where Self: 'a;

    fn lock(&self) -> Self::Guard<'_> {
        self.inner.lock()
    }
}

pub struct ParkingLotRwLock<T> {
    inner: parking_lot::RwLock<T>,
}

impl<T> From<T> for ParkingLotRwLock<T> {
    fn from(value: T) -> Self {
        Self {
            inner: parking_lot::RwLock::new(value),
        }
    }
}

impl<T> RwLock<T> for ParkingLotRwLock<T> {
    type ReadGuard<'a> = parking_lot::RwLockReadGuard<'a, T> where Self: 'a;
    type WriteGuard<'a> = parking_lot::RwLockWriteGuard<'a, T> where Self: 'a;

    fn read(&self) -> Self::ReadGuard<'_> {
        self.inner.read()
    }

    fn write(&self) -> Self::WriteGuard<'_> {
        self.inner.write()
    }
}
