//! Synchronization primitives layered on the host's blocking mutex.
//!
//! The only primitive the storage and memory core needs beyond what
//! `std::sync` provides directly is the counting [`Semaphore`], which
//! couples a permit count with the resource it guards. A semaphore created
//! with zero permits doubles as an event: the producer publishes the
//! resource, finishes whatever I/O makes it valid, and then calls
//! [`Semaphore::signal`]; consumers block in [`Semaphore::wait`] until the
//! event has happened. The demand pager uses exactly this shape to hand a
//! page location from an evicting thread to a faulting thread.

use std::ops::Deref;
use std::sync::{Condvar, Mutex};

/// Counting semaphore.
///
/// A semaphore maintains a set of permits and a resource. Permits are used
/// to synchronize access to the resource. Unlike a mutex, a semaphore can
/// admit more than one concurrent holder at a time, and a permit can be
/// released by a thread other than the one that would consume it.
pub struct Semaphore<T> {
    resource: T,
    permits: Mutex<usize>,
    available: Condvar,
}

impl<T> Semaphore<T> {
    /// Creates a new semaphore initialized with a specified number of
    /// permits guarding `resource`.
    pub fn new(permits: usize, resource: T) -> Self {
        Self {
            resource,
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    ///
    /// If no permits are available, this blocks the current thread until
    /// another thread calls [`Semaphore::signal`].
    ///
    /// Returns a [`SemaphorePermits`] RAII guard; dropping the guard
    /// releases the acquired permit.
    pub fn wait(&self) -> SemaphorePermits<'_, T> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
        SemaphorePermits { sema: self }
    }

    /// Releases a permit back to the semaphore.
    ///
    /// Increments the permit count by one and wakes one blocked waiter,
    /// if any. Normally only called directly to signal an event on a
    /// zero-initialized semaphore; otherwise it is invoked by dropping a
    /// [`SemaphorePermits`] guard.
    pub fn signal(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.available.notify_one();
    }

    /// Access the resource without acquiring a permit.
    ///
    /// This is sound only for callers that already hold an acquisition
    /// protocol above the semaphore (e.g. an owner tearing the resource
    /// down after all sharers are gone).
    pub fn get(&self) -> &T {
        &self.resource
    }
}

/// An RAII implementation of a "scoped semaphore". When this structure is
/// dropped (falls out of scope), the semaphore will be signaled.
///
/// The resource protected by the semaphore can be accessed through this
/// guard via its [`Deref`] implementation.
pub struct SemaphorePermits<'a, T> {
    sema: &'a Semaphore<T>,
}

impl<T> Deref for SemaphorePermits<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.sema.resource
    }
}

impl<T> Drop for SemaphorePermits<'_, T> {
    fn drop(&mut self) {
        self.sema.signal()
    }
}
