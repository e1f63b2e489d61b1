//! Single-user enforcement for a shared connection handle.
//!
//! A connection serves one caller at a time. Handles are cheap to clone
//! (leases cloned via `with_tx_options` share one), but actually using
//! the connection requires taking the borrow gate; a second concurrent
//! taker gets an `InterfaceError` instead of waiting.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::errors::{Error, Result};
use crate::reconnect::ReconnConn;

/// Why the connection is currently borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowReason {
    Query,
    Transaction,
}

/// Clonable handle to one underlying connection.
#[derive(Clone)]
pub struct ConnHandle {
    conn: Arc<AsyncMutex<ReconnConn>>,
    reason: Arc<parking_lot::Mutex<Option<BorrowReason>>>,
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("reason", &self.reason.lock())
            .finish()
    }
}

impl ConnHandle {
    pub fn new(conn: ReconnConn) -> Self {
        Self {
            conn: Arc::new(AsyncMutex::new(conn)),
            reason: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Take the borrow gate. Fails immediately when the connection is in
    /// use; callers never queue behind each other.
    pub fn try_borrow(&self, reason: BorrowReason) -> Result<BorrowGuard> {
        match Arc::clone(&self.conn).try_lock_owned() {
            Ok(guard) => {
                *self.reason.lock() = Some(reason);
                Ok(BorrowGuard {
                    guard,
                    reason_slot: Arc::clone(&self.reason),
                })
            }
            Err(_) => {
                let msg = match *self.reason.lock() {
                    Some(BorrowReason::Transaction) => {
                        "connection is already in use by a transaction"
                    }
                    _ => "connection is already in use",
                };
                Err(Error::interface(msg))
            }
        }
    }

    /// Consume the handle, returning the connection if this is the last
    /// clone and it is not borrowed.
    pub fn try_unwrap(self) -> Option<ReconnConn> {
        Arc::try_unwrap(self.conn)
            .ok()
            .map(|mutex| mutex.into_inner())
    }
}

/// Exclusive access to the connection for the duration of one borrow.
#[derive(Debug)]
pub struct BorrowGuard {
    guard: OwnedMutexGuard<ReconnConn>,
    reason_slot: Arc<parking_lot::Mutex<Option<BorrowReason>>>,
}

impl Deref for BorrowGuard {
    type Target = ReconnConn;

    fn deref(&self) -> &ReconnConn {
        &self.guard
    }
}

impl DerefMut for BorrowGuard {
    fn deref_mut(&mut self) -> &mut ReconnConn {
        &mut self.guard
    }
}

impl Drop for BorrowGuard {
    fn drop(&mut self) {
        *self.reason_slot.lock() = None;
    }
}
