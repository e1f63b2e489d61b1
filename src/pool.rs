//! Connection pool.
//!
//! A bounded set of lazily-created connections. The semaphore carries the
//! max_conns bound and hands permits to waiters strictly FIFO; the idle
//! stack is LIFO so a fresh acquire lands on the connection with the
//! warmest caches. A background reaper discards idle connections past
//! `idle_timeout` (down to `min_conns`) and keeps the slot floor topped
//! up. Leases are released explicitly; releasing twice is an
//! `InterfaceError`, and a sibling lease produced by `with_tx_options`
//! shares the same release accounting.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::borrow::{BorrowReason, ConnHandle};
use crate::client::ops;
use crate::codec::CodecContext;
use crate::config::ConnConfig;
use crate::connection::ConnState;
use crate::errors::{Error, Result};
use crate::protocol::Capabilities;
use crate::reconnect::ReconnConn;
use crate::shape::Shape;
use crate::transaction::{self, RetryOptions, Tx, TxOptions};
use crate::value::Value;

/// Callback invoked on lease lifecycle events.
pub type PoolHook = Arc<dyn Fn() + Send + Sync>;

/// Grace period close() waits for outstanding leases.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Default)]
pub struct PoolConfig {
    pub min_conns: Option<u32>,
    pub max_conns: Option<u32>,
    pub idle_timeout: Option<Duration>,
    /// Bound on waiting for a free slot; `None` waits until cancelled.
    pub wait_timeout: Option<Duration>,
    pub on_acquire: Option<PoolHook>,
    pub on_release: Option<PoolHook>,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_conns", &self.min_conns)
            .field("max_conns", &self.max_conns)
            .field("idle_timeout", &self.idle_timeout)
            .field("wait_timeout", &self.wait_timeout)
            .field("on_acquire", &self.on_acquire.is_some())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

fn default_max_conns() -> u32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    cpus.max(4)
}

#[derive(Debug)]
struct IdleSlot {
    handle: ConnHandle,
    last_used: Instant,
    generation: u64,
}

struct PoolInner {
    conn_config: ConnConfig,
    codec_ctx: CodecContext,
    min_conns: u32,
    max_conns: u32,
    idle_timeout: Duration,
    wait_timeout: Option<Duration>,
    on_acquire: Option<PoolHook>,
    on_release: Option<PoolHook>,
    semaphore: Arc<Semaphore>,
    idle: parking_lot::Mutex<Vec<IdleSlot>>,
    closed: AtomicBool,
    outstanding: AtomicU32,
    generation: AtomicU64,
    drained: Notify,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("min_conns", &self.min_conns)
            .field("max_conns", &self.max_conns)
            .field("idle_timeout", &self.idle_timeout)
            .field("wait_timeout", &self.wait_timeout)
            .field("closed", &self.closed)
            .field("outstanding", &self.outstanding)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PoolInner {
    fn new_slot(self: &Arc<Self>) -> IdleSlot {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(generation, "opening pool slot");
        IdleSlot {
            handle: ConnHandle::new(ReconnConn::new(
                self.conn_config.clone(),
                self.codec_ctx.clone(),
            )),
            last_used: Instant::now(),
            generation,
        }
    }

    /// Take the freshest healthy idle slot, discarding stale ones.
    fn pop_idle(self: &Arc<Self>) -> Option<IdleSlot> {
        let mut idle = self.idle.lock();
        while let Some(slot) = idle.pop() {
            if slot.last_used.elapsed() > self.idle_timeout {
                debug!(generation = slot.generation, "discarding stale idle connection");
                continue;
            }
            return Some(slot);
        }
        None
    }

    fn requeue(self: &Arc<Self>, mut slot: IdleSlot) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        slot.last_used = Instant::now();
        self.idle.lock().push(slot);
    }

    fn lease_finished(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

/// A concurrent-safe connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
    tx_options: TxOptions,
    retry_options: RetryOptions,
    _reaper: Arc<ReaperHandle>,
}

struct ReaperHandle(tokio::task::JoinHandle<()>);

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Pool {
    /// Create a pool. No connection is dialed until first use.
    pub fn new(conn_config: ConnConfig, pool_config: PoolConfig) -> Pool {
        Pool::with_codecs(conn_config, pool_config, CodecContext::default())
    }

    /// Create a pool with a codec context (decimal marshaller etc.).
    pub fn with_codecs(
        conn_config: ConnConfig,
        pool_config: PoolConfig,
        codec_ctx: CodecContext,
    ) -> Pool {
        let max_conns = pool_config.max_conns.unwrap_or_else(default_max_conns).max(1);
        let min_conns = pool_config.min_conns.unwrap_or(0).min(max_conns);
        let idle_timeout = pool_config.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);

        let inner = Arc::new(PoolInner {
            conn_config,
            codec_ctx,
            min_conns,
            max_conns,
            idle_timeout,
            wait_timeout: pool_config.wait_timeout,
            on_acquire: pool_config.on_acquire,
            on_release: pool_config.on_release,
            semaphore: Arc::new(Semaphore::new(max_conns as usize)),
            idle: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            outstanding: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            drained: Notify::new(),
        });

        // keep the slot floor before the first acquire
        {
            let mut idle = inner.idle.lock();
            for _ in 0..min_conns {
                let slot = inner.new_slot();
                idle.push(slot);
            }
        }

        let reaper = tokio::spawn(reaper_loop(Arc::downgrade(&inner)));
        Pool {
            inner,
            tx_options: TxOptions::default(),
            retry_options: RetryOptions::default(),
            _reaper: Arc::new(ReaperHandle(reaper)),
        }
    }

    /// Pool-wide transaction options for `raw_tx`/`retrying_tx`.
    pub fn with_tx_options(mut self, options: TxOptions) -> Pool {
        self.tx_options = options;
        self
    }

    pub fn with_retry_options(mut self, options: RetryOptions) -> Pool {
        self.retry_options = options;
        self
    }

    /// Borrow a connection. FIFO over waiters; LIFO over idle slots.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Lease> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::interface("pool closed"));
        }

        let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::client_connection("acquire cancelled"));
            }
            permit = async {
                match self.inner.wait_timeout {
                    Some(limit) => tokio::time::timeout(limit, acquire)
                        .await
                        .map_err(|_| Error::client_connection(
                            "timed out waiting for a pool connection",
                        ))?
                        .map_err(|_| Error::interface("pool closed")),
                    None => acquire.await.map_err(|_| Error::interface("pool closed")),
                }
            } => permit?,
        };

        // the pool may have closed while we waited
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::interface("pool closed"));
        }

        let slot = self
            .inner
            .pop_idle()
            .unwrap_or_else(|| self.inner.new_slot());
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);

        if let Some(hook) = &self.inner.on_acquire {
            hook();
        }

        Ok(Lease {
            shared: Arc::new(LeaseShared {
                pool: Arc::clone(&self.inner),
                state: parking_lot::Mutex::new(LeaseState::Active {
                    slot,
                    _permit: permit,
                }),
            }),
            tx_options: self.tx_options,
            retry_options: self.retry_options.clone(),
        })
    }

    /// Stop accepting acquires, wait (bounded) for leases to come back,
    /// then tear down all idle connections.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();

        let grace = self.inner.wait_timeout.unwrap_or(SHUTDOWN_GRACE);
        let deadline = Instant::now() + grace;
        loop {
            // register for the wakeup before re-checking the count
            let drained = self.inner.drained.notified();
            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    outstanding = self.inner.outstanding.load(Ordering::SeqCst),
                    "pool closed with leases still outstanding"
                );
                break;
            }
            let _ = tokio::time::timeout(remaining, drained).await;
        }

        let drained: Vec<IdleSlot> = std::mem::take(&mut *self.inner.idle.lock());
        let cancel = CancellationToken::new();
        for slot in drained {
            if let Some(mut conn) = slot.handle.try_unwrap() {
                let _ = conn.close(&cancel).await;
            }
        }
        debug!("pool closed");
    }

    /// Current pool occupancy, for monitoring and tests.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().len() as u32,
            in_use: self.inner.outstanding.load(Ordering::SeqCst),
            max_conns: self.inner.max_conns,
            min_conns: self.inner.min_conns,
        }
    }

    // ------------------------------------------------------------------
    // Convenience: acquire, run, release
    // ------------------------------------------------------------------

    pub async fn execute(&self, cancel: &CancellationToken, query: &str) -> Result<()> {
        let lease = self.acquire(cancel).await?;
        let result = lease.execute(cancel, query).await;
        lease.release().await?;
        result
    }

    pub async fn query(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<Vec<Value>> {
        let lease = self.acquire(cancel).await?;
        let result = lease.query(cancel, query, args).await;
        lease.release().await?;
        result
    }

    pub async fn query_single(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<Value> {
        let lease = self.acquire(cancel).await?;
        let result = lease.query_single(cancel, query, args).await;
        lease.release().await?;
        result
    }

    pub async fn query_json(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<String> {
        let lease = self.acquire(cancel).await?;
        let result = lease.query_json(cancel, query, args).await;
        lease.release().await?;
        result
    }

    pub async fn query_single_json(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<String> {
        let lease = self.acquire(cancel).await?;
        let result = lease.query_single_json(cancel, query, args).await;
        lease.release().await?;
        result
    }

    /// Run `body` in a transaction on a pooled connection; commit on
    /// success, roll back on error, no retries.
    pub async fn raw_tx<T, B, F>(&self, cancel: &CancellationToken, body: B) -> Result<T>
    where
        B: FnMut(Tx) -> F,
        F: Future<Output = Result<T>>,
    {
        let lease = self.acquire(cancel).await?;
        let result = lease.raw_tx(cancel, body).await;
        lease.release().await?;
        result
    }

    /// Run `body` in a retrying transaction on a pooled connection.
    pub async fn retrying_tx<T, B, F>(&self, cancel: &CancellationToken, body: B) -> Result<T>
    where
        B: FnMut(Tx) -> F,
        F: Future<Output = Result<T>>,
    {
        let lease = self.acquire(cancel).await?;
        let result = lease.retrying_tx(cancel, body).await;
        lease.release().await?;
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: u32,
    pub in_use: u32,
    pub max_conns: u32,
    pub min_conns: u32,
}

async fn reaper_loop(inner: std::sync::Weak<PoolInner>) {
    loop {
        let period = match inner.upgrade() {
            Some(pool) => (pool.idle_timeout / 2).max(Duration::from_secs(1)),
            None => return,
        };
        tokio::time::sleep(period).await;

        let Some(pool) = inner.upgrade() else { return };
        if pool.closed.load(Ordering::SeqCst) {
            return;
        }

        let outstanding = pool.outstanding.load(Ordering::SeqCst);
        let mut idle = pool.idle.lock();

        // evict stale idle connections down to the floor
        let mut kept = Vec::with_capacity(idle.len());
        for slot in idle.drain(..) {
            let total = kept.len() as u32 + outstanding;
            if slot.last_used.elapsed() > pool.idle_timeout && total > pool.min_conns {
                debug!(generation = slot.generation, "reaping idle connection");
            } else {
                kept.push(slot);
            }
        }
        *idle = kept;

        // keep the floor
        while (idle.len() as u32 + outstanding) < pool.min_conns {
            let slot = pool.new_slot();
            idle.insert(0, slot);
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

#[derive(Debug)]
enum LeaseState {
    Active {
        slot: IdleSlot,
        _permit: OwnedSemaphorePermit,
    },
    Released,
}

#[derive(Debug)]
struct LeaseShared {
    pool: Arc<PoolInner>,
    state: parking_lot::Mutex<LeaseState>,
}

impl LeaseShared {
    fn handle(&self) -> Result<ConnHandle> {
        match &*self.state.lock() {
            LeaseState::Active { slot, .. } => Ok(slot.handle.clone()),
            LeaseState::Released => Err(Error::interface("cannot use a released connection")),
        }
    }
}

impl Drop for LeaseShared {
    fn drop(&mut self) {
        // last clone dropped without an explicit release
        let state = std::mem::replace(&mut *self.state.lock(), LeaseState::Released);
        if let LeaseState::Active { slot, _permit } = state {
            let in_tx = slot
                .handle
                .try_borrow(BorrowReason::Query)
                .map(|guard| guard.state() == ConnState::InTransaction)
                .unwrap_or(true);
            if !in_tx {
                self.pool.requeue(slot);
            }
            // an in-transaction session is dropped with its transport;
            // it must never reach the idle list
            self.pool.lease_finished();
        }
    }
}

/// A borrowed pool connection.
///
/// Queries through a lease carry a capability mask that excludes
/// transaction control; use `raw_tx`/`retrying_tx` for transactions.
#[derive(Debug)]
pub struct Lease {
    shared: Arc<LeaseShared>,
    tx_options: TxOptions,
    retry_options: RetryOptions,
}

impl Lease {
    /// A sibling lease with different transaction options. Both siblings
    /// share one release slot: releasing either marks the lease
    /// released, and the second release errors.
    pub fn with_tx_options(&self, options: TxOptions) -> Lease {
        Lease {
            shared: Arc::clone(&self.shared),
            tx_options: options,
            retry_options: self.retry_options.clone(),
        }
    }

    pub fn with_retry_options(&self, options: RetryOptions) -> Lease {
        Lease {
            shared: Arc::clone(&self.shared),
            tx_options: self.tx_options,
            retry_options: options,
        }
    }

    /// Return the connection to the pool. A lease still in a transaction
    /// (or otherwise not `Ready`) is closed instead of requeued.
    pub async fn release(&self) -> Result<()> {
        let state = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut *state, LeaseState::Released)
        };
        let LeaseState::Active { slot, _permit } = state else {
            return Err(Error::interface("connection released more than once"));
        };

        if let Some(hook) = &self.shared.pool.on_release {
            hook();
        }

        let conn_state = match slot.handle.try_borrow(BorrowReason::Query) {
            Ok(guard) => guard.state(),
            // still borrowed: treat as indeterminate
            Err(_) => ConnState::InTransaction,
        };
        match conn_state {
            ConnState::InTransaction | ConnState::Connecting => {
                debug!(
                    generation = slot.generation,
                    "closing connection released mid-transaction"
                );
                if let Some(mut conn) = slot.handle.try_unwrap() {
                    let cancel = CancellationToken::new();
                    let _ = conn.close(&cancel).await;
                }
            }
            // `Closed` here is a lazy, never-dialed or self-discarded
            // session; the slot itself is still sound
            ConnState::Ready | ConnState::Closed => {
                self.shared.pool.requeue(slot);
            }
        }
        self.shared.pool.lease_finished();
        Ok(())
    }

    fn user_capabilities() -> Capabilities {
        Capabilities::ALL.without(Capabilities::TRANSACTION)
    }

    pub async fn execute(&self, cancel: &CancellationToken, query: &str) -> Result<()> {
        ops::execute(
            &self.shared.handle()?,
            Lease::user_capabilities(),
            cancel,
            query,
        )
        .await
    }

    pub async fn query(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<Vec<Value>> {
        ops::query(
            &self.shared.handle()?,
            Lease::user_capabilities(),
            cancel,
            query,
            args,
            Shape::Dynamic,
        )
        .await
    }

    pub async fn query_shaped(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
        shape: Shape,
    ) -> Result<Vec<Value>> {
        ops::query(
            &self.shared.handle()?,
            Lease::user_capabilities(),
            cancel,
            query,
            args,
            shape,
        )
        .await
    }

    pub async fn query_single(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<Value> {
        ops::query_single(
            &self.shared.handle()?,
            Lease::user_capabilities(),
            cancel,
            query,
            args,
            Shape::Dynamic,
        )
        .await
    }

    pub async fn query_json(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<String> {
        ops::query_json(
            &self.shared.handle()?,
            Lease::user_capabilities(),
            cancel,
            query,
            args,
        )
        .await
    }

    pub async fn query_single_json(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<String> {
        ops::query_single_json(
            &self.shared.handle()?,
            Lease::user_capabilities(),
            cancel,
            query,
            args,
        )
        .await
    }

    pub async fn raw_tx<T, B, F>(&self, cancel: &CancellationToken, body: B) -> Result<T>
    where
        B: FnMut(Tx) -> F,
        F: Future<Output = Result<T>>,
    {
        transaction::raw_tx(&self.shared.handle()?, &self.tx_options, cancel, body).await
    }

    pub async fn retrying_tx<T, B, F>(&self, cancel: &CancellationToken, body: B) -> Result<T>
    where
        B: FnMut(Tx) -> F,
        F: Future<Output = Result<T>>,
    {
        transaction::retrying_tx(
            &self.shared.handle()?,
            &self.tx_options,
            &self.retry_options,
            cancel,
            body,
        )
        .await
    }
}
