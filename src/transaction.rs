//! Transactable layer: `raw_tx` and `retrying_tx`.
//!
//! `raw_tx` begins, runs the body, commits on success and rolls back on
//! any error, surfacing it verbatim. `retrying_tx` wraps that loop with
//! per-category retry rules: serialization conflicts, deadlocks and
//! pre-commit connection loss start a new sequential attempt after a
//! backoff sleep. The body must be idempotent from the caller's point of
//! view; no side-effect detection is attempted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::borrow::{BorrowGuard, BorrowReason, ConnHandle};
use crate::connection::QueryRequest;
use crate::errors::{Error, ErrorCode, Result};
use crate::protocol::{Capabilities, Cardinality, IoFormat};
use crate::reconnect::jittered_backoff;
use crate::shape::Shape;
use crate::value::Value;

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "serializable",
            IsolationLevel::RepeatableRead => "repeatable read",
        }
    }
}

/// Options applied to each transaction a handle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub readonly: bool,
    pub deferrable: bool,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    fn start_statement(&self) -> String {
        format!(
            "start transaction isolation {}, {}, {}",
            self.isolation.as_sql(),
            if self.readonly { "read only" } else { "read write" },
            if self.deferrable { "deferrable" } else { "not deferrable" },
        )
    }
}

/// Error categories a retry rule can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCondition {
    /// Serialization failure or deadlock reported by the server.
    TransactionConflict,
    /// Connection loss before the commit outcome became unknowable.
    NetworkError,
}

/// Attempt budget and backoff for one condition.
#[derive(Clone)]
pub struct RetryRule {
    pub attempts: u32,
    pub backoff: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl RetryRule {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: Arc::new(jittered_backoff),
        }
    }

    pub fn with_backoff(
        mut self,
        backoff: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }
}

impl Default for RetryRule {
    fn default() -> Self {
        Self::new(3)
    }
}

impl std::fmt::Debug for RetryRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryRule")
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Per-category retry configuration.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    default_rule: RetryRule,
    overrides: Vec<(RetryCondition, RetryRule)>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, rule: RetryRule) -> Self {
        self.default_rule = rule;
        self
    }

    pub fn with_rule(mut self, condition: RetryCondition, rule: RetryRule) -> Self {
        self.overrides.retain(|(c, _)| *c != condition);
        self.overrides.push((condition, rule));
        self
    }

    fn rule_for(&self, condition: RetryCondition) -> &RetryRule {
        self.overrides
            .iter()
            .find(|(c, _)| *c == condition)
            .map(|(_, rule)| rule)
            .unwrap_or(&self.default_rule)
    }
}

/// Which retry category an error falls into, if any.
fn retry_condition(err: &Error) -> Option<RetryCondition> {
    if err.is(ErrorCode::TRANSACTION_SERIALIZATION) || err.is(ErrorCode::TRANSACTION_DEADLOCK) {
        return Some(RetryCondition::TransactionConflict);
    }
    if err.is(ErrorCode::CLIENT_CONNECTION) && !err.effects_unknown() {
        return Some(RetryCondition::NetworkError);
    }
    None
}

/// An open transaction.
///
/// The handle owns the connection borrow until the orchestrator commits
/// or rolls back. Handles are cheap to clone so the body closure can
/// move one into its future; operations on clones are serialized.
#[derive(Clone)]
pub struct Tx {
    inner: Arc<tokio::sync::Mutex<BorrowGuard>>,
    cancel: CancellationToken,
}

impl Tx {
    fn request<'a>(query: &'a str, args: Value) -> QueryRequest<'a> {
        QueryRequest {
            query,
            args,
            cardinality: Cardinality::Many,
            io_format: IoFormat::Binary,
            shape: Shape::Dynamic,
            capabilities: Capabilities::ALL,
        }
    }

    async fn run(&self, req: &QueryRequest<'_>) -> Result<Vec<Value>> {
        let mut guard = self.inner.lock().await;
        guard.run_query(req, &self.cancel).await
    }

    /// Run a statement, discarding any result.
    pub async fn execute(&self, query: &str) -> Result<()> {
        let req = QueryRequest {
            cardinality: Cardinality::NoResult,
            ..Tx::request(query, Value::Tuple(vec![]))
        };
        self.run(&req).await.map(|_| ())
    }

    /// Run a query, returning all results.
    pub async fn query(&self, query: &str, args: Value) -> Result<Vec<Value>> {
        self.run(&Tx::request(query, args)).await
    }

    /// Run a query with an explicit output shape.
    pub async fn query_shaped(
        &self,
        query: &str,
        args: Value,
        shape: Shape,
    ) -> Result<Vec<Value>> {
        let req = QueryRequest {
            shape,
            ..Tx::request(query, args)
        };
        self.run(&req).await
    }

    /// Run a query that must return exactly one result.
    pub async fn query_single(&self, query: &str, args: Value) -> Result<Value> {
        let req = QueryRequest {
            cardinality: Cardinality::One,
            ..Tx::request(query, args)
        };
        let mut rows = self.run(&req).await?;
        Ok(rows.pop().expect("cardinality one yields a row"))
    }

    /// Run a query, returning the results as a JSON string.
    pub async fn query_json(&self, query: &str, args: Value) -> Result<String> {
        let req = QueryRequest {
            io_format: IoFormat::Json,
            ..Tx::request(query, args)
        };
        let rows = self.run(&req).await?;
        Ok(collect_json(rows))
    }

    /// Run a single-result query, returning the result as JSON.
    pub async fn query_single_json(&self, query: &str, args: Value) -> Result<String> {
        let req = QueryRequest {
            cardinality: Cardinality::One,
            io_format: IoFormat::Json,
            ..Tx::request(query, args)
        };
        let mut rows = self.run(&req).await?;
        Ok(match rows.pop() {
            Some(Value::Json(text)) => text,
            Some(other) => {
                return Err(Error::protocol(format!(
                    "expected JSON result, got {}",
                    other.kind_name()
                )))
            }
            None => unreachable!("cardinality one yields a row"),
        })
    }

    async fn start(&self, options: &TxOptions) -> Result<()> {
        let statement = options.start_statement();
        let req = QueryRequest {
            cardinality: Cardinality::NoResult,
            ..Tx::request(&statement, Value::Tuple(vec![]))
        };
        self.run(&req).await.map(|_| ())
    }

    async fn commit(&self) -> Result<()> {
        let req = QueryRequest {
            cardinality: Cardinality::NoResult,
            ..Tx::request("commit", Value::Tuple(vec![]))
        };
        match self.run(&req).await {
            Ok(_) => Ok(()),
            // connection loss while COMMIT was in flight: the effects may
            // have been applied, so this attempt must not be retried
            Err(err) if err.is(ErrorCode::CLIENT_CONNECTION) => {
                Err(err.with_effects_unknown())
            }
            Err(err) => Err(err),
        }
    }

    async fn rollback(&self) -> Result<()> {
        let req = QueryRequest {
            cardinality: Cardinality::NoResult,
            ..Tx::request("rollback", Value::Tuple(vec![]))
        };
        self.run(&req).await.map(|_| ())
    }
}

/// JSON results arrive as one wire value; multiple data frames are
/// joined into a JSON array.
pub(crate) fn collect_json(rows: Vec<Value>) -> String {
    let mut texts = rows.into_iter().filter_map(|v| match v {
        Value::Json(text) => Some(text),
        _ => None,
    });
    match texts.next() {
        None => "[]".to_string(),
        Some(first) => {
            let mut rest = texts.peekable();
            if rest.peek().is_none() {
                first
            } else {
                let mut out = String::from("[");
                out.push_str(&first);
                for text in rest {
                    out.push(',');
                    out.push_str(&text);
                }
                out.push(']');
                out
            }
        }
    }
}

/// Begin, run `body`, commit on success, roll back on error. The body's
/// error is surfaced verbatim.
pub async fn raw_tx<T, B, F>(
    handle: &ConnHandle,
    options: &TxOptions,
    cancel: &CancellationToken,
    mut body: B,
) -> Result<T>
where
    B: FnMut(Tx) -> F,
    F: Future<Output = Result<T>>,
{
    run_attempt(handle, options, cancel, &mut body).await
}

/// Begin/run/commit with sequential retries for retryable failures.
pub async fn retrying_tx<T, B, F>(
    handle: &ConnHandle,
    options: &TxOptions,
    retry: &RetryOptions,
    cancel: &CancellationToken,
    mut body: B,
) -> Result<T>
where
    B: FnMut(Tx) -> F,
    F: Future<Output = Result<T>>,
{
    let mut failures: u32 = 0;
    loop {
        match run_attempt(handle, options, cancel, &mut body).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(condition) = retry_condition(&err) else {
                    return Err(err);
                };
                let rule = retry.rule_for(condition);
                failures += 1;
                if failures >= rule.attempts {
                    warn!(failures, error = %err, "transaction retries exhausted");
                    return Err(err);
                }
                let delay = (rule.backoff)(failures);
                debug!(
                    ?condition,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "retrying transaction"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::client_connection("transaction cancelled"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_attempt<T, B, F>(
    handle: &ConnHandle,
    options: &TxOptions,
    cancel: &CancellationToken,
    body: &mut B,
) -> Result<T>
where
    B: FnMut(Tx) -> F,
    F: Future<Output = Result<T>>,
{
    let guard = handle.try_borrow(BorrowReason::Transaction)?;
    let tx = Tx {
        inner: Arc::new(tokio::sync::Mutex::new(guard)),
        cancel: cancel.clone(),
    };
    tx.start(options).await?;

    match body(tx.clone()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            // the rollback outcome cannot improve on the body's error
            if let Err(rb) = tx.rollback().await {
                debug!(error = %rb, "rollback after failed transaction body");
            }
            Err(err)
        }
    }
}
