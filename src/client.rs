//! Single-connection client.
//!
//! `Client` wraps one reconnecting connection behind the borrow gate and
//! exposes the same query and transaction surface as a pool lease. Most
//! applications want [`crate::Pool`]; a dedicated client fits scripts,
//! tests and administrative sessions.

use tokio_util::sync::CancellationToken;

use crate::borrow::ConnHandle;
use crate::codec::CodecContext;
use crate::config::ConnConfig;
use crate::errors::Result;
use crate::protocol::Capabilities;
use crate::reconnect::ReconnConn;
use crate::shape::Shape;
use std::future::Future;

use crate::transaction::{self, RetryOptions, Tx, TxOptions};
use crate::value::Value;

/// Query operations shared by clients and pool leases: borrow the
/// connection, build the request, run it.
pub(crate) mod ops {
    use super::*;
    use crate::borrow::BorrowReason;
    use crate::connection::QueryRequest;
    use crate::errors::Error;
    use crate::protocol::{Cardinality, IoFormat};

    pub(crate) async fn execute(
        handle: &ConnHandle,
        capabilities: Capabilities,
        cancel: &CancellationToken,
        query: &str,
    ) -> Result<()> {
        let mut guard = handle.try_borrow(BorrowReason::Query)?;
        let req = QueryRequest {
            cardinality: Cardinality::NoResult,
            capabilities,
            ..QueryRequest::new(query)
        };
        guard.run_query(&req, cancel).await.map(|_| ())
    }

    pub(crate) async fn query(
        handle: &ConnHandle,
        capabilities: Capabilities,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
        shape: Shape,
    ) -> Result<Vec<Value>> {
        let mut guard = handle.try_borrow(BorrowReason::Query)?;
        let req = QueryRequest {
            args,
            shape,
            capabilities,
            ..QueryRequest::new(query)
        };
        guard.run_query(&req, cancel).await
    }

    pub(crate) async fn query_single(
        handle: &ConnHandle,
        capabilities: Capabilities,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
        shape: Shape,
    ) -> Result<Value> {
        let mut guard = handle.try_borrow(BorrowReason::Query)?;
        let req = QueryRequest {
            args,
            shape,
            capabilities,
            cardinality: Cardinality::One,
            ..QueryRequest::new(query)
        };
        let mut rows = guard.run_query(&req, cancel).await?;
        Ok(rows.pop().expect("cardinality one yields a row"))
    }

    pub(crate) async fn query_json(
        handle: &ConnHandle,
        capabilities: Capabilities,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<String> {
        let mut guard = handle.try_borrow(BorrowReason::Query)?;
        let req = QueryRequest {
            args,
            capabilities,
            io_format: IoFormat::Json,
            ..QueryRequest::new(query)
        };
        let rows = guard.run_query(&req, cancel).await?;
        Ok(crate::transaction::collect_json(rows))
    }

    pub(crate) async fn query_single_json(
        handle: &ConnHandle,
        capabilities: Capabilities,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<String> {
        let mut guard = handle.try_borrow(BorrowReason::Query)?;
        let req = QueryRequest {
            args,
            capabilities,
            cardinality: Cardinality::One,
            io_format: IoFormat::Json,
            ..QueryRequest::new(query)
        };
        let mut rows = guard.run_query(&req, cancel).await?;
        match rows.pop() {
            Some(Value::Json(text)) => Ok(text),
            Some(other) => Err(Error::protocol(format!(
                "expected JSON result, got {}",
                other.kind_name()
            ))),
            None => unreachable!("cardinality one yields a row"),
        }
    }
}

/// A client over a single connection.
#[derive(Clone)]
pub struct Client {
    handle: ConnHandle,
    tx_options: TxOptions,
    retry_options: RetryOptions,
}

impl Client {
    /// Create a client. The connection dials on first use.
    pub fn new(config: ConnConfig) -> Client {
        Client::with_codecs(config, CodecContext::default())
    }

    pub fn with_codecs(config: ConnConfig, codec_ctx: CodecContext) -> Client {
        Client {
            handle: ConnHandle::new(ReconnConn::new(config, codec_ctx)),
            tx_options: TxOptions::default(),
            retry_options: RetryOptions::default(),
        }
    }

    /// A sibling client with different transaction options, sharing the
    /// same underlying connection.
    pub fn with_tx_options(&self, options: TxOptions) -> Client {
        Client {
            handle: self.handle.clone(),
            tx_options: options,
            retry_options: self.retry_options.clone(),
        }
    }

    pub fn with_retry_options(&self, options: RetryOptions) -> Client {
        Client {
            handle: self.handle.clone(),
            tx_options: self.tx_options,
            retry_options: options,
        }
    }

    /// Force the connection open now instead of on first query.
    pub async fn ensure_connected(&self, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.handle.try_borrow(crate::borrow::BorrowReason::Query)?;
        guard.ensure_connected(cancel).await.map(|_| ())
    }

    fn capabilities() -> Capabilities {
        Capabilities::ALL.without(Capabilities::TRANSACTION)
    }

    pub async fn execute(&self, cancel: &CancellationToken, query: &str) -> Result<()> {
        ops::execute(&self.handle, Client::capabilities(), cancel, query).await
    }

    pub async fn query(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<Vec<Value>> {
        ops::query(
            &self.handle,
            Client::capabilities(),
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
        ops::query(&self.handle, Client::capabilities(), cancel, query, args, shape).await
    }

    pub async fn query_single(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<Value> {
        ops::query_single(
            &self.handle,
            Client::capabilities(),
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
        ops::query_json(&self.handle, Client::capabilities(), cancel, query, args).await
    }

    pub async fn query_single_json(
        &self,
        cancel: &CancellationToken,
        query: &str,
        args: Value,
    ) -> Result<String> {
        ops::query_single_json(&self.handle, Client::capabilities(), cancel, query, args).await
    }

    pub async fn raw_tx<T, B, F>(&self, cancel: &CancellationToken, body: B) -> Result<T>
    where
        B: FnMut(Tx) -> F,
        F: Future<Output = Result<T>>,
    {
        transaction::raw_tx(&self.handle, &self.tx_options, cancel, body).await
    }

    pub async fn retrying_tx<T, B, F>(&self, cancel: &CancellationToken, body: B) -> Result<T>
    where
        B: FnMut(Tx) -> F,
        F: Future<Output = Result<T>>,
    {
        transaction::retrying_tx(
            &self.handle,
            &self.tx_options,
            &self.retry_options,
            cancel,
            body,
        )
        .await
    }

    /// Close the underlying connection.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.handle.try_borrow(crate::borrow::BorrowReason::Query)?;
        guard.close(cancel).await
    }
}
