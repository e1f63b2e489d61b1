//! Async client driver for the Lumen database.
//!
//! The driver speaks Lumen's binary, message-framed protocol over
//! TCP/TLS and provides:
//! - a binary wire codec translating server type descriptors to host
//!   values (`codec`, `descriptor`, `shape`, `value`)
//! - a connection state machine with SCRAM-SHA-256 authentication and
//!   prepared-statement/codec caching (`connection`)
//! - transparent reconnection with bounded backoff (`reconnect`)
//! - retry-aware transactions (`transaction`)
//! - a bounded, concurrency-safe connection pool (`pool`)
//!
//! Most applications create a [`Pool`] and use leases or the pool-level
//! query helpers; single-connection workflows use [`Client`].

pub mod borrow;
pub mod buff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod datetime;
pub mod descriptor;
pub mod errors;
pub mod pool;
pub mod protocol;
pub mod reconnect;
pub mod scram;
pub mod shape;
pub mod transaction;
pub mod transport;
pub mod value;

#[cfg(test)]
mod tests;

pub use client::Client;
pub use codec::{CodecContext, DecimalMarshaller};
pub use config::{parse, parse_with_resolver, Builder, ConnConfig, InstanceResolver, TlsSecurity};
pub use connection::{ConnState, Connection, QueryRequest};
pub use datetime::{Duration, LocalDateTime};
pub use errors::{Error, ErrorCode, Result};
pub use pool::{Lease, Pool, PoolConfig, PoolStats};
pub use protocol::{Capabilities, Cardinality, IoFormat};
pub use shape::{ScalarShape, Shape, ShapeId};
pub use transaction::{
    IsolationLevel, RetryCondition, RetryOptions, RetryRule, Tx, TxOptions,
};
pub use value::{BigInt, Value};
