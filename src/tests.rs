//! Protocol scenario tests against a scripted in-process server.
//!
//! The mock listens on a loopback port and speaks the real wire format
//! (it is built from the same `buff` primitives the driver uses), so
//! these tests exercise the full path: framing, handshake, prepare/
//! describe/execute, codec caches, pools and transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buff::{Reader, Writer};
use crate::codec::scalar::ids;
use crate::config::{ConnConfig, TlsSecurity};
use crate::connection::{ConnState, Connection, QueryRequest};
use crate::errors::ErrorCode;
use crate::pool::{Pool, PoolConfig};
use crate::protocol::{client_tag, server_tag};
use crate::shape::{ScalarShape, Shape};
use crate::transaction::{RetryCondition, RetryOptions, RetryRule, Tx};
use crate::value::Value;
use crate::{Client, CodecContext};

// ============================================================================
// Mock server
// ============================================================================

/// What the mock does when a query is executed.
#[derive(Clone)]
enum Reply {
    /// Rows of pre-encoded element payloads.
    Rows(Vec<Vec<u8>>),
    /// ErrorResponse with this code and message.
    Fail(u32, String),
    /// Drop the connection without responding.
    Kill,
}

type Handler = Arc<dyn Fn(&str, u64) -> Reply + Send + Sync>;

#[derive(Clone)]
struct MockServer {
    addr: std::net::SocketAddr,
    /// Every executed statement, in order, across connections.
    log: Arc<parking_lot::Mutex<Vec<String>>>,
    attempts: Arc<parking_lot::Mutex<HashMap<String, u64>>>,
    handler: Handler,
}

impl MockServer {
    async fn start(handler: Handler) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = MockServer {
            addr,
            log: Arc::new(parking_lot::Mutex::new(Vec::new())),
            attempts: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            handler,
        };
        let accept = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let conn = accept.clone();
                tokio::spawn(async move {
                    let _ = conn.serve(stream).await;
                });
            }
        });
        server
    }

    /// A server where every query returns the given rows.
    async fn with_rows(rows: Vec<Vec<u8>>) -> MockServer {
        MockServer::start(Arc::new(move |_, _| Reply::Rows(rows.clone()))).await
    }

    fn config(&self) -> ConnConfig {
        ConnConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            tls_security: TlsSecurity::Off,
            connect_timeout: StdDuration::from_secs(2),
            wait_until_available: StdDuration::from_secs(2),
            ..ConnConfig::default()
        }
    }

    fn statements(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    async fn serve(&self, mut stream: TcpStream) -> std::io::Result<()> {
        // client handshake
        let (tag, _payload) = read_frame(&mut stream).await?;
        assert_eq!(tag, client_tag::CLIENT_HANDSHAKE);

        let mut greeting = Writer::new();
        server_msg(&mut greeting, server_tag::SERVER_HANDSHAKE, |w| {
            w.push_u16(1);
            w.push_u16(0);
            w.push_u16(0);
        });
        server_msg(&mut greeting, server_tag::AUTHENTICATION, |w| {
            w.push_u32(0);
        });
        server_msg(&mut greeting, server_tag::SERVER_KEY_DATA, |w| {
            w.push_raw(&[7u8; 32]);
        });
        server_msg(&mut greeting, server_tag::PARAMETER_STATUS, |w| {
            w.push_str("server_version");
            w.push_str("1.0-mock");
        });
        server_msg(&mut greeting, server_tag::READY_FOR_COMMAND, |w| {
            w.push_u16(0);
            w.push_u8(b'I');
        });
        stream.write_all(&greeting.take()).await?;

        let mut in_tx = false;
        let mut current_query = String::new();
        loop {
            let (tag, payload) = read_frame(&mut stream).await?;
            let mut out = Writer::new();
            match tag {
                client_tag::PREPARE => {
                    let mut r = Reader::new(payload);
                    skip_headers(&mut r);
                    let _io_format = r.pop_u8().unwrap();
                    let _cardinality = r.pop_u8().unwrap();
                    let _stmt = r.pop_bytes().unwrap();
                    current_query = r.pop_str().unwrap();
                    server_msg(&mut out, server_tag::PREPARE_COMPLETE, |w| {
                        w.push_u16(0);
                        w.push_u8(b'm');
                        w.push_uuid(Uuid::nil()); // empty input tuple
                        w.push_uuid(ids::INT64);
                    });
                }
                client_tag::DESCRIBE_STATEMENT => {
                    server_msg(&mut out, server_tag::COMMAND_DATA_DESCRIPTION, |w| {
                        w.push_u16(0);
                        w.push_u8(b'm');
                        w.push_uuid(Uuid::nil());
                        w.push_bytes(b""); // empty input row
                        w.push_uuid(ids::INT64);
                        w.push_bytes(&int64_descriptor());
                    });
                }
                client_tag::EXECUTE => {
                    self.log.lock().push(current_query.clone());
                    let attempt = {
                        let mut attempts = self.attempts.lock();
                        let n = attempts.entry(current_query.clone()).or_insert(0);
                        *n += 1;
                        *n
                    };

                    let lowered = current_query.to_ascii_lowercase();
                    if lowered.starts_with("start transaction") {
                        in_tx = true;
                    } else if lowered.starts_with("commit") || lowered.starts_with("rollback") {
                        in_tx = false;
                    }

                    match (self.handler)(&current_query, attempt) {
                        Reply::Kill => return Ok(()),
                        Reply::Fail(code, message) => {
                            server_msg(&mut out, server_tag::ERROR_RESPONSE, |w| {
                                w.push_u8(120);
                                w.push_u32(code);
                                w.push_str(&message);
                                w.push_u16(0);
                            });
                        }
                        Reply::Rows(rows) => {
                            if !rows.is_empty() {
                                server_msg(&mut out, server_tag::DATA, |w| {
                                    w.push_u16(rows.len() as u16);
                                    for row in &rows {
                                        w.push_bytes(row);
                                    }
                                });
                            }
                            server_msg(&mut out, server_tag::COMMAND_COMPLETE, |w| {
                                w.push_u16(0);
                                w.push_str("OK");
                            });
                        }
                    }
                }
                client_tag::SYNC => {
                    server_msg(&mut out, server_tag::READY_FOR_COMMAND, |w| {
                        w.push_u16(0);
                        w.push_u8(if in_tx { b'T' } else { b'I' });
                    });
                }
                client_tag::TERMINATE => return Ok(()),
                other => panic!("mock server got unexpected tag {:?}", other as char),
            }
            if !out.is_empty() {
                stream.write_all(&out.take()).await?;
            }
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, Bytes)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).await?;
    Ok((header[0], Bytes::from(payload)))
}

fn server_msg(out: &mut Writer, tag: u8, body: impl FnOnce(&mut Writer)) {
    out.begin_message(tag);
    body(out);
    out.end_message().unwrap();
}

fn skip_headers(r: &mut Reader) {
    let count = r.pop_u16().unwrap();
    for _ in 0..count {
        r.pop_u16().unwrap();
        r.pop_bytes().unwrap();
    }
}

/// Descriptor blob declaring the int64 base scalar.
fn int64_descriptor() -> Vec<u8> {
    let mut w = Writer::new();
    w.push_u8(2); // base scalar
    w.push_uuid(ids::INT64);
    w.take().to_vec()
}

fn int64_row(v: i64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn handshake_and_trivial_query() {
    let server = MockServer::with_rows(vec![int64_row(1)]).await;
    let cancel = CancellationToken::new();

    let mut conn = Connection::connect(server.config(), CodecContext::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(conn.state(), ConnState::Ready);
    assert_eq!(conn.server_parameter("server_version"), Some("1.0-mock"));
    assert_eq!(conn.key_data(), Some(&[7u8; 32]));

    let rows = conn
        .run_query(&QueryRequest::new("select 1"), &cancel)
        .await
        .unwrap();
    assert_eq!(rows, vec![Value::Int64(1)]);
    assert_eq!(conn.state(), ConnState::Ready);
}

#[tokio::test]
async fn repeated_query_hits_the_caches() {
    let server = MockServer::with_rows(vec![int64_row(42)]).await;
    let cancel = CancellationToken::new();
    let mut conn = Connection::connect(server.config(), CodecContext::default(), &cancel)
        .await
        .unwrap();

    let req = QueryRequest {
        shape: Shape::Scalar(ScalarShape::Int64),
        ..QueryRequest::new("select answer()")
    };
    for _ in 0..3 {
        let rows = conn.run_query(&req, &cancel).await.unwrap();
        assert_eq!(rows, vec![Value::Int64(42)]);
    }

    // one prepare, one describe; afterwards only Execute+Sync go out
    assert_eq!(conn.prepare_count, 1);
    assert_eq!(conn.describe_count, 1);

    // a different output shape is a different fingerprint
    let dynamic = QueryRequest::new("select answer()");
    conn.run_query(&dynamic, &cancel).await.unwrap();
    assert_eq!(conn.prepare_count, 2);
}

#[tokio::test]
async fn cardinality_violations() {
    let server = MockServer::start(Arc::new(|query, _| {
        if query.contains("{1, 2}") {
            Reply::Rows(vec![int64_row(1), int64_row(2)])
        } else {
            Reply::Rows(vec![])
        }
    }))
    .await;
    let cancel = CancellationToken::new();
    let client = Client::new(server.config());

    let err = client
        .query_single(&cancel, "select {1, 2}", Value::Tuple(vec![]))
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::RESULT_CARDINALITY_MISMATCH));

    let err = client
        .query_single(&cancel, "select <int64>{}", Value::Tuple(vec![]))
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::NO_DATA));

    // plain query is fine with any number of rows
    let rows = client
        .query(&cancel, "select {1, 2}", Value::Tuple(vec![]))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn json_variants_return_raw_payloads() {
    let server = MockServer::start(Arc::new(|query, _| {
        if query.contains("single") {
            Reply::Rows(vec![b"{\"a\": 1}".to_vec()])
        } else {
            Reply::Rows(vec![b"[1, 2, 3]".to_vec()])
        }
    }))
    .await;
    let cancel = CancellationToken::new();
    let client = Client::new(server.config());

    let json = client
        .query_json(&cancel, "select json_all()", Value::Tuple(vec![]))
        .await
        .unwrap();
    assert_eq!(json, "[1, 2, 3]");

    let json = client
        .query_single_json(&cancel, "select json_single()", Value::Tuple(vec![]))
        .await
        .unwrap();
    assert_eq!(json, "{\"a\": 1}");
}

#[tokio::test]
async fn server_errors_map_to_categories() {
    let server = MockServer::start(Arc::new(|query, _| {
        if query.contains("broken") {
            Reply::Fail(0x0401_0000, "unexpected token".to_string())
        } else {
            Reply::Rows(vec![int64_row(5)])
        }
    }))
    .await;
    let cancel = CancellationToken::new();
    let client = Client::new(server.config());

    let err = client
        .query(&cancel, "select broken(", Value::Tuple(vec![]))
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::INVALID_SYNTAX));
    assert!(err.is(ErrorCode::QUERY));

    // the connection survives a query error
    let rows = client
        .query(&cancel, "select 5", Value::Tuple(vec![]))
        .await
        .unwrap();
    assert_eq!(rows, vec![Value::Int64(5)]);
}

#[tokio::test]
async fn pool_lease_rejects_transaction_control() {
    let server = MockServer::with_rows(vec![int64_row(1)]).await;
    let cancel = CancellationToken::new();
    let pool = Pool::new(server.config(), PoolConfig::default());

    let lease = pool.acquire(&cancel).await.unwrap();

    let expect_disabled = |err: crate::Error| {
        assert!(err.is(ErrorCode::DISABLED_CAPABILITY), "{}", err);
        assert!(
            err.to_string()
                .ends_with("cannot execute transaction control commands"),
            "{}",
            err
        );
    };

    expect_disabled(lease.execute(&cancel, "START TRANSACTION").await.unwrap_err());
    expect_disabled(
        lease
            .query(&cancel, "START TRANSACTION", Value::Tuple(vec![]))
            .await
            .unwrap_err(),
    );
    expect_disabled(
        lease
            .query_json(&cancel, "START TRANSACTION", Value::Tuple(vec![]))
            .await
            .unwrap_err(),
    );
    expect_disabled(
        lease
            .query_single(&cancel, "START TRANSACTION", Value::Tuple(vec![]))
            .await
            .unwrap_err(),
    );
    expect_disabled(
        lease
            .query_single_json(&cancel, "START TRANSACTION", Value::Tuple(vec![]))
            .await
            .unwrap_err(),
    );

    // the lease survived all five rejections
    let rows = lease
        .query(&cancel, "select 1", Value::Tuple(vec![]))
        .await
        .unwrap();
    assert_eq!(rows, vec![Value::Int64(1)]);

    let sibling = lease.with_tx_options(crate::TxOptions::new());

    lease.release().await.unwrap();

    let err = lease.release().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "InterfaceError: connection released more than once"
    );

    // the sibling shares the release slot
    let err = sibling.release().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "InterfaceError: connection released more than once"
    );

    pool.close().await;
}

#[tokio::test]
async fn retrying_tx_retries_serialization_conflicts() {
    let server = MockServer::start(Arc::new(|query, attempt| {
        if query.contains("contended") && attempt <= 2 {
            Reply::Fail(0x0503_0100, "could not serialize access".to_string())
        } else {
            Reply::Rows(vec![int64_row(attempt as i64)])
        }
    }))
    .await;
    let cancel = CancellationToken::new();

    let sleeps = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = Arc::clone(&sleeps);
    let retry = RetryOptions::new().with_rule(
        RetryCondition::TransactionConflict,
        RetryRule::new(3).with_backoff(move |attempt| {
            record.lock().push(attempt);
            StdDuration::from_millis(1)
        }),
    );

    let pool = Pool::new(server.config(), PoolConfig::default()).with_retry_options(retry);
    let result = pool
        .retrying_tx(&cancel, |tx: Tx| async move {
            tx.query_single("select contended()", Value::Tuple(vec![])).await
        })
        .await
        .unwrap();

    // third attempt's return value
    assert_eq!(result, Value::Int64(3));
    // fewer than three sleeps: one per failed attempt
    assert_eq!(sleeps.lock().clone(), vec![1, 2]);

    // attempts were full begin/run/rollback cycles
    let statements = server.statements();
    let starts = statements
        .iter()
        .filter(|s| s.starts_with("start transaction"))
        .count();
    let rollbacks = statements.iter().filter(|s| *s == "rollback").count();
    let commits = statements.iter().filter(|s| *s == "commit").count();
    assert_eq!(starts, 3);
    assert_eq!(rollbacks, 2);
    assert_eq!(commits, 1);

    pool.close().await;
}

#[tokio::test]
async fn retrying_tx_surfaces_non_retryable_errors() {
    let server = MockServer::start(Arc::new(|query, _| {
        if query.contains("doomed") {
            Reply::Fail(0x0401_0000, "unexpected token".to_string())
        } else {
            Reply::Rows(vec![])
        }
    }))
    .await;
    let cancel = CancellationToken::new();
    let pool = Pool::new(server.config(), PoolConfig::default());

    let err = pool
        .retrying_tx(&cancel, |tx: Tx| async move {
            tx.query("select doomed()", Value::Tuple(vec![])).await
        })
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::INVALID_SYNTAX));

    // exactly one attempt
    let statements = server.statements();
    assert_eq!(
        statements
            .iter()
            .filter(|s| s.starts_with("start transaction"))
            .count(),
        1
    );

    pool.close().await;
}

#[tokio::test]
async fn raw_tx_commits_on_success_and_rolls_back_on_error() {
    let server = MockServer::with_rows(vec![int64_row(7)]).await;
    let cancel = CancellationToken::new();
    let client = Client::new(server.config());

    let value = client
        .raw_tx(&cancel, |tx: Tx| async move {
            tx.query_single("select 7", Value::Tuple(vec![])).await
        })
        .await
        .unwrap();
    assert_eq!(value, Value::Int64(7));

    let err = client
        .raw_tx(&cancel, |tx: Tx| async move {
            tx.query_single("select 7", Value::Tuple(vec![])).await?;
            Err::<(), _>(crate::Error::interface("application level failure"))
        })
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::INTERFACE));

    let statements = server.statements();
    assert_eq!(statements.iter().filter(|s| *s == "commit").count(), 1);
    assert_eq!(statements.iter().filter(|s| *s == "rollback").count(), 1);
    assert_eq!(
        statements.first().map(String::as_str),
        Some("start transaction isolation serializable, read write, not deferrable")
    );
}

#[tokio::test]
async fn transparent_reconnect_after_dropped_transport() {
    // kill the transport on the second executed statement
    let server = MockServer::start(Arc::new(|_, attempt| {
        if attempt == 2 {
            Reply::Kill
        } else {
            Reply::Rows(vec![int64_row(attempt as i64)])
        }
    }))
    .await;
    let cancel = CancellationToken::new();
    let client = Client::new(server.config());

    let rows = client
        .query(&cancel, "select seq()", Value::Tuple(vec![]))
        .await
        .unwrap();
    assert_eq!(rows, vec![Value::Int64(1)]);

    // the interrupted call fails once, classified for reconnect
    let err = client
        .query(&cancel, "select seq()", Value::Tuple(vec![]))
        .await
        .unwrap_err();
    assert!(err.is(ErrorCode::CLIENT_CONNECTION), "{}", err);

    // the next call succeeds over a fresh session
    let rows = client
        .query(&cancel, "select seq()", Value::Tuple(vec![]))
        .await
        .unwrap();
    assert_eq!(rows, vec![Value::Int64(3)]);
}

// ============================================================================
// Pool behaviour (lazy slots; no server required)
// ============================================================================

#[tokio::test]
async fn pool_bounds_concurrent_leases() {
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let (a2, _p2) = (Arc::clone(&active), Arc::clone(&peak));

    let pool = Pool::new(
        ConnConfig::default(),
        PoolConfig {
            max_conns: Some(2),
            on_acquire: Some(Arc::new(move || {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
            })),
            on_release: Some(Arc::new(move || {
                a2.fetch_sub(1, Ordering::SeqCst);
            })),
            ..PoolConfig::default()
        },
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let lease = pool.acquire(&cancel).await.unwrap();
            tokio::time::sleep(StdDuration::from_millis(5)).await;
            lease.release().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle <= 2);
    pool.close().await;
}

#[tokio::test]
async fn pool_wait_timeout_bounds_saturated_acquires() {
    let pool = Pool::new(
        ConnConfig::default(),
        PoolConfig {
            max_conns: Some(1),
            wait_timeout: Some(StdDuration::from_millis(30)),
            ..PoolConfig::default()
        },
    );
    let cancel = CancellationToken::new();

    let held = pool.acquire(&cancel).await.unwrap();
    let err = pool.acquire(&cancel).await.unwrap_err();
    assert!(err.is(ErrorCode::CLIENT_CONNECTION));

    held.release().await.unwrap();
    let lease = pool.acquire(&cancel).await.unwrap();
    lease.release().await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn pool_acquire_honours_cancellation() {
    let pool = Pool::new(
        ConnConfig::default(),
        PoolConfig {
            max_conns: Some(1),
            ..PoolConfig::default()
        },
    );
    let cancel = CancellationToken::new();
    let _held = pool.acquire(&cancel).await.unwrap();

    let waiter_cancel = cancel.child_token();
    let waiting = {
        let pool = pool.clone();
        let token = waiter_cancel.clone();
        tokio::spawn(async move { pool.acquire(&token).await })
    };
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    waiter_cancel.cancel();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(err.is(ErrorCode::CLIENT_CONNECTION));
}

#[tokio::test]
async fn closed_pool_rejects_acquires() {
    let pool = Pool::new(ConnConfig::default(), PoolConfig::default());
    let cancel = CancellationToken::new();

    let lease = pool.acquire(&cancel).await.unwrap();
    lease.release().await.unwrap();
    pool.close().await;

    let err = pool.acquire(&cancel).await.unwrap_err();
    assert_eq!(err.to_string(), "InterfaceError: pool closed");
}

#[tokio::test]
async fn pool_keeps_min_conns_floor() {
    let pool = Pool::new(
        ConnConfig::default(),
        PoolConfig {
            min_conns: Some(2),
            max_conns: Some(4),
            ..PoolConfig::default()
        },
    );
    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.min_conns, 2);
    pool.close().await;
}

#[tokio::test]
async fn concurrent_borrow_of_one_lease_is_rejected() {
    let server = MockServer::with_rows(vec![int64_row(1)]).await;
    let cancel = CancellationToken::new();
    let pool = Pool::new(server.config(), PoolConfig::default());
    let lease = pool.acquire(&cancel).await.unwrap();

    // park a transaction on the lease, then try to query through the
    // sibling while the transaction holds the borrow
    let mut sibling_slot = Some(lease.with_tx_options(crate::TxOptions::new()));
    let body_cancel = cancel.clone();
    lease
        .raw_tx(&cancel, move |tx: Tx| {
            let sibling = sibling_slot.take();
            let cancel = body_cancel.clone();
            async move {
                tx.query("select 1", Value::Tuple(vec![])).await?;
                let sibling = sibling.expect("transaction body runs once");
                let err = sibling
                    .query(&cancel, "select 1", Value::Tuple(vec![]))
                    .await
                    .unwrap_err();
                assert!(err.is(ErrorCode::INTERFACE), "{}", err);
                assert!(err.to_string().contains("in use by a transaction"));
                Ok(())
            }
        })
        .await
        .unwrap();

    lease.release().await.unwrap();
    pool.close().await;
}
