//! A single protocol connection: handshake, query lifecycle, caches.
//!
//! The connection owns the transport and is strictly single-user; the
//! borrow guard above it enforces that. All suspendable operations take a
//! cancellation token. Cancelling after a message has been written but
//! before `ReadyForCommand` arrives leaves the session indeterminate, so
//! the connection poisons itself and must be redialed.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use lru::LruCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::buff::{Writer, MAX_FRAME_SIZE};
use crate::codec::{self, CodecContext, DecodePlan, EncodePlan};
use crate::config::ConnConfig;
use crate::descriptor::TypeDesc;
use crate::errors::{Error, Result};
use crate::protocol::*;
use crate::scram::ScramClient;
use crate::shape::{Shape, ShapeId};
use crate::transport::Transport;
use crate::value::Value;

/// Entries per connection cache.
const CACHE_SIZE: usize = 1000;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    InTransaction,
    Closed,
}

/// Prepared-statement cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Fingerprint {
    query: String,
    cardinality: Cardinality,
    io_format: IoFormat,
    shape_id: ShapeId,
}

/// One query execution request.
#[derive(Debug, Clone)]
pub struct QueryRequest<'a> {
    pub query: &'a str,
    pub args: Value,
    pub cardinality: Cardinality,
    pub io_format: IoFormat,
    pub shape: Shape,
    pub capabilities: Capabilities,
}

impl<'a> QueryRequest<'a> {
    pub fn new(query: &'a str) -> Self {
        Self {
            query,
            args: Value::Tuple(vec![]),
            cardinality: Cardinality::Many,
            io_format: IoFormat::Binary,
            shape: Shape::Dynamic,
            capabilities: Capabilities::ALL,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    transport: Transport,
    config: ConnConfig,
    state: ConnState,
    read_buf: BytesMut,
    server_params: HashMap<String, String>,
    key_data: Option<[u8; 32]>,
    codec_ctx: CodecContext,
    type_id_cache: LruCache<Fingerprint, (Uuid, Uuid)>,
    in_codec_cache: LruCache<Uuid, Arc<EncodePlan>>,
    out_codec_cache: LruCache<(Uuid, ShapeId), Arc<DecodePlan>>,
    /// Wire-level counters, used to assert cache behaviour in tests.
    pub(crate) prepare_count: u64,
    pub(crate) describe_count: u64,
}

impl Connection {
    /// Dial and run the handshake to `Ready`.
    pub async fn connect(
        config: ConnConfig,
        codec_ctx: CodecContext,
        cancel: &CancellationToken,
    ) -> Result<Connection> {
        let transport = Transport::connect(&config, cancel).await?;
        let mut conn = Connection {
            transport,
            config,
            state: ConnState::Connecting,
            read_buf: BytesMut::with_capacity(32 * 1024),
            server_params: HashMap::new(),
            key_data: None,
            codec_ctx,
            type_id_cache: LruCache::new(NonZeroUsize::new(CACHE_SIZE).expect("nonzero")),
            in_codec_cache: LruCache::new(NonZeroUsize::new(CACHE_SIZE).expect("nonzero")),
            out_codec_cache: LruCache::new(NonZeroUsize::new(CACHE_SIZE).expect("nonzero")),
            prepare_count: 0,
            describe_count: 0,
        };
        conn.handshake(cancel).await?;
        Ok(conn)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.state, ConnState::Ready | ConnState::InTransaction)
    }

    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(|s| s.as_str())
    }

    /// Key data received during the handshake.
    pub fn key_data(&self) -> Option<&[u8; 32]> {
        self.key_data.as_ref()
    }

    /// Mark the connection unusable without touching the transport.
    /// Used when cancellation lands mid-message and the session state is
    /// indeterminate.
    pub fn poison(&mut self) {
        if self.state != ConnState::Closed {
            debug!("connection poisoned");
            self.state = ConnState::Closed;
        }
    }

    /// Graceful close: send Terminate and shut the transport down.
    pub async fn close(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.state = ConnState::Closed;
        let mut w = Writer::new();
        Terminate.write(&mut w)?;
        let _ = self.send_raw(&w.take(), cancel).await;
        let _ = self.transport.shutdown().await;
        Ok(())
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    async fn handshake(&mut self, cancel: &CancellationToken) -> Result<()> {
        let params = vec![
            ("user".to_string(), self.config.user.clone()),
            ("database".to_string(), self.config.database.clone()),
        ];
        let mut w = Writer::new();
        ClientHandshake { params: &params }.write(&mut w)?;
        self.send_raw(&w.take(), cancel).await?;

        loop {
            match self.next_message(cancel).await? {
                ServerMessage::ServerHandshake { major, minor } => {
                    trace!(major, minor, "server handshake");
                    if major != PROTOCOL_MAJOR {
                        self.poison();
                        return Err(Error::protocol(format!(
                            "unsupported protocol version {}.{}",
                            major, minor
                        )));
                    }
                }
                ServerMessage::AuthenticationOk => {}
                ServerMessage::AuthenticationSasl { methods } => {
                    self.authenticate_sasl(methods, cancel).await?;
                }
                ServerMessage::ServerKeyData { data } => {
                    self.key_data = Some(data);
                }
                ServerMessage::ReadyForCommand { tx_state } => {
                    self.apply_tx_state(tx_state);
                    debug!(
                        user = %self.config.user,
                        database = %self.config.database,
                        "connection ready"
                    );
                    return Ok(());
                }
                ServerMessage::ErrorResponse {
                    code,
                    message,
                    attributes,
                    ..
                } => {
                    self.poison();
                    return Err(Error::from_server(code, message, attributes));
                }
                other => {
                    self.poison();
                    return Err(Error::protocol(format!(
                        "unexpected {} during handshake",
                        other.name()
                    )));
                }
            }
        }
    }

    async fn authenticate_sasl(
        &mut self,
        methods: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        const METHOD: &str = "SCRAM-SHA-256";
        if !methods.iter().any(|m| m == METHOD) {
            return Err(Error::authentication(format!(
                "server offers no supported SASL method (got {:?})",
                methods
            )));
        }
        let password = self.config.password.clone().unwrap_or_default();
        let mut scram = ScramClient::new(&self.config.user, &password);

        let first = scram.client_first();
        let mut w = Writer::new();
        SaslInitialResponse {
            method: METHOD,
            data: &first,
        }
        .write(&mut w)?;
        self.send_raw(&w.take(), cancel).await?;

        loop {
            match self.next_message(cancel).await? {
                ServerMessage::AuthenticationSaslContinue { data } => {
                    let final_msg = scram.client_final(&data)?;
                    let mut w = Writer::new();
                    SaslResponse { data: &final_msg }.write(&mut w)?;
                    self.send_raw(&w.take(), cancel).await?;
                }
                ServerMessage::AuthenticationSaslFinal { data } => {
                    scram.verify_server(&data)?;
                }
                ServerMessage::AuthenticationOk => return Ok(()),
                ServerMessage::ErrorResponse {
                    code,
                    message,
                    attributes,
                    ..
                } => {
                    self.poison();
                    return Err(Error::from_server(code, message, attributes));
                }
                other => {
                    self.poison();
                    return Err(Error::protocol(format!(
                        "unexpected {} during authentication",
                        other.name()
                    )));
                }
            }
        }
    }

    // ========================================================================
    // Query lifecycle
    // ========================================================================

    /// Run one query: fingerprint → cached or freshly-compiled codecs →
    /// execute → decoded rows. Enforces the request's cardinality.
    pub async fn run_query(
        &mut self,
        req: &QueryRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        self.check_usable()?;

        if !req.capabilities.allows(Capabilities::TRANSACTION)
            && is_transaction_control(req.query)
        {
            return Err(Error::disabled_capability(
                "cannot execute transaction control commands",
            ));
        }

        let (in_plan, out_plan) = self.prepare_codecs(req, cancel).await?;

        // encode arguments
        let mut args = Writer::new();
        codec::encode(&in_plan, &mut args, &req.args, &self.codec_ctx)?;
        let args = args.take();

        let mut w = Writer::new();
        Execute {
            capabilities: req.capabilities,
            arguments: &args,
        }
        .write(&mut w)?;
        Sync.write(&mut w)?;
        self.send_raw(&w.take(), cancel).await?;

        let mut rows = Vec::new();
        let mut server_error: Option<Error> = None;
        loop {
            match self.next_message(cancel).await? {
                ServerMessage::Data { elements } => {
                    // on a decode failure, keep draining to ReadyForCommand
                    // so the connection stays usable
                    if server_error.is_none() {
                        for element in elements {
                            let mut r = crate::buff::Reader::new(element);
                            match codec::decode(&out_plan, &mut r, &self.codec_ctx) {
                                Ok(value) => rows.push(value),
                                Err(err) => {
                                    server_error = Some(err);
                                    break;
                                }
                            }
                        }
                    }
                }
                ServerMessage::CommandComplete { status } => {
                    trace!(status = %status, "command complete");
                }
                ServerMessage::ErrorResponse {
                    code,
                    message,
                    attributes,
                    ..
                } => {
                    server_error = Some(Error::from_server(code, message, attributes));
                }
                ServerMessage::ReadyForCommand { tx_state } => {
                    self.apply_tx_state(tx_state);
                    if let Some(err) = server_error {
                        return Err(err);
                    }
                    break;
                }
                other => {
                    self.poison();
                    return Err(Error::protocol(format!(
                        "unexpected {} during execute",
                        other.name()
                    )));
                }
            }
        }

        match req.cardinality {
            Cardinality::One if rows.is_empty() => {
                Err(Error::no_data("query returned no data for a required result"))
            }
            Cardinality::One | Cardinality::AtMostOne if rows.len() > 1 => Err(
                Error::cardinality_mismatch(format!(
                    "query returned {} results for a single-result request",
                    rows.len()
                )),
            ),
            _ => Ok(rows),
        }
    }

    /// Resolve the encoder/decoder pair for a request, preparing and
    /// describing on the server only when the caches miss.
    async fn prepare_codecs(
        &mut self,
        req: &QueryRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<EncodePlan>, Arc<DecodePlan>)> {
        let shape_id = req.shape.id();
        let fingerprint = Fingerprint {
            query: req.query.to_string(),
            cardinality: req.cardinality,
            io_format: req.io_format,
            shape_id,
        };

        let cached_ids = self.type_id_cache.get(&fingerprint).copied();
        let (in_id, out_id) = match cached_ids {
            Some(ids) => ids,
            None => {
                let ids = self.prepare(req, cancel).await?;
                self.type_id_cache.put(fingerprint, ids);
                ids
            }
        };

        let in_hit = self.in_codec_cache.get(&in_id).cloned();
        let out_hit = match req.io_format {
            // JSON results bypass the declared output type entirely
            IoFormat::Json => Some(Arc::new(DecodePlan::JsonText)),
            IoFormat::Binary => self.out_codec_cache.get(&(out_id, shape_id)).cloned(),
        };

        if let (Some(in_plan), Some(out_plan)) = (in_hit.clone(), out_hit.clone()) {
            return Ok((in_plan, out_plan));
        }

        // one of the descriptors is unknown for this shape: describe
        let (in_desc, out_desc) = self.describe(cancel).await?;

        let in_plan = match in_hit {
            Some(plan) => plan,
            None => {
                let plan = Arc::new(codec::compile_encoder(&in_desc, &self.codec_ctx)?);
                self.in_codec_cache.put(in_desc.id, plan.clone());
                plan
            }
        };
        let out_plan = match out_hit {
            Some(plan) => plan,
            None => {
                let plan = Arc::new(codec::compile_decoder(
                    &out_desc,
                    &req.shape,
                    &self.codec_ctx,
                )?);
                self.out_codec_cache.put((out_desc.id, shape_id), plan.clone());
                plan
            }
        };
        Ok((in_plan, out_plan))
    }

    /// Send Prepare and collect the declared type ids.
    async fn prepare(
        &mut self,
        req: &QueryRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Uuid, Uuid)> {
        let expected = match req.cardinality {
            Cardinality::One | Cardinality::AtMostOne => Cardinality::AtMostOne,
            _ => Cardinality::Many,
        };
        let mut w = Writer::new();
        Prepare {
            io_format: req.io_format,
            expected_cardinality: expected,
            query: req.query,
        }
        .write(&mut w)?;
        Sync.write(&mut w)?;
        self.prepare_count += 1;
        self.send_raw(&w.take(), cancel).await?;

        let mut ids = None;
        let mut server_error = None;
        loop {
            match self.next_message(cancel).await? {
                ServerMessage::PrepareComplete {
                    in_type_id,
                    out_type_id,
                    ..
                } => ids = Some((in_type_id, out_type_id)),
                ServerMessage::ErrorResponse {
                    code,
                    message,
                    attributes,
                    ..
                } => server_error = Some(Error::from_server(code, message, attributes)),
                ServerMessage::ReadyForCommand { tx_state } => {
                    self.apply_tx_state(tx_state);
                    if let Some(err) = server_error {
                        return Err(err);
                    }
                    return ids.ok_or_else(|| {
                        self.state = ConnState::Closed;
                        Error::protocol("server completed prepare without a statement result")
                    });
                }
                other => {
                    self.poison();
                    return Err(Error::protocol(format!(
                        "unexpected {} during prepare",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Send DescribeStatement and parse both descriptor blobs.
    async fn describe(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(TypeDesc, TypeDesc)> {
        let mut w = Writer::new();
        DescribeStatement.write(&mut w)?;
        Sync.write(&mut w)?;
        self.describe_count += 1;
        self.send_raw(&w.take(), cancel).await?;

        let mut descs = None;
        let mut server_error = None;
        loop {
            match self.next_message(cancel).await? {
                ServerMessage::CommandDataDescription {
                    in_type_id,
                    in_type_blob,
                    out_type_id,
                    out_type_blob,
                    ..
                } => {
                    let mut in_desc = TypeDesc::parse(in_type_blob)?;
                    let mut out_desc = TypeDesc::parse(out_type_blob)?;
                    // the server-declared ids key the caches
                    in_desc.id = in_type_id;
                    out_desc.id = out_type_id;
                    descs = Some((in_desc, out_desc));
                }
                ServerMessage::ErrorResponse {
                    code,
                    message,
                    attributes,
                    ..
                } => server_error = Some(Error::from_server(code, message, attributes)),
                ServerMessage::ReadyForCommand { tx_state } => {
                    self.apply_tx_state(tx_state);
                    if let Some(err) = server_error {
                        return Err(err);
                    }
                    return descs.ok_or_else(|| {
                        self.state = ConnState::Closed;
                        Error::protocol("server completed describe without a data description")
                    });
                }
                other => {
                    self.poison();
                    return Err(Error::protocol(format!(
                        "unexpected {} during describe",
                        other.name()
                    )));
                }
            }
        }
    }

    fn apply_tx_state(&mut self, tx_state: TxState) {
        self.state = match tx_state {
            TxState::NotInTransaction => ConnState::Ready,
            TxState::InTransaction | TxState::InFailedTransaction => ConnState::InTransaction,
        };
    }

    fn check_usable(&self) -> Result<()> {
        match self.state {
            ConnState::Ready | ConnState::InTransaction => Ok(()),
            ConnState::Connecting => Err(Error::interface("connection is still connecting")),
            ConnState::Closed => Err(Error::client_connection("connection is closed")),
        }
    }

    // ========================================================================
    // Framing
    // ========================================================================

    async fn send_raw(&mut self, data: &Bytes, cancel: &CancellationToken) -> Result<()> {
        let transport = &mut self.transport;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                // bytes may be on the wire already
                Err(Error::client_connection("operation cancelled"))
            }
            result = async {
                transport.write_all(data).await?;
                transport.flush().await
            } => result,
        };
        if result.is_err() {
            self.state = ConnState::Closed;
        }
        result
    }

    /// Next protocol message, with ParameterStatus and LogMessage handled
    /// in place.
    async fn next_message(&mut self, cancel: &CancellationToken) -> Result<ServerMessage> {
        loop {
            let (tag, payload) = self.read_frame(cancel).await?;
            let msg = match ServerMessage::decode(tag, payload) {
                Ok(msg) => msg,
                Err(err) => {
                    self.poison();
                    return Err(err);
                }
            };
            match msg {
                ServerMessage::ParameterStatus { name, value } => {
                    trace!(name = %name, value = %value, "parameter status");
                    self.server_params.insert(name, value);
                }
                ServerMessage::LogMessage { severity, text } => {
                    debug!(severity, message = %text, "server log");
                }
                other => return Ok(other),
            }
        }
    }

    async fn read_frame(&mut self, cancel: &CancellationToken) -> Result<(u8, Bytes)> {
        loop {
            if self.read_buf.len() >= 5 {
                let tag = self.read_buf[0];
                let len = u32::from_be_bytes([
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                    self.read_buf[4],
                ]) as usize;
                if len < 4 || len > MAX_FRAME_SIZE {
                    self.poison();
                    return Err(Error::protocol(format!(
                        "invalid frame length {} for tag {:?}",
                        len, tag as char
                    )));
                }
                let total = 1 + len;
                if self.read_buf.len() >= total {
                    let mut frame = self.read_buf.split_to(total);
                    frame.advance(5);
                    return Ok((tag, frame.freeze()));
                }
            }

            let transport = &mut self.transport;
            let buf = &mut self.read_buf;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(Error::client_connection("operation cancelled"))
                }
                n = transport.read_buf(buf) => match n {
                    Ok(0) => Err(Error::client_connection("server closed the connection")),
                    Ok(n) => Ok(n),
                    Err(err) => Err(err),
                },
            };
            if let Err(err) = outcome {
                self.state = ConnState::Closed;
                return Err(err);
            }
        }
    }
}

/// Leading-keyword classification of transaction control statements.
/// Skips whitespace and `#` line comments first.
pub(crate) fn is_transaction_control(query: &str) -> bool {
    let mut rest = query;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('#') {
            match after.find('\n') {
                Some(nl) => rest = &after[nl + 1..],
                None => return false,
            }
        } else {
            break;
        }
    }
    let lowered = rest.to_ascii_lowercase();
    let mut words = lowered.split_whitespace();
    match words.next() {
        Some("start") => matches!(words.next(), Some("transaction")),
        Some("commit") | Some("rollback") => true,
        _ => false,
    }
}
