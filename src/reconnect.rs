//! Reconnecting wrapper.
//!
//! Turns transient transport failures into transparent redials. When an
//! operation observes a connection-level or fatal protocol error the
//! underlying connection is discarded; the next operation redials with
//! exponential backoff bounded by `wait_until_available`. The operation
//! that observed the failure still fails — retrying whole operations is
//! the transactable layer's job.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::CodecContext;
use crate::config::ConnConfig;
use crate::connection::{ConnState, Connection, QueryRequest};
use crate::errors::{Error, ErrorCode, Result};
use crate::value::Value;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Exponential backoff with ±20 % jitter: `base · 2^attempt`, capped.
pub(crate) fn jittered_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    exp.mul_f64(jitter)
}

/// True for failures that invalidate the session and warrant a redial.
fn is_fatal(err: &Error) -> bool {
    err.is(ErrorCode::CLIENT_CONNECTION) || err.is(ErrorCode::PROTOCOL)
}

#[derive(Debug)]
pub struct ReconnConn {
    config: ConnConfig,
    codec_ctx: CodecContext,
    conn: Option<Connection>,
}

impl ReconnConn {
    /// No I/O happens here; the first operation dials.
    pub fn new(config: ConnConfig, codec_ctx: CodecContext) -> Self {
        Self {
            config,
            codec_ctx,
            conn: None,
        }
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Lifecycle state as seen through the wrapper.
    pub fn state(&self) -> ConnState {
        match &self.conn {
            Some(conn) => conn.state(),
            None => ConnState::Closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_usable())
    }

    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.conn.as_ref().and_then(|c| c.server_parameter(name))
    }

    /// Dial (or redial) until usable, bounded by `wait_until_available`.
    pub async fn ensure_connected(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<&mut Connection> {
        let usable = self.conn.as_ref().is_some_and(|c| c.is_usable());
        if !usable {
            self.conn = None;
            let deadline = Instant::now() + self.config.wait_until_available;
            let mut attempt: u32 = 0;
            loop {
                match Connection::connect(self.config.clone(), self.codec_ctx.clone(), cancel)
                    .await
                {
                    Ok(conn) => {
                        if attempt > 0 {
                            debug!(attempt, "reconnected");
                        }
                        self.conn = Some(conn);
                        break;
                    }
                    Err(err) if err.is(ErrorCode::CLIENT_CONNECTION) => {
                        let delay = jittered_backoff(attempt);
                        if Instant::now() + delay >= deadline {
                            return Err(err);
                        }
                        warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64,
                            "connection attempt failed, backing off");
                        attempt += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(Error::client_connection("connect cancelled"));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(self.conn.as_mut().expect("connection established"))
    }

    /// Run a query, discarding the session on fatal failures so the next
    /// call redials.
    pub async fn run_query(
        &mut self,
        req: &QueryRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let conn = self.ensure_connected(cancel).await?;
        let result = conn.run_query(req, cancel).await;
        if let Err(err) = &result {
            if is_fatal(err) {
                debug!(error = %err, "discarding broken connection");
                self.conn = None;
            }
        }
        result
    }

    pub async fn close(&mut self, cancel: &CancellationToken) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            conn.close(cancel).await?;
        }
        Ok(())
    }

    /// Drop the session without closing handshakes; used when the state
    /// is indeterminate.
    pub fn discard(&mut self) {
        self.conn = None;
    }
}
