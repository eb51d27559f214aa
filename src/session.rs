//! Session state machine (C7): drives one client connection through
//! handshake, auth, and the query/result loop, orchestrating the injection
//! queue (C6) and the pool/registry (C5/C4) on every query.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{info, instrument, warn};

use crate::backend::{BackendRegistry, Role};
use crate::error::{BackendError, ProxyError, Result, WireError};
use crate::injection::{Injection, InjectionQueue};
use crate::packet::NetworkPacket;
use crate::protocol::asn1;
use crate::protocol::mysql::{self, RawFrameCodec, RawPacket};
use crate::script::{
    AuthDecision, ConnectDecision, QueryDecision, ResultDecision, ResultSetView, ScriptHost,
    SessionContext,
};

/// States named exactly as §4.7 lists them; the loop from `ReadQuery`
/// through `SendQueryResult` repeats for every query on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accept,
    SendHandshake,
    ReadAuth,
    SendAuthResult,
    ReadQuery,
    SendQuery,
    ReadQueryResult,
    SendQueryResult,
    CloseClient,
    Error,
}

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

const SERVER_CAPABILITIES: u32 = mysql::CLIENT_PROTOCOL_41
    | mysql::CLIENT_SECURE_CONNECTION
    | mysql::CLIENT_PLUGIN_AUTH
    | mysql::CLIENT_DEPRECATE_EOF;

/// The GSSAPI plugin name a handshake response may carry, whose auth
/// response payload is a SPNEGO token validated with C3 before forwarding.
const GSSAPI_PLUGIN: &str = "auth_gssapi_client";

pub struct Session<H: ScriptHost> {
    id: u32,
    client: Framed<TcpStream, RawFrameCodec>,
    registry: Arc<BackendRegistry>,
    script_host: Arc<H>,
    injections: InjectionQueue,
    state: SessionState,
    identity: Option<String>,
    client_capabilities: u32,
}

impl<H: ScriptHost> Session<H> {
    pub fn new(client_socket: TcpStream, registry: Arc<BackendRegistry>, script_host: Arc<H>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client: Framed::new(client_socket, RawFrameCodec),
            registry,
            script_host,
            injections: InjectionQueue::new(),
            state: SessionState::Accept,
            identity: None,
            client_capabilities: 0,
        }
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id as u64,
            identity: self.identity.clone(),
        }
    }

    #[instrument(skip(self), fields(session_id = self.id))]
    pub async fn run(mut self) -> Result<()> {
        let decision = self.script_host.on_connect(&self.context()).await;
        if decision == ConnectDecision::Reject {
            info!("script host rejected connection");
            self.state = SessionState::CloseClient;
            return Ok(());
        }

        self.state = SessionState::SendHandshake;
        if let Err(e) = self.send_handshake().await {
            warn!(error = %e, "failed sending handshake");
            self.state = SessionState::Error;
            return Err(e);
        }

        self.state = SessionState::ReadAuth;
        match self.read_auth().await {
            Ok(true) => {}
            Ok(false) => {
                self.state = SessionState::CloseClient;
                return Ok(());
            }
            Err(e) => {
                self.state = SessionState::Error;
                return Err(e);
            }
        }

        self.state = SessionState::ReadQuery;
        loop {
            match self.read_query_cycle().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "session ended with error");
                    self.state = SessionState::Error;
                    return Err(e);
                }
            }
        }

        self.state = SessionState::CloseClient;
        self.script_host.on_disconnect(&self.context()).await;
        Ok(())
    }

    async fn send_handshake(&mut self) -> Result<()> {
        let handshake = mysql::HandshakeV10 {
            sequence_id: 0,
            protocol_version: 10,
            server_version: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")).to_string(),
            connection_id: self.id,
            auth_plugin_data_part1: *b"12345678",
            capability_flags: SERVER_CAPABILITIES,
            character_set: 33,
            status_flags: 0x0002,
            auth_plugin_data_part2: b"123456789012".to_vec(),
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        let encoded = mysql::encode_handshake_v10(&handshake);
        self.send_raw(handshake.sequence_id, encoded).await
    }

    /// Returns `Ok(true)` on successful auth, `Ok(false)` if the script host
    /// or SPNEGO validation denied the client (session should close
    /// quietly), `Err` on a wire-level failure.
    async fn read_auth(&mut self) -> Result<bool> {
        let raw = self.recv_raw().await?;
        let response = mysql::decode_auth_response(&raw.payload, raw.sequence_id)?;
        self.client_capabilities = response.capability_flags;

        if response.auth_plugin_name.as_deref() == Some(GSSAPI_PLUGIN) {
            let mut view = NetworkPacket::new(&response.auth_response);
            if asn1::validate(&mut view).is_err() {
                warn!("SPNEGO token failed ASN.1 validation");
                self.send_auth_error(1045, "access denied: malformed SPNEGO token")
                    .await?;
                return Ok(false);
            }
        }

        self.identity = Some(response.username.clone());

        let decision = self
            .script_host
            .on_auth(&self.context(), &response.username)
            .await;
        match decision {
            AuthDecision::Reject => {
                self.send_auth_error(1045, "access denied").await?;
                Ok(false)
            }
            AuthDecision::Accept | AuthDecision::Fallthrough => {
                self.state = SessionState::SendAuthResult;
                let ok = mysql::OkPacket {
                    sequence_id: response.sequence_id + 1,
                    affected_rows: 0,
                    last_insert_id: 0,
                    status_flags: 0x0002,
                    warnings: 0,
                    info: Bytes::new(),
                };
                let encoded = mysql::encode_ok(&ok, self.client_capabilities);
                self.send_raw(ok.sequence_id, encoded).await?;
                Ok(true)
            }
        }
    }

    async fn send_auth_error(&mut self, code: u16, message: &str) -> Result<()> {
        let err = mysql::ErrPacket {
            sequence_id: 2,
            error_code: code,
            sql_state: *b"28000",
            error_message: message.to_string(),
        };
        let encoded = mysql::encode_err(&err, self.client_capabilities);
        self.send_raw(err.sequence_id, encoded).await
    }

    /// One full query cycle: read the client's query (or the next injected
    /// one), route it upstream, relay the response. Returns `Ok(true)` to
    /// keep looping, `Ok(false)` when the client disconnected cleanly.
    async fn read_query_cycle(&mut self) -> Result<bool> {
        self.state = SessionState::ReadQuery;
        let raw = match self.client.next().await {
            Some(frame) => frame.map_err(ProxyError::Io)?,
            None => return Ok(false),
        };
        let client_query = mysql::decode_query(&raw.payload, raw.sequence_id)?;

        let mut routing = Role::ReadWrite;
        let decision = self
            .script_host
            .on_read_query(&self.context(), &client_query.query, &mut self.injections, &mut routing)
            .await;
        if decision == QueryDecision::ShortCircuit {
            return Ok(true);
        }

        // Drain the injection queue ahead of the client's own query, per
        // §4.6: each injected query runs to completion before the next one
        // (including the client's original query) is attempted. The routing
        // preference set by this cycle's callback applies to every query
        // sent upstream in the cycle, injected or not.
        while let Some(injection) = self.injections.pop_front() {
            self.run_one_query(injection.query.clone(), Some(&injection), routing)
                .await?;
        }

        self.run_one_query(client_query.query, None, routing).await?;
        Ok(true)
    }

    async fn run_one_query(
        &mut self,
        query: Bytes,
        injection: Option<&Injection>,
        role: Role,
    ) -> Result<()> {
        self.state = SessionState::SendQuery;
        let identity = self.identity.clone().unwrap_or_default();

        let mut upstream = self.acquire_upstream(&identity, role).await?;

        let packet = mysql::QueryPacket {
            sequence_id: 0,
            query: query.clone(),
        };
        let encoded = mysql::encode_query(&packet);
        upstream.write_frame(packet.sequence_id, encoded).await?;

        self.state = SessionState::ReadQueryResult;
        let outcome = self.relay_result(&mut upstream, injection).await;

        match outcome {
            Ok(()) => {
                upstream.release(&identity);
            }
            Err(e) => {
                upstream.mark_down_and_drop();
                return Err(e);
            }
        }

        Ok(())
    }

    /// Reads one upstream response in full (OK/ERR, or a result set of
    /// column defs, an EOF, rows, and a terminating EOF/OK), then decides
    /// whether to relay it to the client. Only the client's own query
    /// (`injection.is_none()`) is ever eligible for forwarding — an
    /// injected query's result is never visible to the client regardless of
    /// `resultset_is_needed` (§8 scenario 7); that flag governs only whether
    /// the result is buffered for `on_read_query_result` inspection or
    /// discarded unexamined. The client's own result is always inspected,
    /// and the callback's `forward`/`swallow` decision is honored before
    /// anything is sent, so a swallowed result never reaches the wire.
    async fn relay_result(
        &mut self,
        upstream: &mut UpstreamHandle,
        injection: Option<&Injection>,
    ) -> Result<()> {
        let is_client_query = injection.is_none();
        let needs_inspection = injection.map(|i| i.resultset_is_needed).unwrap_or(true);

        let first = upstream.recv_raw().await?;

        if first.payload.first().copied() == Some(0x00) {
            let ok = mysql::decode_ok(&first.payload, first.sequence_id, self.client_capabilities)?;
            let decision = self.inspect_result(needs_inspection, ResultSetView::default()).await;
            if is_client_query && decision == ResultDecision::Forward {
                self.forward_ok(&ok).await?;
            }
            return Ok(());
        }
        if first.payload.first().copied() == Some(0xff) {
            let err = mysql::decode_err(&first.payload, first.sequence_id, self.client_capabilities)?;
            let decision = self.inspect_result(needs_inspection, ResultSetView::default()).await;
            if is_client_query && decision == ResultDecision::Forward {
                self.forward_err(&err).await?;
            }
            return Ok(());
        }

        let column_count = read_column_count(&first.payload)?;

        let mut fields = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let raw = upstream.recv_raw().await?;
            fields.push(mysql::decode_column_defs(&raw.payload, raw.sequence_id)?);
        }

        let fields_eof = if self.client_capabilities & mysql::CLIENT_DEPRECATE_EOF == 0 {
            let raw = upstream.recv_raw().await?;
            Some(mysql::decode_eof(&raw.payload, raw.sequence_id)?)
        } else {
            None
        };

        let mut rows = Vec::new();
        let terminal_eof;
        loop {
            let raw = upstream.recv_raw().await?;
            if raw.payload.first().copied() == Some(0xfe) && raw.payload.len() < 9 {
                terminal_eof = mysql::decode_eof(&raw.payload, raw.sequence_id)?;
                break;
            }
            rows.push(mysql::decode_row(&raw.payload, raw.sequence_id, column_count)?);
        }

        let resultset = ResultSetView { fields: Some(fields.clone()) };
        let decision = self.inspect_result(needs_inspection, resultset).await;

        if is_client_query && decision == ResultDecision::Forward {
            for col in &fields {
                self.forward_column_def(col).await?;
            }
            if let Some(eof) = &fields_eof {
                self.forward_eof(eof).await?;
            }
            for row in &rows {
                self.forward_row(row).await?;
            }
            self.forward_eof(&terminal_eof).await?;
        }

        self.state = SessionState::SendQueryResult;
        Ok(())
    }

    /// Runs the script host's `on_read_query_result` when the result needs
    /// inspection, defaulting to `Forward` otherwise (an injected query
    /// with `resultset_is_needed=false` has nothing worth handing the host).
    async fn inspect_result(&self, needs_inspection: bool, resultset: ResultSetView) -> ResultDecision {
        if !needs_inspection {
            return ResultDecision::Forward;
        }
        self.script_host.on_read_query_result(&self.context(), &resultset).await
    }

    async fn forward_ok(&mut self, ok: &mysql::OkPacket) -> Result<()> {
        let encoded = mysql::encode_ok(ok, self.client_capabilities);
        self.send_raw(ok.sequence_id, encoded).await
    }

    async fn forward_err(&mut self, err: &mysql::ErrPacket) -> Result<()> {
        let encoded = mysql::encode_err(err, self.client_capabilities);
        self.send_raw(err.sequence_id, encoded).await
    }

    async fn forward_eof(&mut self, eof: &mysql::EofPacket) -> Result<()> {
        let encoded = mysql::encode_eof(eof);
        self.send_raw(eof.sequence_id, encoded).await
    }

    async fn forward_column_def(&mut self, col: &mysql::ColumnDefinition) -> Result<()> {
        let encoded = mysql::encode_column_defs(col);
        self.send_raw(col.sequence_id, encoded).await
    }

    async fn forward_row(&mut self, row: &mysql::ResultRow) -> Result<()> {
        let encoded = mysql::encode_row(row);
        self.send_raw(row.sequence_id, encoded).await
    }

    async fn acquire_upstream(&self, identity: &str, role: Role) -> Result<UpstreamHandle> {
        self.registry.check();

        let index = self
            .registry
            .pick(role)
            .ok_or(BackendError::NotFound(0))?;

        // Try the chosen backend's own idle pool first (its sockets are
        // already authenticated as `identity`); only dial fresh on a miss.
        let pooled = self
            .registry
            .with_backend(index, |b| b.pool.get(identity).map(|g| g.into_socket_without_pooling()))?;

        let stream = match pooled {
            Some(socket) => socket,
            None => {
                let address = self.registry.with_backend(index, |b| b.address.clone())?;
                TcpStream::connect(address.as_str()).await.map_err(ProxyError::Io)?
            }
        };

        Ok(UpstreamHandle {
            stream: Framed::new(stream, RawFrameCodec),
            backend_index: index,
            registry: self.registry.clone(),
        })
    }
}

fn read_column_count(payload: &[u8]) -> Result<usize> {
    if payload.is_empty() {
        return Err(WireError::Eof("result set column count").into());
    }
    // Column count is the only lenenc int that can legally appear as a bare
    // result-set header in the command phase (OK/ERR/EOF markers are
    // checked by the caller before reaching here).
    let first = payload[0];
    match first {
        0..=0xfa => Ok(first as usize),
        _ => Err(WireError::Unsupported("extended column count encoding").into()),
    }
}

/// Owns one upstream socket for the duration of a single query cycle. Not
/// pool-backed directly (the pool holds idle `TcpStream`s; this wraps the
/// live `Framed` reader/writer around one checked-out or freshly dialed
/// socket) so relaying can use the same raw-frame codec as the client side.
struct UpstreamHandle {
    stream: Framed<TcpStream, RawFrameCodec>,
    backend_index: usize,
    registry: Arc<BackendRegistry>,
}

impl UpstreamHandle {
    /// Sends one already-`encode_*`d frame (header included); `sequence_id`
    /// must match the header's own sequence byte.
    async fn write_frame(&mut self, sequence_id: u8, framed_bytes: bytes::BytesMut) -> Result<()> {
        self.stream
            .send(RawPacket {
                sequence_id,
                payload: bytes::BytesMut::from(&framed_bytes[4..]),
            })
            .await
            .map_err(ProxyError::Io)
    }

    async fn recv_raw(&mut self) -> Result<RawPacket> {
        match self.stream.next().await {
            Some(frame) => frame.map_err(ProxyError::Io),
            None => Err(WireError::Eof("upstream closed").into()),
        }
    }

    /// Returns the underlying socket to the backend's pool under its
    /// current authenticated identity, per §4.7's "on result completion".
    fn release(self, identity: &str) {
        let identity = identity.to_string();
        let stream = self.stream.into_inner();
        let _ = self.registry.with_backend(self.backend_index, move |b| {
            b.pool.add(stream, identity);
        });
    }

    /// The upstream replied with a fatal protocol error: never pool this
    /// socket, and mark its backend down so routing avoids it until the
    /// health-recovery sweep flips it back to unknown.
    fn mark_down_and_drop(self) {
        let _ = self.registry.with_backend(self.backend_index, |b| {
            b.state = crate::backend::BackendState::Down;
            b.state_since = std::time::Instant::now();
        });
    }
}

impl<H: ScriptHost> Session<H> {
    async fn send_raw(&mut self, sequence_id: u8, bytes: bytes::BytesMut) -> Result<()> {
        self.client
            .send(RawPacket {
                sequence_id,
                payload: bytes::BytesMut::from(&bytes[4..]),
            })
            .await
            .map_err(ProxyError::Io)
    }

    async fn recv_raw(&mut self) -> Result<RawPacket> {
        match self.client.next().await {
            Some(frame) => frame.map_err(ProxyError::Io),
            None => Err(WireError::Eof("client closed").into()),
        }
    }
}
