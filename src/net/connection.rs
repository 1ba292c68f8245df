//! Per-connection handle: identity, negotiated version and exchange routing.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Route decoded codec events to the right exchange
//! - Start exchanges in receipt order (HTTP/1.1) or per stream (HTTP/2, HTTP/3)
//! - Enforce the pipelining limit
//! - Flush each exchange's outbound buffer to the channel writer

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::ExchangeError;
use crate::exchange::{
    ChannelWriter, ExchangeContext, ExchangeEvent, ExchangeKey, ExchangeNotice, StreamId,
    WriteCommand,
};
use crate::net::tls::TlsContext;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Negotiated HTTP version of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http11,
    Http2,
    Http3,
}

impl HttpVersion {
    /// Parse the configuration spelling ("1.1", "2.0", "3.0").
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1.1" => Some(HttpVersion::Http11),
            "2.0" => Some(HttpVersion::Http2),
            "3.0" => Some(HttpVersion::Http3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http11 => "1.1",
            HttpVersion::Http2 => "2.0",
            HttpVersion::Http3 => "3.0",
        }
    }

    /// Streams are multiplexed and addressed by id.
    pub fn is_multiplexed(self) -> bool {
        !matches!(self, HttpVersion::Http11)
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded event from the protocol codec.
///
/// `stream_id` is `None` on HTTP/1.1 connections, where body chunks and
/// resets address the newest live exchange. An `IdleTimeoutFired` without a
/// stream id is a connection-level timeout.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecEvent {
    HeadersReceived {
        stream_id: Option<StreamId>,
        headers: HeaderMap,
        end_of_stream: bool,
    },
    BodyChunkReceived {
        stream_id: Option<StreamId>,
        chunk: Bytes,
        is_last: bool,
    },
    StreamReset {
        stream_id: Option<StreamId>,
        cause: String,
    },
    IdleTimeoutFired {
        stream_id: Option<StreamId>,
        writable: bool,
    },
    ConnectionClosed {
        cause: String,
    },
}

#[derive(Debug)]
enum Exchanges {
    /// Receipt order; the back is the newest.
    Serial(VecDeque<ExchangeContext>),
    Multiplexed {
        streams: HashMap<StreamId, ExchangeContext>,
        highest: Option<StreamId>,
    },
}

/// State of one accepted (or dialed) connection.
///
/// Owned by the task that drives the connection; nothing here is shared.
pub struct ConnectionHandle {
    id: ConnectionId,
    version: HttpVersion,
    tls: Option<Arc<TlsContext>>,
    idle_timeout: Duration,
    last_activity: Instant,
    exchanges: Exchanges,
    pipelining_limit: Option<usize>,
    next_sequence: u64,
    closed: bool,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("tls", &self.tls.is_some())
            .field("live_exchanges", &self.live_exchanges())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(
        version: HttpVersion,
        tls: Option<Arc<TlsContext>>,
        idle_timeout: Duration,
        now: Instant,
    ) -> Self {
        let exchanges = if version.is_multiplexed() {
            Exchanges::Multiplexed {
                streams: HashMap::new(),
                highest: None,
            }
        } else {
            Exchanges::Serial(VecDeque::new())
        };
        Self {
            id: ConnectionId::new(),
            version,
            tls,
            idle_timeout,
            last_activity: now,
            exchanges,
            pipelining_limit: None,
            next_sequence: 0,
            closed: false,
        }
    }

    /// Allow up to `limit` in-flight exchanges on an HTTP/1.1 connection.
    pub fn with_pipelining(mut self, limit: usize) -> Self {
        if !self.version.is_multiplexed() {
            self.pipelining_limit = Some(limit.max(1));
        }
        self
    }

    /// Reuse the id the channel was registered under.
    pub fn with_id(mut self, id: ConnectionId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn tls(&self) -> Option<&Arc<TlsContext>> {
        self.tls.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Exchanges not yet in a terminal state.
    pub fn live_exchanges(&self) -> usize {
        match &self.exchanges {
            Exchanges::Serial(queue) => queue.iter().filter(|c| !c.is_terminal()).count(),
            Exchanges::Multiplexed { streams, .. } => {
                streams.values().filter(|c| !c.is_terminal()).count()
            }
        }
    }

    /// Idle, open, and fit to be handed out again by a client pool.
    pub fn is_reusable(&self) -> bool {
        !self.closed && self.live_exchanges() == 0
    }

    /// Earliest instant at which `poll_timeouts` has work to do.
    pub fn next_deadline(&self) -> Instant {
        let connection = self.last_activity + self.idle_timeout;
        self.contexts()
            .filter(|c| !c.is_terminal())
            .map(ExchangeContext::deadline)
            .fold(connection, Instant::min)
    }

    /// Route one decoded event.
    pub fn on_codec_event(
        &mut self,
        event: CodecEvent,
        now: Instant,
        out: &mut dyn ChannelWriter,
    ) -> Vec<ExchangeNotice> {
        if self.closed {
            tracing::debug!(connection_id = %self.id, "Event on closed connection, dropping");
            return Vec::new();
        }
        self.last_activity = now;

        match event {
            CodecEvent::HeadersReceived {
                stream_id,
                headers,
                end_of_stream,
            } => self.on_headers(
                stream_id,
                ExchangeEvent::InboundHeaders {
                    headers,
                    end_of_stream,
                },
                now,
                out,
            ),
            CodecEvent::BodyChunkReceived {
                stream_id,
                chunk,
                is_last,
            } => {
                let key = match stream_id {
                    Some(id) => Some(ExchangeKey::Stream(id)),
                    None => self.newest_live_key(),
                };
                match key {
                    Some(key) => {
                        self.dispatch(key, ExchangeEvent::InboundBody { chunk, is_last }, now, out)
                    }
                    None => {
                        tracing::warn!(connection_id = %self.id, "Body chunk without an exchange, dropping");
                        Vec::new()
                    }
                }
            }
            CodecEvent::StreamReset { stream_id, cause } => {
                let key = match stream_id {
                    Some(id) => Some(ExchangeKey::Stream(id)),
                    None => self.newest_live_key(),
                };
                match key {
                    Some(key) => self.dispatch(
                        key,
                        ExchangeEvent::AbruptClosure {
                            error: ExchangeError::StreamReset(cause),
                        },
                        now,
                        out,
                    ),
                    None => {
                        tracing::debug!(connection_id = %self.id, cause = %cause, "Reset without an exchange, dropping");
                        Vec::new()
                    }
                }
            }
            CodecEvent::IdleTimeoutFired {
                stream_id: Some(id),
                writable,
            } => self.dispatch(
                ExchangeKey::Stream(id),
                ExchangeEvent::StreamTimeout { writable },
                now,
                out,
            ),
            CodecEvent::IdleTimeoutFired {
                stream_id: None,
                writable,
            } => {
                tracing::debug!(connection_id = %self.id, "Connection idle timeout");
                let notices = if self.version.is_multiplexed() {
                    self.fail_all(
                        ExchangeError::AbruptClosure("connection idle timeout".into()),
                        now,
                        out,
                    )
                } else {
                    self.time_out_all(writable, now, out)
                };
                self.close(out);
                notices
            }
            CodecEvent::ConnectionClosed { cause } => {
                tracing::debug!(connection_id = %self.id, cause = %cause, "Connection closed by peer");
                let notices = self.fail_all(ExchangeError::AbruptClosure(cause), now, &mut Vec::<WriteCommand>::new());
                self.closed = true;
                notices
            }
        }
    }

    /// Ask for an interim `100 Continue` on `key`.
    pub fn send_continue(
        &mut self,
        key: ExchangeKey,
        now: Instant,
        out: &mut dyn ChannelWriter,
    ) -> Vec<ExchangeNotice> {
        self.dispatch(key, ExchangeEvent::OutboundContinue, now, out)
    }

    pub fn send_headers(
        &mut self,
        key: ExchangeKey,
        status: StatusCode,
        headers: HeaderMap,
        now: Instant,
        out: &mut dyn ChannelWriter,
    ) -> Vec<ExchangeNotice> {
        self.dispatch(key, ExchangeEvent::OutboundHeaders { status, headers }, now, out)
    }

    pub fn send_body(
        &mut self,
        key: ExchangeKey,
        chunk: Bytes,
        is_last: bool,
        now: Instant,
        out: &mut dyn ChannelWriter,
    ) -> Vec<ExchangeNotice> {
        self.dispatch(key, ExchangeEvent::OutboundBody { chunk, is_last }, now, out)
    }

    /// Fire stream timeouts that are due and close the connection when it has
    /// sat idle with no exchanges past its idle timeout.
    pub fn poll_timeouts(&mut self, now: Instant, out: &mut dyn ChannelWriter) -> Vec<ExchangeNotice> {
        if self.closed {
            return Vec::new();
        }
        let due: Vec<ExchangeKey> = self
            .contexts()
            .filter(|c| !c.is_terminal() && c.deadline() <= now)
            .map(ExchangeContext::key)
            .collect();

        let mut notices = Vec::new();
        for key in due {
            notices.extend(self.dispatch(key, ExchangeEvent::StreamTimeout { writable: true }, now, out));
        }

        if self.live_exchanges() == 0 && self.last_activity + self.idle_timeout <= now {
            tracing::debug!(connection_id = %self.id, "Idle connection expired");
            self.close(out);
        }
        notices
    }

    fn on_headers(
        &mut self,
        stream_id: Option<StreamId>,
        event: ExchangeEvent,
        now: Instant,
        out: &mut dyn ChannelWriter,
    ) -> Vec<ExchangeNotice> {
        let version = self.version;
        let idle_timeout = self.idle_timeout;

        match (&mut self.exchanges, stream_id) {
            (Exchanges::Multiplexed { streams, highest }, Some(id)) => {
                if !streams.contains_key(&id) {
                    if highest.is_some_and(|h| id <= h) {
                        tracing::debug!(connection_id = %self.id, stream = %id, "Headers for retired stream, dropping");
                        return Vec::new();
                    }
                    *highest = Some(id);
                    streams.insert(
                        id,
                        ExchangeContext::new(ExchangeKey::Stream(id), version, idle_timeout, now),
                    );
                }
                self.dispatch(ExchangeKey::Stream(id), event, now, out)
            }
            (Exchanges::Multiplexed { .. }, None) => {
                tracing::warn!(connection_id = %self.id, "Headers without stream id on multiplexed connection, dropping");
                Vec::new()
            }
            (Exchanges::Serial(queue), _) => {
                let live = queue.iter().filter(|c| !c.is_terminal()).count();
                let back_reading = queue
                    .back()
                    .is_some_and(|c| !c.is_terminal() && c.state().accepts_inbound());

                if back_reading || (live > 0 && self.pipelining_limit.is_none()) {
                    // Trailers, or an out-of-turn request the exchange will reject.
                    let key = queue.back().map(ExchangeContext::key);
                    return match key {
                        Some(key) => self.dispatch(key, event, now, out),
                        None => Vec::new(),
                    };
                }

                if let Some(limit) = self.pipelining_limit {
                    if live >= limit {
                        tracing::warn!(
                            connection_id = %self.id,
                            in_flight = live,
                            limit,
                            "Pipelining limit exceeded, closing connection"
                        );
                        let notices = self.fail_all(
                            ExchangeError::AbruptClosure("pipelining limit exceeded".into()),
                            now,
                            &mut Vec::<WriteCommand>::new(),
                        );
                        self.close(out);
                        return notices;
                    }
                }

                let key = ExchangeKey::Sequence(self.next_sequence);
                self.next_sequence += 1;
                queue.push_back(ExchangeContext::new(key, version, idle_timeout, now));
                self.dispatch(key, event, now, out)
            }
        }
    }

    fn dispatch(
        &mut self,
        key: ExchangeKey,
        event: ExchangeEvent,
        now: Instant,
        out: &mut dyn ChannelWriter,
    ) -> Vec<ExchangeNotice> {
        let id = self.id;
        let Some(ctx) = self.context_mut(key) else {
            tracing::warn!(connection_id = %id, exchange = %key, event = event.kind(), "Unknown exchange, dropping");
            return Vec::new();
        };

        let notices = ctx.handle(event, now);
        for command in ctx.drain_outbound() {
            out.write(command);
        }
        self.prune();
        notices
    }

    fn time_out_all(&mut self, writable: bool, now: Instant, out: &mut dyn ChannelWriter) -> Vec<ExchangeNotice> {
        let keys = self.live_keys();
        let mut notices = Vec::new();
        for key in keys {
            notices.extend(self.dispatch(key, ExchangeEvent::StreamTimeout { writable }, now, out));
        }
        notices
    }

    fn fail_all(&mut self, error: ExchangeError, now: Instant, out: &mut dyn ChannelWriter) -> Vec<ExchangeNotice> {
        let keys = self.live_keys();
        let mut notices = Vec::new();
        for key in keys {
            notices.extend(self.dispatch(
                key,
                ExchangeEvent::AbruptClosure {
                    error: error.clone(),
                },
                now,
                out,
            ));
        }
        notices
    }

    fn close(&mut self, out: &mut dyn ChannelWriter) {
        if !self.closed {
            self.closed = true;
            out.write(WriteCommand::Close);
        }
    }

    fn contexts(&self) -> Box<dyn Iterator<Item = &ExchangeContext> + '_> {
        match &self.exchanges {
            Exchanges::Serial(queue) => Box::new(queue.iter()),
            Exchanges::Multiplexed { streams, .. } => Box::new(streams.values()),
        }
    }

    fn context_mut(&mut self, key: ExchangeKey) -> Option<&mut ExchangeContext> {
        match (&mut self.exchanges, key) {
            (Exchanges::Serial(queue), ExchangeKey::Sequence(_)) => {
                queue.iter_mut().find(|c| c.key() == key)
            }
            (Exchanges::Multiplexed { streams, .. }, ExchangeKey::Stream(id)) => streams.get_mut(&id),
            _ => None,
        }
    }

    fn live_keys(&self) -> Vec<ExchangeKey> {
        self.contexts()
            .filter(|c| !c.is_terminal())
            .map(ExchangeContext::key)
            .collect()
    }

    fn newest_live_key(&self) -> Option<ExchangeKey> {
        match &self.exchanges {
            Exchanges::Serial(queue) => queue.back().filter(|c| !c.is_terminal()).map(ExchangeContext::key),
            Exchanges::Multiplexed { .. } => None,
        }
    }

    fn prune(&mut self) {
        match &mut self.exchanges {
            Exchanges::Serial(queue) => queue.retain(|c| !c.is_terminal()),
            Exchanges::Multiplexed { streams, .. } => streams.retain(|_, c| !c.is_terminal()),
        }
    }
}
