//! Per-exchange context: identity, current state and outbound buffer.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;

use crate::error::ExchangeError;
use crate::exchange::state::{
    transition, Effect, ExchangeEvent, ExchangeFlags, ListenerState, Outcome,
};
use crate::exchange::writer::WriteCommand;
use crate::net::connection::HttpVersion;
use crate::observability::metrics;

/// HTTP/2 or HTTP/3 stream identifier (62-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub const MAX: u64 = (1 << 62) - 1;

    /// Returns `None` for values outside the 62-bit range.
    pub fn new(id: u64) -> Option<Self> {
        (id <= Self::MAX).then_some(Self(id))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// How an exchange is addressed within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKey {
    /// HTTP/1.1 (and WebSocket) exchanges, numbered in receipt order.
    Sequence(u64),
    /// Multiplexed streams.
    Stream(StreamId),
}

impl ExchangeKey {
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            ExchangeKey::Stream(id) => Some(*id),
            ExchangeKey::Sequence(_) => None,
        }
    }
}

impl fmt::Display for ExchangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKey::Sequence(n) => write!(f, "exchange-{}", n),
            ExchangeKey::Stream(id) => id.fmt(f),
        }
    }
}

/// What the application learns about an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeNotice {
    RequestHeaders {
        key: ExchangeKey,
        headers: HeaderMap,
        end_of_stream: bool,
        expects_continue: bool,
    },
    RequestBody {
        key: ExchangeKey,
        chunk: Bytes,
        is_last: bool,
    },
    RequestTrailers {
        key: ExchangeKey,
        headers: HeaderMap,
    },
    Completed {
        key: ExchangeKey,
    },
    Failed {
        key: ExchangeKey,
        error: ExchangeError,
    },
}

/// One request/response exchange (or one stream).
#[derive(Debug)]
pub struct ExchangeContext {
    key: ExchangeKey,
    version: HttpVersion,
    state: ListenerState,
    flags: ExchangeFlags,
    outbound: VecDeque<WriteCommand>,
    idle_timeout: Duration,
    last_activity: Instant,
}

impl ExchangeContext {
    pub fn new(key: ExchangeKey, version: HttpVersion, idle_timeout: Duration, now: Instant) -> Self {
        metrics::record_exchange_started(version);
        Self {
            key,
            version,
            state: ListenerState::AwaitingRequestHeaders,
            flags: ExchangeFlags::default(),
            outbound: VecDeque::new(),
            idle_timeout,
            last_activity: now,
        }
    }

    pub fn key(&self) -> ExchangeKey {
        self.key
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn flags(&self) -> ExchangeFlags {
        self.flags
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Instant after which the stream idle timeout fires.
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.idle_timeout
    }

    /// Apply one event, buffering writes and returning application notices.
    pub fn handle(&mut self, event: ExchangeEvent, now: Instant) -> Vec<ExchangeNotice> {
        let kind = event.kind();
        let t = transition(self.state, self.flags, event);

        match t.outcome {
            Outcome::Rejected => {
                tracing::warn!(
                    exchange = %self.key,
                    state = %self.state,
                    event = kind,
                    "Illegal event for exchange state, dropping"
                );
                metrics::record_protocol_violation(self.state);
                return Vec::new();
            }
            Outcome::Ignored => {
                tracing::debug!(
                    exchange = %self.key,
                    state = %self.state,
                    event = kind,
                    "Event after exchange finished, ignoring"
                );
                return Vec::new();
            }
            Outcome::Applied => {}
        }

        if t.state != self.state {
            tracing::trace!(
                exchange = %self.key,
                from = %self.state,
                to = %t.state,
                event = kind,
                "Exchange state changed"
            );
        }
        if t.state == ListenerState::StreamTimedOut {
            metrics::record_stream_timeout();
        }

        self.state = t.state;
        self.flags = t.flags;
        self.last_activity = now;

        let key = self.key;
        let mut notices = Vec::new();
        for effect in t.effects {
            match effect {
                Effect::DeliverHeaders {
                    headers,
                    end_of_stream,
                } => notices.push(ExchangeNotice::RequestHeaders {
                    key,
                    headers,
                    end_of_stream,
                    expects_continue: self.flags.expects_continue,
                }),
                Effect::DeliverBody { chunk, is_last } => {
                    notices.push(ExchangeNotice::RequestBody { key, chunk, is_last })
                }
                Effect::DeliverTrailers { headers } => {
                    notices.push(ExchangeNotice::RequestTrailers { key, headers })
                }
                Effect::WriteHeaders {
                    status,
                    headers,
                    end_of_stream,
                } => self.outbound.push_back(WriteCommand::Headers {
                    key,
                    status,
                    headers,
                    end_of_stream,
                }),
                Effect::WriteBody { chunk, is_last } => {
                    self.outbound.push_back(WriteCommand::Body { key, chunk, is_last })
                }
                Effect::ResetStream => self.outbound.push_back(WriteCommand::Reset { key }),
                Effect::Completed => notices.push(ExchangeNotice::Completed { key }),
                Effect::Failed(error) => notices.push(ExchangeNotice::Failed { key, error }),
            }
        }
        notices
    }

    /// Take buffered writes in submission order.
    pub fn drain_outbound(&mut self) -> impl Iterator<Item = WriteCommand> + '_ {
        self.outbound.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn ctx() -> ExchangeContext {
        ExchangeContext::new(
            ExchangeKey::Stream(StreamId::new(3).unwrap()),
            HttpVersion::Http2,
            Duration::from_secs(30),
            Instant::now(),
        )
    }

    #[test]
    fn stream_ids_are_62_bit() {
        assert!(StreamId::new(StreamId::MAX).is_some());
        assert!(StreamId::new(StreamId::MAX + 1).is_none());
    }

    #[test]
    fn writes_are_buffered_in_order() {
        let mut ctx = ctx();
        let now = Instant::now();
        ctx.handle(
            ExchangeEvent::InboundHeaders {
                headers: HeaderMap::new(),
                end_of_stream: true,
            },
            now,
        );
        ctx.handle(
            ExchangeEvent::OutboundHeaders {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
            },
            now,
        );
        let notices = ctx.handle(
            ExchangeEvent::OutboundBody {
                chunk: Bytes::from_static(b"hi"),
                is_last: true,
            },
            now,
        );

        let writes: Vec<_> = ctx.drain_outbound().collect();
        assert_eq!(writes.len(), 2);
        assert!(matches!(writes[0], WriteCommand::Headers { .. }));
        assert!(matches!(writes[1], WriteCommand::Body { is_last: true, .. }));
        assert_eq!(notices, vec![ExchangeNotice::Completed { key: ctx.key() }]);
        assert!(ctx.is_terminal());
    }

    #[test]
    fn rejected_event_leaves_nothing_behind() {
        let mut ctx = ctx();
        let before = ctx.deadline();
        let notices = ctx.handle(
            ExchangeEvent::OutboundBody {
                chunk: Bytes::new(),
                is_last: true,
            },
            Instant::now() + Duration::from_secs(5),
        );
        assert!(notices.is_empty());
        assert_eq!(ctx.drain_outbound().count(), 0);
        assert_eq!(ctx.state(), ListenerState::AwaitingRequestHeaders);
        assert_eq!(ctx.deadline(), before);
    }

    #[test]
    fn activity_pushes_the_deadline() {
        let mut ctx = ctx();
        let later = Instant::now() + Duration::from_secs(10);
        ctx.handle(
            ExchangeEvent::InboundHeaders {
                headers: HeaderMap::new(),
                end_of_stream: false,
            },
            later,
        );
        assert_eq!(ctx.deadline(), later + Duration::from_secs(30));
    }
}
