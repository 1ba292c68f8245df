//! Exchange states and the transition function.
//!
//! # State Transitions
//! ```text
//! AwaitingRequestHeaders --headers--> ReceivingEntityBody --last chunk--> AwaitingResponse
//!                        \--headers (end of stream)----------------------/
//! ReceivingEntityBody --100-continue--> Expect100ContinueSent --body--> ReceivingEntityBody
//! Expect100ContinueSent --response headers--> SendingHeaders
//! AwaitingResponse --response headers--> SendingHeaders --chunk--> SendingEntityBody
//! SendingHeaders / SendingEntityBody --last chunk--> ResponseCompleted
//! any non-terminal --timeout--> StreamTimedOut
//! any non-terminal --closure--> AbruptlyClosed
//! ```
//!
//! Events outside a state's legal set leave the exchange untouched and are
//! reported as [`Outcome::Rejected`]; the caller logs and drops them.

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, UPGRADE};
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::error::ExchangeError;

/// Where an exchange is in its request/response lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    AwaitingRequestHeaders,
    ReceivingEntityBody,
    Expect100ContinueSent,
    AwaitingResponse,
    SendingHeaders,
    SendingEntityBody,
    ResponseCompleted,
    StreamTimedOut,
    AbruptlyClosed,
}

impl ListenerState {
    pub const ALL: [ListenerState; 9] = [
        ListenerState::AwaitingRequestHeaders,
        ListenerState::ReceivingEntityBody,
        ListenerState::Expect100ContinueSent,
        ListenerState::AwaitingResponse,
        ListenerState::SendingHeaders,
        ListenerState::SendingEntityBody,
        ListenerState::ResponseCompleted,
        ListenerState::StreamTimedOut,
        ListenerState::AbruptlyClosed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ListenerState::ResponseCompleted
                | ListenerState::StreamTimedOut
                | ListenerState::AbruptlyClosed
        )
    }

    /// Final response headers are already on the wire.
    pub fn response_started(self) -> bool {
        matches!(
            self,
            ListenerState::SendingHeaders
                | ListenerState::SendingEntityBody
                | ListenerState::ResponseCompleted
        )
    }

    /// The request is still being read.
    pub fn accepts_inbound(self) -> bool {
        matches!(
            self,
            ListenerState::AwaitingRequestHeaders
                | ListenerState::ReceivingEntityBody
                | ListenerState::Expect100ContinueSent
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ListenerState::AwaitingRequestHeaders => "awaiting_request_headers",
            ListenerState::ReceivingEntityBody => "receiving_entity_body",
            ListenerState::Expect100ContinueSent => "expect_100_continue_sent",
            ListenerState::AwaitingResponse => "awaiting_response",
            ListenerState::SendingHeaders => "sending_headers",
            ListenerState::SendingEntityBody => "sending_entity_body",
            ListenerState::ResponseCompleted => "response_completed",
            ListenerState::StreamTimedOut => "stream_timed_out",
            ListenerState::AbruptlyClosed => "abruptly_closed",
        }
    }
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-exchange flags carried alongside the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeFlags {
    pub last_content_seen: bool,
    pub expects_continue: bool,
    pub upgraded_to_websocket: bool,
}

/// An inbound (decoded) or outbound (application) event for one exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    InboundHeaders {
        headers: HeaderMap,
        end_of_stream: bool,
    },
    InboundBody {
        chunk: Bytes,
        is_last: bool,
    },
    /// Application asks for an interim `100 Continue`.
    OutboundContinue,
    OutboundHeaders {
        status: StatusCode,
        headers: HeaderMap,
    },
    OutboundBody {
        chunk: Bytes,
        is_last: bool,
    },
    StreamTimeout {
        /// The connection half can still carry a response.
        writable: bool,
    },
    AbruptClosure {
        error: ExchangeError,
    },
}

impl ExchangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeEvent::InboundHeaders { .. } => "inbound_headers",
            ExchangeEvent::InboundBody { .. } => "inbound_body",
            ExchangeEvent::OutboundContinue => "outbound_continue",
            ExchangeEvent::OutboundHeaders { .. } => "outbound_headers",
            ExchangeEvent::OutboundBody { .. } => "outbound_body",
            ExchangeEvent::StreamTimeout { .. } => "stream_timeout",
            ExchangeEvent::AbruptClosure { .. } => "abrupt_closure",
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Hand the request head to the application.
    DeliverHeaders {
        headers: HeaderMap,
        end_of_stream: bool,
    },
    /// Hand a request body chunk to the application.
    DeliverBody { chunk: Bytes, is_last: bool },
    /// Hand HTTP/2 or HTTP/3 trailers to the application.
    DeliverTrailers { headers: HeaderMap },
    WriteHeaders {
        status: StatusCode,
        headers: HeaderMap,
        end_of_stream: bool,
    },
    WriteBody { chunk: Bytes, is_last: bool },
    /// Abort the stream without a response.
    ResetStream,
    Completed,
    Failed(ExchangeError),
}

impl Effect {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Effect::WriteHeaders { .. } | Effect::WriteBody { .. } | Effect::ResetStream
        )
    }
}

/// How the state machine treated an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Not legal in the current state; nothing changed.
    Rejected,
    /// The exchange already reached a terminal state.
    Ignored,
}

/// Result of [`transition`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ListenerState,
    pub flags: ExchangeFlags,
    pub effects: Vec<Effect>,
    pub outcome: Outcome,
}

impl Transition {
    fn applied(state: ListenerState, flags: ExchangeFlags, effects: Vec<Effect>) -> Self {
        Self {
            state,
            flags,
            effects,
            outcome: Outcome::Applied,
        }
    }

    fn unchanged(state: ListenerState, flags: ExchangeFlags, outcome: Outcome) -> Self {
        Self {
            state,
            flags,
            effects: Vec::new(),
            outcome,
        }
    }
}

/// Compute the next state and its effects. Pure.
pub fn transition(state: ListenerState, flags: ExchangeFlags, event: ExchangeEvent) -> Transition {
    use ExchangeEvent as E;
    use ListenerState as S;

    if state.is_terminal() {
        return Transition::unchanged(state, flags, Outcome::Ignored);
    }

    match (state, event) {
        (_, E::StreamTimeout { writable }) => timed_out(state, flags, writable),

        (_, E::AbruptClosure { error }) => {
            Transition::applied(S::AbruptlyClosed, flags, vec![Effect::Failed(error)])
        }

        (S::AwaitingRequestHeaders, E::InboundHeaders { headers, end_of_stream }) => {
            let flags = ExchangeFlags {
                last_content_seen: end_of_stream,
                expects_continue: !end_of_stream && expects_continue(&headers),
                upgraded_to_websocket: is_websocket_upgrade(&headers),
            };
            let next = if end_of_stream {
                S::AwaitingResponse
            } else {
                S::ReceivingEntityBody
            };
            Transition::applied(
                next,
                flags,
                vec![Effect::DeliverHeaders {
                    headers,
                    end_of_stream,
                }],
            )
        }

        (S::ReceivingEntityBody, E::InboundBody { chunk, is_last }) => {
            let flags = ExchangeFlags {
                last_content_seen: is_last,
                ..flags
            };
            let next = if is_last {
                S::AwaitingResponse
            } else {
                S::ReceivingEntityBody
            };
            Transition::applied(next, flags, vec![Effect::DeliverBody { chunk, is_last }])
        }

        // Trailers close the request body on multiplexed streams.
        (
            S::ReceivingEntityBody,
            E::InboundHeaders {
                headers,
                end_of_stream: true,
            },
        ) => {
            let flags = ExchangeFlags {
                last_content_seen: true,
                ..flags
            };
            Transition::applied(
                S::AwaitingResponse,
                flags,
                vec![Effect::DeliverTrailers { headers }],
            )
        }

        (S::ReceivingEntityBody, E::OutboundContinue) if flags.expects_continue => {
            let flags = ExchangeFlags {
                expects_continue: false,
                ..flags
            };
            Transition::applied(
                S::Expect100ContinueSent,
                flags,
                vec![Effect::WriteHeaders {
                    status: StatusCode::CONTINUE,
                    headers: HeaderMap::new(),
                    end_of_stream: false,
                }],
            )
        }

        // The client may send the body without waiting for the interim response.
        (S::Expect100ContinueSent, event @ E::InboundBody { .. }) => {
            transition(S::ReceivingEntityBody, flags, event)
        }

        (S::Expect100ContinueSent | S::AwaitingResponse, E::OutboundHeaders { status, headers }) => {
            Transition::applied(
                S::SendingHeaders,
                flags,
                vec![Effect::WriteHeaders {
                    status,
                    headers,
                    end_of_stream: false,
                }],
            )
        }

        (S::SendingHeaders | S::SendingEntityBody, E::OutboundBody { chunk, is_last }) => {
            if is_last {
                Transition::applied(
                    S::ResponseCompleted,
                    flags,
                    vec![Effect::WriteBody { chunk, is_last }, Effect::Completed],
                )
            } else {
                Transition::applied(
                    S::SendingEntityBody,
                    flags,
                    vec![Effect::WriteBody { chunk, is_last }],
                )
            }
        }

        (state, _) => Transition::unchanged(state, flags, Outcome::Rejected),
    }
}

fn timed_out(state: ListenerState, flags: ExchangeFlags, writable: bool) -> Transition {
    let mut effects = Vec::with_capacity(2);
    if writable {
        if state.response_started() {
            effects.push(Effect::ResetStream);
        } else {
            effects.push(Effect::WriteHeaders {
                status: StatusCode::REQUEST_TIMEOUT,
                headers: request_timeout_headers(),
                end_of_stream: true,
            });
        }
    }
    effects.push(Effect::Failed(ExchangeError::Timeout));
    Transition::applied(ListenerState::StreamTimedOut, flags, effects)
}

fn request_timeout_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers
}

fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use ExchangeEvent as E;
    use ListenerState as S;

    fn headers(end_of_stream: bool) -> E {
        E::InboundHeaders {
            headers: HeaderMap::new(),
            end_of_stream,
        }
    }

    fn continue_headers() -> E {
        let mut headers = HeaderMap::new();
        headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        E::InboundHeaders {
            headers,
            end_of_stream: false,
        }
    }

    fn body(is_last: bool) -> E {
        E::InboundBody {
            chunk: Bytes::from_static(b"data"),
            is_last,
        }
    }

    fn respond() -> E {
        E::OutboundHeaders {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }

    fn out_body(is_last: bool) -> E {
        E::OutboundBody {
            chunk: Bytes::from_static(b"ok"),
            is_last,
        }
    }

    fn run(events: Vec<E>) -> (ListenerState, ExchangeFlags, Vec<Effect>) {
        let mut state = S::AwaitingRequestHeaders;
        let mut flags = ExchangeFlags::default();
        let mut effects = Vec::new();
        for event in events {
            let t = transition(state, flags, event);
            state = t.state;
            flags = t.flags;
            effects.extend(t.effects);
        }
        (state, flags, effects)
    }

    #[test]
    fn simple_get_completes() {
        let (state, _, effects) = run(vec![headers(true), respond(), out_body(true)]);
        assert_eq!(state, S::ResponseCompleted);
        assert_eq!(effects.iter().filter(|e| e.is_write()).count(), 2);
        assert_eq!(effects.last(), Some(&Effect::Completed));
    }

    #[test]
    fn body_is_read_before_responding() {
        let (state, flags, _) = run(vec![headers(false), body(false), body(true)]);
        assert_eq!(state, S::AwaitingResponse);
        assert!(flags.last_content_seen);
    }

    #[test]
    fn streaming_response_passes_through_sending_entity_body() {
        let (state, _, _) = run(vec![headers(true), respond(), out_body(false)]);
        assert_eq!(state, S::SendingEntityBody);
    }

    #[test]
    fn writes_before_request_headers_are_rejected() {
        for event in [respond(), out_body(true), E::OutboundContinue] {
            let t = transition(S::AwaitingRequestHeaders, ExchangeFlags::default(), event);
            assert_eq!(t.outcome, Outcome::Rejected);
            assert_eq!(t.state, S::AwaitingRequestHeaders);
            assert!(t.effects.is_empty());
        }
    }

    #[test]
    fn continue_requires_expect_header() {
        let (state, flags, _) = run(vec![headers(false)]);
        let t = transition(state, flags, E::OutboundContinue);
        assert_eq!(t.outcome, Outcome::Rejected);

        let (state, flags, _) = run(vec![continue_headers()]);
        assert!(flags.expects_continue);
        let t = transition(state, flags, E::OutboundContinue);
        assert_eq!(t.state, S::Expect100ContinueSent);
        assert!(!t.flags.expects_continue);
        assert!(matches!(
            t.effects.as_slice(),
            [Effect::WriteHeaders { status, .. }] if *status == StatusCode::CONTINUE
        ));
    }

    #[test]
    fn body_racing_the_interim_response_is_accepted() {
        let (state, flags, _) = run(vec![continue_headers(), E::OutboundContinue]);
        assert_eq!(state, S::Expect100ContinueSent);

        let t = transition(state, flags, body(false));
        assert_eq!(t.outcome, Outcome::Applied);
        assert_eq!(t.state, S::ReceivingEntityBody);
        assert_eq!(
            t.effects,
            vec![Effect::DeliverBody {
                chunk: Bytes::from_static(b"data"),
                is_last: false,
            }]
        );

        let t = transition(state, flags, body(true));
        assert_eq!(t.state, S::AwaitingResponse);
    }

    #[test]
    fn duplicates_in_continue_sent_are_rejected() {
        let (state, flags, _) = run(vec![continue_headers(), E::OutboundContinue]);
        for event in [headers(false), E::OutboundContinue] {
            let t = transition(state, flags, event);
            assert_eq!(t.outcome, Outcome::Rejected);
            assert_eq!(t.state, S::Expect100ContinueSent);
        }
    }

    #[test]
    fn final_response_after_continue() {
        let (state, _, _) = run(vec![continue_headers(), E::OutboundContinue, respond()]);
        assert_eq!(state, S::SendingHeaders);
    }

    #[test]
    fn trailers_end_the_request() {
        let (state, _, effects) = run(vec![headers(false), body(false), headers(true)]);
        assert_eq!(state, S::AwaitingResponse);
        assert!(matches!(effects.last(), Some(Effect::DeliverTrailers { .. })));
    }

    #[test]
    fn websocket_upgrade_sets_flag() {
        let mut h = HeaderMap::new();
        h.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        let t = transition(
            S::AwaitingRequestHeaders,
            ExchangeFlags::default(),
            E::InboundHeaders {
                headers: h,
                end_of_stream: true,
            },
        );
        assert!(t.flags.upgraded_to_websocket);
    }

    #[test]
    fn timeout_is_universal() {
        for state in S::ALL.into_iter().filter(|s| !s.is_terminal()) {
            let t = transition(state, ExchangeFlags::default(), E::StreamTimeout { writable: true });
            assert_eq!(t.state, S::StreamTimedOut);
            let responses = t
                .effects
                .iter()
                .filter(|e| matches!(e, Effect::WriteHeaders { .. }))
                .count();
            let expected = if state.response_started() { 0 } else { 1 };
            assert_eq!(responses, expected, "state {}", state);

            let t = transition(state, ExchangeFlags::default(), E::StreamTimeout { writable: false });
            assert_eq!(t.state, S::StreamTimedOut);
            assert!(t.effects.iter().all(|e| !e.is_write()), "state {}", state);
        }
    }

    #[test]
    fn timeout_response_is_a_single_408() {
        let t = transition(
            S::AwaitingResponse,
            ExchangeFlags::default(),
            E::StreamTimeout { writable: true },
        );
        let writes: Vec<_> = t.effects.iter().filter(|e| e.is_write()).collect();
        assert_eq!(writes.len(), 1);
        assert!(matches!(
            writes[0],
            Effect::WriteHeaders { status, end_of_stream: true, .. } if *status == StatusCode::REQUEST_TIMEOUT
        ));
    }

    #[test]
    fn closure_is_universal_and_silent() {
        for state in S::ALL.into_iter().filter(|s| !s.is_terminal()) {
            let t = transition(
                state,
                ExchangeFlags::default(),
                E::AbruptClosure {
                    error: ExchangeError::AbruptClosure("reset".into()),
                },
            );
            assert_eq!(t.state, S::AbruptlyClosed);
            assert!(t.effects.iter().all(|e| !e.is_write()));
            assert!(matches!(t.effects.as_slice(), [Effect::Failed(_)]));
        }
    }

    #[test]
    fn terminal_states_ignore_everything() {
        for state in S::ALL.into_iter().filter(|s| s.is_terminal()) {
            for event in [headers(true), body(true), respond(), E::StreamTimeout { writable: true }] {
                let t = transition(state, ExchangeFlags::default(), event);
                assert_eq!(t.outcome, Outcome::Ignored);
                assert_eq!(t.state, state);
                assert!(t.effects.is_empty());
            }
        }
    }

    #[test]
    fn illegal_events_never_write() {
        let events = || {
            vec![
                headers(false),
                headers(true),
                body(false),
                body(true),
                E::OutboundContinue,
                respond(),
                out_body(false),
                out_body(true),
            ]
        };
        for state in S::ALL.into_iter().filter(|s| !s.is_terminal()) {
            for event in events() {
                let t = transition(state, ExchangeFlags::default(), event);
                if t.outcome == Outcome::Rejected {
                    assert_eq!(t.state, state);
                    assert!(t.effects.is_empty());
                }
            }
        }
    }

    #[test]
    fn replay_matches_stepwise_application() {
        let script = vec![
            continue_headers(),
            E::OutboundContinue,
            body(false),
            body(true),
            respond(),
            out_body(false),
            out_body(true),
        ];

        let (replayed, _, replay_effects) = run(script.clone());

        let mut state = S::AwaitingRequestHeaders;
        let mut flags = ExchangeFlags::default();
        let mut step_effects = Vec::new();
        for event in script {
            let t = transition(state, flags, event);
            state = t.state;
            flags = t.flags;
            step_effects.extend(t.effects);
        }

        assert_eq!(replayed, S::ResponseCompleted);
        assert_eq!(replayed, state);
        assert_eq!(replay_effects, step_effects);
    }
}
