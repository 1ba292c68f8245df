//! Reorder buffer keyed by exchange receipt order.

use std::collections::BTreeMap;

use crate::exchange::{ExchangeKey, WriteCommand};

/// Releases write commands in request order.
///
/// Commands for the exchange at the head of the line are released at once;
/// commands for later exchanges wait until every earlier exchange has
/// written its final command.
#[derive(Debug, Default)]
pub struct ResponseSequencer {
    next: u64,
    pending: BTreeMap<u64, Vec<WriteCommand>>,
}

impl ResponseSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the exchange currently allowed on the wire.
    pub fn head(&self) -> u64 {
        self.next
    }

    /// Commands held back for later exchanges.
    pub fn buffered(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Accept one command, returning everything now ready to flush.
    pub fn push(&mut self, command: WriteCommand) -> Vec<WriteCommand> {
        let mut ready = Vec::new();
        match command.key() {
            Some(ExchangeKey::Sequence(seq)) if seq == self.next => {
                self.release(command, &mut ready);
            }
            Some(ExchangeKey::Sequence(seq)) if seq > self.next => {
                self.pending.entry(seq).or_default().push(command);
            }
            Some(ExchangeKey::Sequence(seq)) => {
                tracing::warn!(sequence = seq, head = self.next, "Write for finished exchange, dropping");
            }
            Some(ExchangeKey::Stream(_)) => ready.push(command),
            None => {
                // Close: held responses belong to exchanges that were aborted.
                if !self.pending.is_empty() {
                    tracing::debug!(dropped = self.buffered(), "Discarding held responses on close");
                    self.pending.clear();
                }
                ready.push(command);
            }
        }
        ready
    }

    fn release(&mut self, command: WriteCommand, ready: &mut Vec<WriteCommand>) {
        let ends = command.ends_exchange();
        ready.push(command);
        if !ends {
            return;
        }
        self.next += 1;

        while let Some(held) = self.pending.remove(&self.next) {
            let finished = held.last().is_some_and(WriteCommand::ends_exchange);
            ready.extend(held);
            if !finished {
                break;
            }
            self.next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use crate::exchange::StreamId;

    fn headers(seq: u64) -> WriteCommand {
        WriteCommand::Headers {
            key: ExchangeKey::Sequence(seq),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            end_of_stream: false,
        }
    }

    fn last_body(seq: u64) -> WriteCommand {
        WriteCommand::Body {
            key: ExchangeKey::Sequence(seq),
            chunk: Bytes::from(format!("response-{}", seq)),
            is_last: true,
        }
    }

    #[test]
    fn head_of_line_flushes_immediately() {
        let mut seq = ResponseSequencer::new();
        assert_eq!(seq.push(headers(0)), vec![headers(0)]);
        assert_eq!(seq.push(last_body(0)), vec![last_body(0)]);
        assert_eq!(seq.head(), 1);
    }

    #[test]
    fn later_responses_wait_for_earlier_ones() {
        let mut seq = ResponseSequencer::new();

        assert!(seq.push(headers(2)).is_empty());
        assert!(seq.push(last_body(2)).is_empty());
        assert!(seq.push(headers(1)).is_empty());
        assert_eq!(seq.buffered(), 3);

        assert_eq!(seq.push(headers(0)), vec![headers(0)]);
        let flushed = seq.push(last_body(0));
        assert_eq!(
            flushed,
            vec![last_body(0), headers(1)],
            "exchange 1 is released but not finished"
        );

        let flushed = seq.push(last_body(1));
        assert_eq!(flushed, vec![last_body(1), headers(2), last_body(2)]);
        assert_eq!(seq.head(), 3);
        assert_eq!(seq.buffered(), 0);
    }

    #[test]
    fn interim_continue_does_not_advance() {
        let mut seq = ResponseSequencer::new();
        let interim = WriteCommand::Headers {
            key: ExchangeKey::Sequence(0),
            status: StatusCode::CONTINUE,
            headers: HeaderMap::new(),
            end_of_stream: true,
        };
        seq.push(interim);
        assert_eq!(seq.head(), 0);
    }

    #[test]
    fn streams_and_close_pass_through() {
        let mut seq = ResponseSequencer::new();
        let reset = WriteCommand::Reset {
            key: ExchangeKey::Stream(StreamId::new(7).unwrap()),
        };
        assert_eq!(seq.push(reset.clone()), vec![reset]);

        seq.push(headers(1));
        assert_eq!(seq.push(WriteCommand::Close), vec![WriteCommand::Close]);
        assert_eq!(seq.buffered(), 0);
    }
}
