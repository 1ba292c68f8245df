//! Outbound commands and the channel writer seam.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;

use crate::exchange::ExchangeKey;

/// A frame-level instruction for the codec/channel layer.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    Headers {
        key: ExchangeKey,
        status: StatusCode,
        headers: HeaderMap,
        end_of_stream: bool,
    },
    Body {
        key: ExchangeKey,
        chunk: Bytes,
        is_last: bool,
    },
    /// Abort one stream (HTTP/2 RST_STREAM, HTTP/3 stream reset, HTTP/1.1 close).
    Reset { key: ExchangeKey },
    /// Close the whole connection.
    Close,
}

impl WriteCommand {
    pub fn key(&self) -> Option<ExchangeKey> {
        match self {
            WriteCommand::Headers { key, .. }
            | WriteCommand::Body { key, .. }
            | WriteCommand::Reset { key } => Some(*key),
            WriteCommand::Close => None,
        }
    }

    /// This command is the last one its exchange will emit.
    pub fn ends_exchange(&self) -> bool {
        match self {
            WriteCommand::Headers {
                status,
                end_of_stream,
                ..
            } => *end_of_stream && !status.is_informational(),
            WriteCommand::Body { is_last, .. } => *is_last,
            WriteCommand::Reset { .. } | WriteCommand::Close => true,
        }
    }
}

/// Sink for outbound commands. Commands of one exchange arrive in the order
/// its state machine produced them.
pub trait ChannelWriter {
    fn write(&mut self, command: WriteCommand);
}

impl ChannelWriter for Vec<WriteCommand> {
    fn write(&mut self, command: WriteCommand) {
        self.push(command);
    }
}

impl ChannelWriter for mpsc::UnboundedSender<WriteCommand> {
    fn write(&mut self, command: WriteCommand) {
        if self.send(command).is_err() {
            tracing::trace!("Channel writer closed, dropping command");
        }
    }
}
