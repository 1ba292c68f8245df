//! Per-connection writer task running on the pipelining group.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::exchange::{ChannelWriter, WriteCommand};
use crate::pipeline::ResponseSequencer;

/// `ChannelWriter` that restores request order before forwarding.
#[derive(Debug, Clone)]
pub struct PipelinedWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl PipelinedWriter {
    /// Start the ordering task on `handle`, forwarding to `downstream`.
    pub fn spawn(
        handle: &Handle,
        downstream: mpsc::UnboundedSender<WriteCommand>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteCommand>();

        let task = handle.spawn(async move {
            let mut sequencer = ResponseSequencer::new();
            while let Some(command) = rx.recv().await {
                for ready in sequencer.push(command) {
                    let closing = matches!(ready, WriteCommand::Close);
                    if downstream.send(ready).is_err() {
                        tracing::debug!("Connection writer gone, stopping pipelined writer");
                        return;
                    }
                    if closing {
                        return;
                    }
                }
            }
            if sequencer.buffered() > 0 {
                tracing::debug!(
                    held = sequencer.buffered(),
                    head = sequencer.head(),
                    "Pipelined writer stopped with held responses"
                );
            }
        });

        (Self { tx }, task)
    }
}

impl ChannelWriter for PipelinedWriter {
    fn write(&mut self, command: WriteCommand) {
        if self.tx.send(command).is_err() {
            tracing::trace!("Pipelined writer closed, dropping command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use crate::exchange::ExchangeKey;
    use crate::net::connection::{CodecEvent, ConnectionHandle, HttpVersion};

    #[tokio::test]
    async fn pipelined_responses_reach_the_wire_in_request_order() {
        let now = Instant::now();
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel();
        let (mut writer, task) = PipelinedWriter::spawn(&Handle::current(), wire_tx);

        let mut conn = ConnectionHandle::new(HttpVersion::Http11, None, Duration::from_secs(30), now)
            .with_pipelining(3);
        for _ in 0..3 {
            conn.on_codec_event(
                CodecEvent::HeadersReceived {
                    stream_id: None,
                    headers: HeaderMap::new(),
                    end_of_stream: true,
                },
                now,
                &mut writer,
            );
        }

        // C, then B, then A finish.
        for seq in [2u64, 1, 0] {
            let key = ExchangeKey::Sequence(seq);
            conn.send_headers(key, StatusCode::OK, HeaderMap::new(), now, &mut writer);
            conn.send_body(key, Bytes::from(vec![b'A' + seq as u8]), true, now, &mut writer);
        }
        drop(writer);

        let mut bodies = Vec::new();
        while let Some(command) = wire_rx.recv().await {
            if let WriteCommand::Body { chunk, .. } = command {
                bodies.push(chunk);
            }
        }
        task.await.unwrap();

        assert_eq!(bodies, vec![Bytes::from("A"), Bytes::from("B"), Bytes::from("C")]);
    }
}
