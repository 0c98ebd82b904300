//! Streaming turn events over a bounded channel.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::TurnOutcome;

/// Queue depth between the turn producer and its consumer.
pub const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Start {
        agent_id: String,
        session_id: String,
    },
    TextDelta(String),
    ToolCall {
        id: String,
        name: String,
        is_error: bool,
        output: String,
    },
    TurnComplete(TurnOutcome),
    /// The turn could not complete; no `TurnComplete` follows.
    Failed(String),
}

/// Consumer side. Ends once the producer finishes and the queue drains.
pub type TurnEventStream = ReceiverStream<TurnEvent>;

/// Producer side. Sends wait for queue space; a dropped consumer is ignored.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSink {
    #[must_use]
    pub fn channel() -> (Self, TurnEventStream) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (Self { tx }, ReceiverStream::new(rx))
    }

    pub async fn emit(&self, event: TurnEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("turn event consumer dropped");
        }
    }
}

/// Emit on an optional sink; buffered turns pass `None`.
pub(crate) async fn emit(sink: Option<&EventSink>, event: TurnEvent) {
    if let Some(sink) = sink {
        sink.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn stream_ends_after_producer_drops() {
        let (sink, mut stream) = EventSink::channel();
        tokio::spawn(async move {
            sink.emit(TurnEvent::TextDelta("a".into())).await;
            sink.emit(TurnEvent::TextDelta("b".into())).await;
        });
        let mut seen = Vec::new();
        while let Some(ev) = stream.next().await {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            vec![TurnEvent::TextDelta("a".into()), TurnEvent::TextDelta("b".into())]
        );
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_block_producer() {
        let (sink, stream) = EventSink::channel();
        drop(stream);
        for _ in 0..(EVENT_BUFFER * 2) {
            sink.emit(TurnEvent::TextDelta("x".into())).await;
        }
    }
}
