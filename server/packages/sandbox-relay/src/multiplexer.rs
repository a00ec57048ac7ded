//! Merges concurrent producers into the single outgoing event stream.
//!
//! Producers push onto an unbounded queue and never wait on the consumer.
//! The consumer polls that queue with a bounded wait while the tracked task
//! runs, then drains whatever is left once the task has finished.

use std::future::Future;
use std::time::Duration;

use sandbox_relay_event_schema::EventEnvelope;
use tokio::sync::mpsc;

/// Shared queue sub-tasks push progress onto.
pub type EventQueue = mpsc::UnboundedSender<EventEnvelope>;

/// Writer side of the outgoing stream of one request.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<EventEnvelope>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Delivery is best-effort: a caller that went away does not stop the run.
    pub async fn emit(&self, envelope: EventEnvelope) {
        let kind = envelope.kind;
        if self.sender.send(envelope).await.is_err() {
            tracing::debug!(kind = kind.as_str(), "event stream closed; dropping event");
        }
    }
}

pub fn channel<T>(poll_interval: Duration) -> (mpsc::UnboundedSender<T>, Multiplexer<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        sender,
        Multiplexer {
            receiver,
            poll_interval,
        },
    )
}

#[derive(Debug)]
pub struct Multiplexer<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    poll_interval: Duration,
}

impl<T> Multiplexer<T> {
    /// Runs `task` to completion while forwarding queued items, mapped through
    /// `map`, to `sink`. Items are forwarded in the order they were queued and
    /// none queued before the task finished are lost.
    pub async fn drive<F, M>(&mut self, task: F, sink: &EventSink, mut map: M) -> F::Output
    where
        F: Future,
        M: FnMut(T) -> Option<EventEnvelope>,
    {
        tokio::pin!(task);

        let output = loop {
            tokio::select! {
                biased;
                output = &mut task => break output,
                received = tokio::time::timeout(self.poll_interval, self.receiver.recv()) => {
                    match received {
                        Ok(Some(item)) => {
                            if let Some(envelope) = map(item) {
                                sink.emit(envelope).await;
                            }
                        }
                        // Every producer hung up; only the task itself is left.
                        Ok(None) => break (&mut task).await,
                        Err(_) => continue,
                    }
                }
            }
        };

        while let Ok(item) = self.receiver.try_recv() {
            if let Some(envelope) = map(item) {
                sink.emit(envelope).await;
            }
        }

        output
    }
}
