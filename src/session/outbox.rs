//! Per-session outbound channel
//!
//! Intermediate events go through a bounded queue and are dropped when the
//! consumer falls behind. The terminal event has its own slot, so it always
//! arrives, and only after every queued event.

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::protocol::Event;

/// Create a connected outbox/stream pair holding up to `capacity` queued events
pub fn channel(capacity: usize) -> (Outbox, EventStream) {
    let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
    let (terminal_tx, terminal_rx) = oneshot::channel();
    (
        Outbox {
            queue: queue_tx,
            terminal: terminal_tx,
            dropped: 0,
        },
        EventStream {
            queue: queue_rx,
            terminal: Some(terminal_rx),
        },
    )
}

/// Sending half, owned by the session task
pub struct Outbox {
    queue: mpsc::Sender<Event>,
    terminal: oneshot::Sender<Event>,
    dropped: u64,
}

impl Outbox {
    /// Queue an intermediate event. Returns false if it was not delivered.
    pub fn push(&mut self, event: Event) -> bool {
        match self.queue.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped += 1;
                warn!(
                    "Consumer lagging, dropped {} event ({} dropped so far)",
                    event.kind(),
                    self.dropped
                );
                false
            }
            // Nobody is listening; the session still runs to completion
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Number of intermediate events dropped under backpressure
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Deliver the terminal event and close the channel
    pub fn finish(self, event: Event) -> bool {
        let Outbox {
            queue, terminal, ..
        } = self;
        drop(queue);
        terminal.send(event).is_ok()
    }
}

/// Receiving half, handed to exactly one consumer
pub struct EventStream {
    queue: mpsc::Receiver<Event>,
    terminal: Option<oneshot::Receiver<Event>>,
}

impl EventStream {
    /// Next event in emission order; `None` once the stream is over.
    ///
    /// Cancel-safe: dropping the future never loses an event.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.queue.recv().await {
            return Some(event);
        }
        let terminal = self.terminal.as_mut()?;
        let event = terminal.await.ok();
        self.terminal = None;
        event
    }
}
