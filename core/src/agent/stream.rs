//! Caller-side handle for a streaming turn

use crate::error::{Error, Result};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ordered, finite sequence of text deltas produced by one background task.
///
/// The sequence ends when the turn completes, fails, or is cancelled. A
/// failure after streaming began arrives as a last diagnostic delta; the
/// error itself is returned by [`finish`](Self::finish).
pub struct ConversationStream {
    receiver: mpsc::Receiver<String>,
    cancel: CancellationToken,
    producer: JoinHandle<Result<String>>,
}

impl ConversationStream {
    pub(crate) fn new(
        receiver: mpsc::Receiver<String>,
        cancel: CancellationToken,
        producer: JoinHandle<Result<String>>,
    ) -> Self {
        Self {
            receiver,
            cancel,
            producer,
        }
    }

    /// Stop the turn; the producer closes the connection and the channel
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drain what is left and return the final assistant text or the error
    pub async fn finish(mut self) -> Result<String> {
        while self.receiver.recv().await.is_some() {}
        match self.producer.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::Generic(format!("stream producer failed: {}", e))),
        }
    }
}

impl Stream for ConversationStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
