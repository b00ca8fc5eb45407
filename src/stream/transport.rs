// src/stream/transport.rs
// Object-mode duplex plumbing: whole JSON values in, whole JSON values out

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::errors::{Result, StreamError};

/// The writable side of a duplex stream.
///
/// `write` is called once per inbound message, and the returned `Result` is
/// that message's acknowledgment. The next message is not written until the
/// previous acknowledgment has resolved.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn write(&self, message: Value) -> Result<()>;
}

#[async_trait]
impl<T: MessageSink + ?Sized> MessageSink for Arc<T> {
    async fn write(&self, message: Value) -> Result<()> {
        (**self).write(message).await
    }
}

/// Push side of the readable half. Pushes never wait.
#[derive(Clone, Debug)]
pub struct Outbound {
    sender: mpsc::UnboundedSender<Value>,
}

impl Outbound {
    pub fn push(&self, message: Value) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| StreamError::TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Readable half: everything the owning engine pushed, in push order.
#[derive(Debug)]
pub struct MessageStream {
    receiver: mpsc::UnboundedReceiver<Value>,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for MessageStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.receiver.poll_recv(cx)
    }
}

pub fn channel() -> (Outbound, MessageStream) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Outbound { sender }, MessageStream { receiver })
}

/// Feeds every message from `source` into `sink`, one at a time.
///
/// A failed acknowledgment is logged and the pipe moves on to the next
/// message; per-message errors are warnings, anything else is an error.
/// The task ends when the source's pushing side is gone.
pub fn pipe<S>(mut source: MessageStream, sink: S) -> JoinHandle<()>
where
    S: MessageSink + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = source.recv().await {
            match sink.write(message).await {
                Ok(()) => {}
                Err(e) if e.is_per_message() => {
                    warn!(error = %e, "Stream write was not acknowledged");
                }
                Err(e) => error!(error = %e, "Stream write failed"),
            }
        }
        debug!("Pipe source closed");
    })
}
