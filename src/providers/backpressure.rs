//! Streaming backpressure via bounded channels.
//!
//! A fast backend can otherwise fill unbounded memory while a slow
//! consumer drains chunks. The switcher wraps every stream it hands out in
//! [`bounded_stream`].

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::TextStream;

/// Chunks buffered between producer and consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Pump `inner` through a bounded `mpsc` channel.
///
/// The producer task parks when the channel is full and stops as soon as
/// the consumer drops the returned stream. Requires a tokio runtime.
pub fn bounded_stream(inner: TextStream, buffer_size: usize) -> TextStream {
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));

    tokio::spawn(async move {
        let mut inner = inner;
        while let Some(item) = inner.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}
