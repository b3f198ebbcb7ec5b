//! Tests for bounded streaming between adapters and callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use heimdall::providers::bounded_stream;
use heimdall::{HeimdallError, ProviderId, TextStream};

/// Stream of `count` chunks that counts how many were pulled.
fn counting_stream(count: u32, produced: Arc<AtomicU32>) -> TextStream {
    Box::pin(stream::iter((0..count).map(move |i| {
        produced.fetch_add(1, Ordering::SeqCst);
        Ok(format!("chunk-{i} "))
    })))
}

#[tokio::test]
async fn delivers_every_chunk_in_order() {
    let produced = Arc::new(AtomicU32::new(0));
    let chunks: Vec<String> = bounded_stream(counting_stream(10, produced.clone()), 3)
        .map(|c| c.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.len(), 10);
    assert_eq!(chunks[0], "chunk-0 ");
    assert_eq!(chunks[9], "chunk-9 ");
    assert_eq!(produced.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn mid_stream_error_is_delivered_in_place() {
    let inner: TextStream = Box::pin(stream::iter(vec![
        Ok("partial".to_string()),
        Err(HeimdallError::Network {
            provider: ProviderId::Anthropic,
            message: "stream reset".into(),
        }),
    ]));
    let mut out = bounded_stream(inner, 4);

    assert_eq!(out.next().await.unwrap().unwrap(), "partial");
    assert!(matches!(
        out.next().await.unwrap(),
        Err(HeimdallError::Network { .. })
    ));
    assert!(out.next().await.is_none());
}

#[tokio::test]
async fn empty_stream_ends_immediately() {
    let inner: TextStream = Box::pin(stream::empty());
    assert!(bounded_stream(inner, 4).next().await.is_none());
}

#[tokio::test]
async fn producer_stops_when_consumer_drops() {
    let produced = Arc::new(AtomicU32::new(0));
    let mut out = bounded_stream(counting_stream(10_000, produced.clone()), 4);
    out.next().await;
    out.next().await;
    drop(out);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let total = produced.load(Ordering::SeqCst);
    assert!(total < 20, "producer kept going after drop: {total}");
}

#[tokio::test]
async fn slow_consumer_bounds_the_producer() {
    let buffer = 4;
    let produced = Arc::new(AtomicU32::new(0));
    let mut out = bounded_stream(counting_stream(500, produced.clone()), buffer);

    let _ = out.next().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let total = produced.load(Ordering::SeqCst);
    assert!(
        total <= buffer as u32 + 2,
        "producer ran {total} chunks ahead with buffer {buffer}"
    );
}
