//! Queue backpressure under a fast producer and slow consumers: producers
//! suspend at the high-water mark, resume below the low-water mark, and no
//! event is lost.

use std::sync::Arc;
use std::time::Duration;

use asset_graph::Asset;
use perimeter::dispatcher::EventQueue;
use perimeter::Event;

#[tokio::test]
async fn producer_suspends_and_resumes_without_losing_events() {
    const TOTAL: usize = 200;

    let queue = Arc::new(EventQueue::new(16, 4));

    let producer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for i in 0..TOTAL {
                queue.push(Event::seed(Asset::fqdn(format!("host-{i}.example.com")))).await;
            }
        })
    };

    // Let the producer hit the high-water mark before draining starts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.len(), 16);
    assert!(!producer.is_finished());

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut names = Vec::new();
                loop {
                    let event = tokio::select! {
                        event = queue.pop() => event,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => break,
                    };
                    names.push(event.asset.key());
                    // Slow consumer keeps the queue oscillating around the
                    // watermarks.
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                names
            })
        })
        .collect();

    producer.await.expect("producer finishes");

    let mut all_names = Vec::new();
    for consumer in consumers {
        all_names.extend(consumer.await.expect("consumer finishes"));
    }

    all_names.sort();
    all_names.dedup();
    assert_eq!(all_names.len(), TOTAL, "every event must be delivered exactly once");

    assert!(queue.is_empty());
    assert!(queue.stats().backpressure_waits() > 0, "the producer must have been suspended");
    assert_eq!(queue.stats().enqueued(), TOTAL as u64);
    assert_eq!(queue.stats().dequeued(), TOTAL as u64);
}
