//! Exercises append-to-outbox through to a delivered queue message across
//! the repository and publisher together, rather than each in isolation
//! as `esrc-core`'s own unit tests do.

use std::sync::Arc;

use esrc_core::model::StreamId;
use esrc_core::outbox::{InMemoryOutboxRepository, NewOutboxRecord, OutboxPublisher, OutboxRepository};
use esrc_core::queue::InMemoryQueue;

#[tokio::test]
async fn appended_records_are_claimed_sent_and_acked_in_order() {
    let repo = Arc::new(InMemoryOutboxRepository::new());
    let queue = Arc::new(InMemoryQueue::new());
    let stream = StreamId::from("ctx.agg.v1-t1-e1");

    repo.append(vec![
        NewOutboxRecord {
            stream_id: stream.clone(),
            stream_revision: 0,
            event_type: "order-placed".into(),
            tenant: "acme".into(),
            correlation_id: "corr-1".into(),
            queue_name: "downstream".into(),
            payload: b"r0".to_vec(),
        },
        NewOutboxRecord {
            stream_id: stream.clone(),
            stream_revision: 1,
            event_type: "order-placed".into(),
            tenant: "acme".into(),
            correlation_id: "corr-1".into(),
            queue_name: "downstream".into(),
            payload: b"r1".to_vec(),
        },
    ])
    .await
    .unwrap();

    let publisher = OutboxPublisher::new(repo.clone(), queue.clone(), "downstream");

    let claimed = publisher.run_once().await.unwrap();
    assert_eq!(claimed, 2);

    assert_eq!(queue.sent_values(), vec![b"r0".to_vec(), b"r1".to_vec()]);

    // A second drain finds nothing left to claim: both records acked.
    assert_eq!(publisher.run_once().await.unwrap(), 0);
}
