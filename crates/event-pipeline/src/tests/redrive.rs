//! Redrive tests.
//!
//! Covered:
//! - Redrive moves bodies unchanged with retry counts preserved
//! - The limit is honored and an empty queue ends the run early
//! - A failed re-publish leaves the dead letter unacknowledged

use super::harness::TestPipeline;
use crate::redrive::DeadLetterRedriver;
use crate::jobs::{EMAIL_DLQ, EMAIL_QUEUE};

#[tokio::test]
async fn redrive_preserves_body_and_retry_count() {
    let pipeline = TestPipeline::new();
    for (body, retries) in [("a", 1), ("b", 4), ("c", 2)] {
        pipeline
            .publisher
            .republish(EMAIL_DLQ, body.as_bytes().to_vec(), retries)
            .await
            .unwrap();
    }

    let moved = DeadLetterRedriver::new(pipeline.broker.clone())
        .redrive(EMAIL_DLQ, EMAIL_QUEUE, 10)
        .await
        .unwrap();
    assert_eq!(moved, 3);

    let requeued: Vec<(Vec<u8>, u32)> = pipeline
        .broker
        .ready(EMAIL_QUEUE)
        .into_iter()
        .map(|m| (m.body, m.retry_count))
        .collect();
    assert_eq!(
        requeued,
        vec![
            (b"a".to_vec(), 1),
            (b"b".to_vec(), 4),
            (b"c".to_vec(), 2)
        ]
    );
    assert!(pipeline.broker.ready(EMAIL_DLQ).is_empty());
    assert_eq!(pipeline.broker.acked(EMAIL_DLQ).len(), 3);
}

#[tokio::test]
async fn redrive_honors_limit() {
    let pipeline = TestPipeline::new();
    for i in 0..5u32 {
        pipeline
            .publisher
            .republish(EMAIL_DLQ, i.to_string().into_bytes(), 1)
            .await
            .unwrap();
    }

    let redriver = DeadLetterRedriver::new(pipeline.broker.clone());
    assert_eq!(redriver.redrive(EMAIL_DLQ, EMAIL_QUEUE, 2).await.unwrap(), 2);
    assert_eq!(pipeline.broker.ready(EMAIL_DLQ).len(), 3);

    assert_eq!(redriver.redrive(EMAIL_DLQ, EMAIL_QUEUE, 100).await.unwrap(), 3);
    assert_eq!(redriver.redrive(EMAIL_DLQ, EMAIL_QUEUE, 100).await.unwrap(), 0);
    assert_eq!(pipeline.broker.ready(EMAIL_QUEUE).len(), 5);
}

#[tokio::test]
async fn failed_republish_keeps_dead_letter() {
    let pipeline = TestPipeline::new();
    pipeline
        .publisher
        .republish(EMAIL_DLQ, b"{}".to_vec(), 3)
        .await
        .unwrap();
    pipeline.broker.fail_enqueues(EMAIL_QUEUE, 1);

    let result = DeadLetterRedriver::new(pipeline.broker.clone())
        .redrive(EMAIL_DLQ, EMAIL_QUEUE, 1)
        .await;

    assert!(result.is_err());
    assert!(pipeline.broker.acked(EMAIL_DLQ).is_empty());
    assert_eq!(pipeline.broker.pending_count(EMAIL_DLQ), 1);
}
