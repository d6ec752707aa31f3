//! Dead-letter path tests.
//!
//! Covered:
//! - Success acknowledges and produces no dead letter
//! - One failure yields one dead letter with retry count 1; feeding it back
//!   yields retry count 2
//! - N consecutive failures yield N dead letters counting 1..=N with an
//!   identical body
//! - The handler sees the retry count of the message it is given

use super::harness::{Outcome, ScriptedHandler, TestPipeline};
use crate::broker::QueueBroker;
use crate::consumer::{ConsumeOutcome, EventConsumer, RetryPolicy};
use crate::jobs::{EmailMessage, EMAIL_DLQ, EMAIL_QUEUE};
use crate::redrive::DeadLetterRedriver;
use serde_json::json;

#[tokio::test]
async fn successful_delivery_is_acked_once() {
    let pipeline = TestPipeline::new();
    let handler = ScriptedHandler::always(Outcome::Succeed);
    let consumer = pipeline.email_consumer(handler.clone(), RetryPolicy::default());

    let id = pipeline
        .publisher
        .publish(EMAIL_QUEUE, &EmailMessage::new("a@b.c", "Hi", "Welcome"))
        .await
        .unwrap();

    assert_eq!(consumer.process_one().await.unwrap(), ConsumeOutcome::Delivered);
    assert_eq!(consumer.process_one().await.unwrap(), ConsumeOutcome::Idle);

    assert_eq!(pipeline.broker.acked(EMAIL_QUEUE), vec![id]);
    assert!(pipeline.broker.ready(EMAIL_DLQ).is_empty());
    assert_eq!(handler.seen().len(), 1);
    assert_eq!(handler.seen()[0].event["subject"], "Hi");
    assert_eq!(consumer.stats().delivered, 1);
}

#[tokio::test]
async fn failed_delivery_dead_letters_with_incremented_count() {
    let pipeline = TestPipeline::new();
    let consumer = pipeline.email_consumer(
        ScriptedHandler::always(Outcome::Fail),
        RetryPolicy::default(),
    );

    let id = pipeline
        .publisher
        .publish(EMAIL_QUEUE, &json!({"to": "a@b.c", "subject": "s", "body": "b"}))
        .await
        .unwrap();

    assert_eq!(
        consumer.process_one().await.unwrap(),
        ConsumeOutcome::DeadLettered { retry_count: 1 }
    );

    let dead = pipeline.broker.ready(EMAIL_DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 1);
    assert_eq!(pipeline.broker.acked(EMAIL_QUEUE), vec![id]);
    assert_eq!(pipeline.broker.pending_count(EMAIL_QUEUE), 0);

    // Feed the dead letter back through a consumer of the dead-letter queue.
    let dlq_consumer = EventConsumer::new(
        pipeline.broker.clone(),
        ScriptedHandler::always(Outcome::Fail),
        pipeline.config(EMAIL_DLQ, EMAIL_DLQ, RetryPolicy::default()),
    );
    assert_eq!(
        dlq_consumer.process_one().await.unwrap(),
        ConsumeOutcome::DeadLettered { retry_count: 2 }
    );

    let dead = pipeline.broker.ready(EMAIL_DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 2);
}

#[tokio::test]
async fn n_failures_produce_n_dead_letters_counting_up() {
    const N: u32 = 6;

    let pipeline = TestPipeline::new();
    let handler = ScriptedHandler::always(Outcome::Fail);
    let consumer = pipeline.email_consumer(handler.clone(), RetryPolicy::default());
    let redriver = DeadLetterRedriver::new(pipeline.broker.clone());

    pipeline
        .publisher
        .publish(EMAIL_QUEUE, &json!({"event": "delivery.created", "delivery_id": 3}))
        .await
        .unwrap();
    let original_body = pipeline.broker.ready(EMAIL_QUEUE)[0].body.clone();

    let mut dead_letter_counts = Vec::new();
    for _ in 0..N {
        match consumer.process_one().await.unwrap() {
            ConsumeOutcome::DeadLettered { retry_count } => dead_letter_counts.push(retry_count),
            other => panic!("unexpected outcome {other:?}"),
        }

        let dead = pipeline.broker.ready(EMAIL_DLQ);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, original_body);

        assert_eq!(redriver.redrive(EMAIL_DLQ, EMAIL_QUEUE, 1).await.unwrap(), 1);
    }

    assert_eq!(dead_letter_counts, (1..=N).collect::<Vec<_>>());

    let seen_counts: Vec<u32> = handler.seen().iter().map(|s| s.ctx.retry_count).collect();
    assert_eq!(seen_counts, (0..N).collect::<Vec<_>>());
    assert_eq!(consumer.stats().dead_lettered, u64::from(N));
}

#[tokio::test]
async fn recovery_after_failures_stops_the_cycle() {
    let pipeline = TestPipeline::new();
    let consumer = pipeline.email_consumer(
        ScriptedHandler::scripted(vec![Outcome::Fail, Outcome::Fail], Outcome::Succeed),
        RetryPolicy::default(),
    );
    let redriver = DeadLetterRedriver::new(pipeline.broker.clone());

    pipeline
        .publisher
        .publish(EMAIL_QUEUE, &json!({"to": "x@y.z", "subject": "s", "body": "b"}))
        .await
        .unwrap();

    for expected in 1..=2 {
        assert_eq!(
            consumer.process_one().await.unwrap(),
            ConsumeOutcome::DeadLettered {
                retry_count: expected
            }
        );
        redriver.redrive(EMAIL_DLQ, EMAIL_QUEUE, 10).await.unwrap();
    }

    assert_eq!(consumer.process_one().await.unwrap(), ConsumeOutcome::Delivered);
    assert!(pipeline.broker.ready(EMAIL_DLQ).is_empty());
    assert_eq!(pipeline.broker.depth(EMAIL_QUEUE).await.unwrap(), 0);
}
