//! Lossless end-to-end acknowledgment.
//!
//! The consumer subscribes `Px+`. A commit whose async handler fails is
//! never acknowledged; the producer's pending-ack table keeps the frame
//! and the periodic sweep resends it until the consumer processes it
//! successfully, at which point exactly one ack clears the table.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use meshwire::codec::fields::{FieldCodec, FieldSpec, FieldValue};
use meshwire::core::{Config, ObjectBehavior, Runtime, TypeSpec};
use mw_test_utils::{Happened, Recorder, link, wait_until};

fn px_spec(behavior: Arc<dyn ObjectBehavior>) -> TypeSpec {
    TypeSpec::new("Px", vec![FieldSpec::new("v", FieldCodec::Int)], behavior)
}

#[tokio::test]
async fn unacknowledged_commit_is_resent_until_processed() {
    let producer = Runtime::builder()
        .app("producer", "1.0")
        .config(Config::from_pairs([("ack-timeout-secs", "1")]))
        .register(px_spec(Arc::new(meshwire::core::DefaultBehavior)))
        .produce("Px")
        .build()
        .unwrap();
    producer.start().unwrap();

    // Async-path consumer whose handler fails until we flip the switch.
    let rec = Recorder::async_path();
    rec.async_ok.store(false, Ordering::SeqCst);
    let consumer = Runtime::builder()
        .app("consumer", "1.0")
        .register(px_spec(rec.clone()))
        .consume("Px+")
        .build()
        .unwrap();
    consumer.start().unwrap();

    let (_c_up, p_down) = link(&consumer, &producer, "pc");

    // The `+` subscription must register as lossless at the producer.
    assert!(
        wait_until(|| p_down.wants_type("Px") == Some(true), Duration::from_secs(3)).await,
        "lossless subscription never arrived"
    );

    producer.update("Px", &["1"], vec![FieldValue::Int(7)]).unwrap();
    producer.commit("Px", &["1"]).await.unwrap();

    // The frame is armed with an ack sequence and stays pending while the
    // consumer keeps failing.
    assert!(
        wait_until(|| p_down.pending_ack_count("Px") == 1, Duration::from_secs(3)).await,
        "commit was never armed for acknowledgment"
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        p_down.pending_ack_count("Px"),
        1,
        "pending ack cleared although the event handler failed"
    );

    // Heal the consumer; the next resend must complete and be acked.
    rec.async_ok.store(true, Ordering::SeqCst);
    assert!(
        wait_until(|| p_down.pending_ack_count("Px") == 0, Duration::from_secs(5)).await,
        "pending ack never cleared after the handler recovered"
    );

    // The commit was eventually observed, with the original payload.
    let processed = rec
        .wait_for(
            |log| {
                log.iter().any(|h| {
                    matches!(h, Happened::AsyncEvent { id, values }
                        if id == "1" && values == &vec![FieldValue::Int(7)])
                })
            },
            Duration::from_secs(2),
        )
        .await;
    assert!(processed, "commit never processed: {:?}", rec.log());

    // The original origin UUID survived the resend.
    let objs = consumer.tree().collect_type(consumer.registry(), "Px");
    assert_eq!(objs.len(), 1);
    assert_eq!(objs[0].origin, producer.uuid());

    producer.shutdown(false).await;
    consumer.shutdown(false).await;
}
