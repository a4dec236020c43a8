//! Rename propagation.
//!
//! A rename at the producer re-keys the object atomically at every
//! downstream node: `on_rename` fires with the old id, the old id stops
//! resolving, and the new id carries the object's state forward.

use std::sync::Arc;
use std::time::Duration;

use meshwire::codec::fields::{FieldCodec, FieldSpec, FieldValue};
use meshwire::core::{ObjectBehavior, Runtime, TypeSpec};
use mw_test_utils::{Happened, Recorder, link, wait_until};

fn px_spec(behavior: Arc<dyn ObjectBehavior>) -> TypeSpec {
    TypeSpec::new("Px", vec![FieldSpec::new("v", FieldCodec::Int)], behavior)
}

#[tokio::test]
async fn rename_rekeys_downstream_and_fires_on_rename() {
    let producer = Runtime::builder()
        .app("producer", "1.0")
        .register(px_spec(Arc::new(meshwire::core::DefaultBehavior)))
        .produce("Px")
        .build()
        .unwrap();
    producer.start().unwrap();

    let rec = Recorder::new();
    let consumer = Runtime::builder()
        .app("consumer", "1.0")
        .register(px_spec(rec.clone()))
        .consume("Px")
        .build()
        .unwrap();
    consumer.start().unwrap();

    let (_c_up, p_down) = link(&consumer, &producer, "pc");
    assert!(
        wait_until(|| p_down.wants_type("Px").is_some(), Duration::from_secs(3)).await
    );

    producer.update("Px", &["1"], vec![FieldValue::Int(7)]).unwrap();
    producer.commit("Px", &["1"]).await.unwrap();
    assert!(
        rec.wait_for(
            |log| log.iter().any(|h| matches!(h, Happened::Event { id, .. } if id == "1")),
            Duration::from_secs(3),
        )
        .await
    );

    producer.rename("Px", &["1"], "1b").await.unwrap();

    let renamed = rec
        .wait_for(
            |log| {
                log.iter().any(|h| {
                    matches!(h, Happened::Renamed { old_id, new_id }
                        if old_id == "1" && new_id == "1b")
                })
            },
            Duration::from_secs(3),
        )
        .await;
    assert!(renamed, "on_rename never fired: {:?}", rec.log());

    // Old id gone, new id live, state preserved, at both ends.
    for rt in [&producer, &consumer] {
        assert!(rt.tree().get(rt.registry(), "Px", &["1"]).is_none());
        let node = rt
            .tree()
            .get(rt.registry(), "Px", &["1b"])
            .expect("renamed object must resolve under the new id");
        let obj = node.snapshot().unwrap();
        assert_eq!(obj.id, "1b");
        assert_eq!(obj.values, vec![FieldValue::Int(7)]);
    }

    // Subsequent commits flow under the new id.
    producer.update("Px", &["1b"], vec![FieldValue::Int(9)]).unwrap();
    producer.commit("Px", &["1b"]).await.unwrap();
    assert!(
        rec.wait_for(
            |log| {
                log.iter().any(|h| {
                    matches!(h, Happened::Event { id, values }
                        if id == "1b" && values == &vec![FieldValue::Int(9)])
                })
            },
            Duration::from_secs(3),
        )
        .await,
        "commit under the new id never arrived: {:?}",
        rec.log()
    );

    producer.shutdown(false).await;
    consumer.shutdown(false).await;
}
