//! Three-node chain: producer → hub → consumer.
//!
//! A produces `Px`; B is a pure hub (forwards, neither produces nor
//! consumes); C consumes `Px`. Commits at A must reach C through B, B
//! must not deliver or store locally, and successive commits must arrive
//! in order.

use std::sync::Arc;
use std::time::Duration;

use meshwire::codec::fields::{FieldCodec, FieldSpec, FieldValue};
use meshwire::core::{Config, DefaultBehavior, ObjectBehavior, Runtime, TypeSpec};
use mw_test_utils::{Happened, Recorder, link, wait_until};

fn px_spec(behavior: Arc<dyn ObjectBehavior>) -> TypeSpec {
    TypeSpec::new("Px", vec![FieldSpec::new("v", FieldCodec::Int)], behavior)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_owned()))
        .try_init();
}

#[tokio::test]
async fn chain_delivers_commits_through_a_hub() {
    init_tracing();

    let a = Runtime::builder()
        .app("producer-a", "1.0")
        .register(px_spec(Arc::new(DefaultBehavior)))
        .produce("Px")
        .build()
        .unwrap();
    a.start().unwrap();

    let b = Runtime::builder()
        .app("hub-b", "1.0")
        .config(Config::from_pairs([("hub-mode", "true")]))
        .build()
        .unwrap();
    b.start().unwrap();

    let c_rec = Recorder::new();
    let c = Runtime::builder()
        .app("consumer-c", "1.0")
        .register(px_spec(c_rec.clone()))
        .consume("Px")
        .build()
        .unwrap();
    c.start().unwrap();

    // B dials A, C dials B (consumer→producer direction).
    let (_b_up, a_down) = link(&b, &a, "ab");
    let (_c_up, _b_down) = link(&c, &b, "bc");

    // C's subscription must have propagated through B to A.
    assert!(
        wait_until(|| a_down.wants_type("Px").is_some(), Duration::from_secs(3)).await,
        "subscription never reached the producer"
    );

    a.update("Px", &["1"], vec![FieldValue::Int(7)]).unwrap();
    a.commit("Px", &["1"]).await.unwrap();

    let saw_v7 = c_rec
        .wait_for(
            |log| {
                log.iter().any(|h| {
                    matches!(h, Happened::Event { id, values }
                        if id == "1" && values == &vec![FieldValue::Int(7)])
                })
            },
            Duration::from_secs(3),
        )
        .await;
    assert!(saw_v7, "consumer never saw v=7: {:?}", c_rec.log());

    // The hub forwarded but did not store or deliver locally.
    assert!(!b.consumes("Px"));
    assert!(b.tree().collect_type(b.registry(), "Px").is_empty());

    // A second commit updates the same object downstream.
    a.update("Px", &["1"], vec![FieldValue::Int(8)]).unwrap();
    a.commit("Px", &["1"]).await.unwrap();

    let saw_v8 = c_rec
        .wait_for(
            |log| {
                log.iter().any(|h| {
                    matches!(h, Happened::Event { id, values }
                        if id == "1" && values == &vec![FieldValue::Int(8)])
                })
            },
            Duration::from_secs(3),
        )
        .await;
    assert!(saw_v8, "consumer never saw v=8: {:?}", c_rec.log());

    // C's copy of the object carries the final value.
    let objs = c.tree().collect_type(c.registry(), "Px");
    assert_eq!(objs.len(), 1);
    assert_eq!(objs[0].values, vec![FieldValue::Int(8)]);
    assert_eq!(objs[0].origin, a.uuid());

    a.shutdown(false).await;
    b.shutdown(false).await;
    c.shutdown(false).await;
}
