//! Gap detection and keyframed recovery.
//!
//! A scripted producer (raw line peer) streams sequenced frames to a real
//! consumer, dropping one frame. The consumer must emit exactly one reset
//! request for the type, discard everything until a keyframe, and then
//! resume with the producer's *current* value, never the dropped
//! intermediate history.

use std::sync::Arc;
use std::time::Duration;

use meshwire::codec::fields::{FieldCodec, FieldSpec, FieldValue};
use meshwire::core::channel::ChannelConfig;
use meshwire::core::sequencer::{FullFrame, SendSequencer};
use meshwire::core::transport::OnceConnector;
use meshwire::core::{ObjectBehavior, Runtime, TypeSpec};
use meshwire::protocol::control::{AppInfo, LoginAck};
use meshwire::protocol::{Control, Destinations, Prefix};
use mw_test_utils::{Happened, LinePeer, Recorder, transport_pair};
use uuid::Uuid;

fn px_spec(behavior: Arc<dyn ObjectBehavior>) -> TypeSpec {
    TypeSpec::new("Px", vec![FieldSpec::new("v", FieldCodec::Int)], behavior)
}

fn frame(origin: Uuid, obj_seq: u64, v: i64) -> FullFrame {
    FullFrame {
        prefix: Prefix::Normal,
        type_code: "Px".to_owned(),
        ts: chrono::Utc::now(),
        origin,
        destinations: Destinations::All,
        obj_seq,
        ack_seq: None,
        keys: vec!["1".to_owned()],
        fields: v.to_string(),
    }
}

#[tokio::test]
async fn dropped_frame_forces_reset_and_current_state_recovery() {
    let rec = Recorder::new();
    let consumer = Runtime::builder()
        .app("consumer", "1.0")
        .register(px_spec(rec.clone()))
        .consume("Px")
        .build()
        .unwrap();
    consumer.start().unwrap();

    let (near, far) = transport_pair();
    let _peer = consumer.connect(
        ChannelConfig::new("to-producer"),
        Arc::new(OnceConnector::new(near)),
    );
    let mut producer = LinePeer::new(far);

    // Handshake: consumer logs in, we accept, it subscribes.
    let login = producer.recv_until("^L,").await;
    assert!(login.contains("consumer"));
    let producer_uuid = Uuid::new_v4();
    producer
        .send_line(
            &Control::LoginAck(LoginAck {
                ok: true,
                compress_mask: 0,
                alert_flag: 0,
                info: AppInfo {
                    app_name: "scripted-producer".to_owned(),
                    app_version: "1.0".to_owned(),
                    core_version: "0".to_owned(),
                    app_uuid: producer_uuid,
                    user_id: None,
                },
            })
            .encode(),
        )
        .await;
    let subscription = producer.recv_until("^RESET").await;
    assert!(subscription.contains("Px"));

    // Stream: v=7, v=8 delivered; v=9 encoded but never sent (the drop);
    // v=10 arrives with a sequence gap.
    let mut tx = SendSequencer::new();
    let f7 = tx.encode(&frame(producer_uuid, 1, 7)).encode();
    let f8 = tx.encode(&frame(producer_uuid, 2, 8)).encode();
    let _dropped = tx.encode(&frame(producer_uuid, 3, 9));
    let f10 = tx.encode(&frame(producer_uuid, 4, 10)).encode();
    producer.send_line(&f7).await;
    producer.send_line(&f8).await;
    producer.send_line(&f10).await;

    // The consumer notices the gap and requests a reset for Px.
    let reset = producer.recv_until("^RESET").await;
    assert!(reset.contains("Px"), "reset request should name the type: {reset}");

    // Replay the current state as a keyframe.
    tx.reset();
    let replay = tx.encode(&frame(producer_uuid, 5, 10));
    assert_eq!(replay.seq, 0, "first frame after reset must be a keyframe");
    producer.send_line(&replay.encode()).await;

    let recovered = rec
        .wait_for(
            |log| {
                log.iter().any(|h| {
                    matches!(h, Happened::Event { values, .. }
                        if values == &vec![FieldValue::Int(10)])
                })
            },
            Duration::from_secs(3),
        )
        .await;
    assert!(recovered, "consumer never recovered: {:?}", rec.log());

    // Delivered values: the pre-gap stream, then the current state.
    // The dropped v=9 never surfaces, and the out-of-sequence v=10 frame
    // was discarded rather than decoded against stale predecessors.
    let values: Vec<i64> = rec
        .log()
        .iter()
        .filter_map(|h| match h {
            Happened::Event { values, .. } => values.first().and_then(FieldValue::as_int),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![7, 8, 10]);

    consumer.shutdown(false).await;
}
