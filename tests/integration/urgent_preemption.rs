//! Urgent preemption under backlog.
//!
//! A scripted consumer subscribes but does not read, so the producer's
//! send queue backs up behind a tiny transport pipe. An urgent commit
//! made at the back of that backlog must still leave the node near the
//! front of the stream once the consumer starts draining.

use std::sync::Arc;
use std::time::Duration;

use meshwire::codec::fields::{FieldCodec, FieldSpec, FieldValue};
use meshwire::codec::timefmt;
use meshwire::core::{ObjectBehavior, Runtime, TypeSpec};
use meshwire::protocol::Control;
use meshwire::protocol::control::{AppInfo, Login, ResetRequest, Role};
use mw_test_utils::LinePeer;
use uuid::Uuid;

fn spec(code: &str, urgent: bool, behavior: Arc<dyn ObjectBehavior>) -> TypeSpec {
    let spec = TypeSpec::new(code, vec![FieldSpec::new("s", FieldCodec::Str)], behavior);
    if urgent { spec.urgent() } else { spec }
}

#[tokio::test]
async fn urgent_commit_overtakes_a_backlog_of_normal_items() {
    let producer = Runtime::builder()
        .app("producer", "1.0")
        .register(spec("Nx", false, Arc::new(meshwire::core::DefaultBehavior)))
        .register(spec("Ux", true, Arc::new(meshwire::core::DefaultBehavior)))
        .produce("Nx")
        .produce("Ux")
        .build()
        .unwrap();
    producer.start().unwrap();

    // Tiny pipe: the writer blocks early and the backlog stays queued.
    let (near, far) = tokio::io::duplex(4 * 1024);
    let peer = producer.serve("consumer-link", Box::new(near));
    let mut consumer = LinePeer::new(Box::new(far) as meshwire::core::BoxTransport);

    // Handshake as a consumer of both types.
    let consumer_uuid = Uuid::new_v4();
    consumer
        .send_line(
            &Control::Login(Login {
                role: Role::Consumer,
                compress_mask: 0,
                alert_flag: 0,
                info: AppInfo {
                    app_name: "scripted-consumer".to_owned(),
                    app_version: "1.0".to_owned(),
                    core_version: "0".to_owned(),
                    app_uuid: consumer_uuid,
                    user_id: None,
                },
            })
            .encode(),
        )
        .await;
    consumer.recv_until("^LA").await;
    let now = timefmt::format_ts(chrono::Utc::now());
    consumer
        .send_line(
            &Control::Reset(ResetRequest {
                types: vec!["Nx".to_owned(), "Ux".to_owned()],
                ts: now.clone(),
                reset_seq: 1,
                requester: consumer_uuid,
                target: None,
                deploy_time: now,
                origin: consumer_uuid,
                params: String::new(),
                app_name: "scripted-consumer".to_owned(),
                app_version: "1.0".to_owned(),
                core_version: "0".to_owned(),
                remote_addr: String::new(),
            })
            .encode(),
        )
        .await;

    assert!(
        mw_test_utils::wait_until(
            || peer.wants_type("Nx").is_some() && peer.wants_type("Ux").is_some(),
            Duration::from_secs(3),
        )
        .await,
        "subscription never registered"
    );

    // Build a backlog far larger than the pipe without reading a byte.
    let payload = "x".repeat(256);
    const BACKLOG: usize = 1500;
    for i in 0..BACKLOG {
        let id = format!("n{i}");
        producer
            .update("Nx", &[&id], vec![FieldValue::Str(payload.clone())])
            .unwrap();
        producer.commit("Nx", &[&id]).await.unwrap();
        if i % 100 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // The urgent commit goes to the front of whatever is still queued.
    producer
        .update("Ux", &["now"], vec![FieldValue::Str("urgent".to_owned())])
        .unwrap();
    producer.commit("Ux", &["now"]).await.unwrap();

    // Drain and find the urgent frame.
    let mut normals_before_urgent = 0usize;
    let mut seen_urgent_line = None;
    for _ in 0..(BACKLOG + 50) {
        let Some(line) = consumer.recv_line().await else { break };
        if line.starts_with("#Ux") {
            seen_urgent_line = Some(line);
            break;
        }
        if line.starts_with("$Nx") {
            normals_before_urgent += 1;
        }
    }

    let urgent_line = seen_urgent_line.expect("urgent frame never arrived");
    assert!(urgent_line.starts_with('#'), "urgent frames carry the # prefix");
    assert!(
        normals_before_urgent < BACKLOG / 2,
        "urgent frame should overtake the bulk of the backlog \
         ({normals_before_urgent} of {BACKLOG} normal frames came first)"
    );

    producer.shutdown(false).await;
}
