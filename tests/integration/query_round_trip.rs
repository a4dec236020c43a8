//! Query round trip with streamed replies.
//!
//! The requester issues a query; the producer of the type answers twice
//! with NEXT and closes with END. The requester sees the replies in that
//! order, a late reply after END is ignored, and an unanswered query
//! expires through `on_expire`.

use std::sync::Arc;
use std::time::Duration;

use meshwire::codec::fields::{FieldCodec, FieldSpec, FieldValue};
use meshwire::core::{ObjectBehavior, QueryObject, QueryReply, QueryState, Runtime, TypeSpec};
use mw_test_utils::{Happened, Recorder, link, wait_until};

fn qy_spec(behavior: Arc<dyn ObjectBehavior>) -> TypeSpec {
    TypeSpec::new("Qy", vec![FieldSpec::new("text", FieldCodec::Str)], behavior).query()
}

fn reply(state: QueryState, text: &str) -> QueryReply {
    QueryReply {
        state,
        values: vec![FieldValue::Str(text.to_owned())],
    }
}

#[tokio::test]
async fn streamed_replies_arrive_in_order_and_stop_at_end() {
    let answers = Recorder::new();
    answers.script_replies(vec![
        reply(QueryState::Next, "row-1"),
        reply(QueryState::Next, "row-2"),
        reply(QueryState::End, "done"),
    ]);
    let producer = Runtime::builder()
        .app("producer", "1.0")
        .register(qy_spec(answers.clone()))
        .produce("Qy")
        .build()
        .unwrap();
    producer.start().unwrap();

    let asker = Recorder::new();
    let requester = Runtime::builder()
        .app("requester", "1.0")
        .register(qy_spec(asker.clone()))
        .build()
        .unwrap();
    requester.start().unwrap();

    let (r_up, p_down) = link(&requester, &producer, "rp");
    assert!(
        wait_until(|| r_up.logged_in() && p_down.logged_in(), Duration::from_secs(3)).await
    );

    let query_id = requester
        .query("Qy", vec![FieldValue::Str("lookup".to_owned())], Duration::from_secs(10))
        .await
        .unwrap();

    let all_replies = asker
        .wait_for(
            |log| {
                log.iter()
                    .filter(|h| matches!(h, Happened::Reply { .. }))
                    .count()
                    == 3
            },
            Duration::from_secs(3),
        )
        .await;
    assert!(all_replies, "replies never arrived: {:?}", asker.log());

    // NEXT, NEXT, END, in that order.
    let states: Vec<QueryState> = asker
        .log()
        .iter()
        .filter_map(|h| match h {
            Happened::Reply { query_id: qid, state } if *qid == query_id => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![QueryState::Next, QueryState::Next, QueryState::End]);
    assert_eq!(
        answers.count(|h| matches!(h, Happened::Enquire { .. })),
        1,
        "producer should have been asked exactly once"
    );

    // A straggler reply after END is ignored.
    let late = QueryObject {
        type_code: "Qy".to_owned(),
        requester: requester.uuid(),
        query_id,
        state: QueryState::Query,
        values: Vec::new(),
        ts: chrono::Utc::now(),
        urgent: false,
    };
    producer
        .reply(&late, QueryState::Next, vec![FieldValue::Str("too-late".to_owned())])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let count_after = asker.count(|h| matches!(h, Happened::Reply { .. }));
    assert_eq!(count_after, 3, "late reply must be ignored");

    producer.shutdown(false).await;
    requester.shutdown(false).await;
}

#[tokio::test]
async fn unanswered_queries_expire() {
    let asker = Recorder::new();
    let requester = Runtime::builder()
        .app("requester", "1.0")
        .register(qy_spec(asker.clone()))
        .build()
        .unwrap();
    requester.start().unwrap();

    // Nobody is connected; the query can only expire.
    let query_id = requester
        .query("Qy", vec![FieldValue::Str("void".to_owned())], Duration::from_millis(200))
        .await
        .unwrap();

    let expired = asker
        .wait_for(
            |log| {
                log.iter()
                    .any(|h| matches!(h, Happened::Expired { query_id: qid } if *qid == query_id))
            },
            Duration::from_secs(2),
        )
        .await;
    assert!(expired, "query never expired: {:?}", asker.log());

    requester.shutdown(false).await;
}
