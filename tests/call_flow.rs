//! Integration tests for the p2p video-call state machine: establishment,
//! metadata exchange, busy handling, timeout.

mod common;

use common::{TestClient, TestServer};
use parleyd::auth::AuthLevel;
use parleyd::messages::{ClientNote, ClientPub, ServerMsg};
use parleyd::state::topic::{TopicEvent, VIDEO_CALL_MIME_TYPE};
use parleyd::state::uid::Uid;
use parleyd::store::UserPersistence;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::mpsc;

struct CallRig {
    #[allow(dead_code)]
    server: TestServer,
    topic: String,
    topic_tx: mpsc::Sender<TopicEvent>,
    alice: Uid,
    bob: Uid,
    alice_client: TestClient,
    bob_client: TestClient,
}

async fn call_rig() -> CallRig {
    let server = TestServer::spawn_with_required(&[]).await;
    let alice = Uid::new(0x0a11ce);
    let bob = Uid::new(0xb0b);
    server.seed_user(alice).await;
    server.seed_user(bob).await;
    let topic = server.seed_p2p(alice, bob).await;

    let topic_tx = server.sb.hub.get_or_spawn(&topic).await.expect("topic spawn");

    let alice_client = server.session_as(alice, AuthLevel::Auth);
    let bob_client = server.session_as(bob, AuthLevel::Auth);
    topic_tx
        .send(TopicEvent::Attach {
            uid: alice,
            sess: alice_client.sess.clone(),
        })
        .await
        .unwrap();
    topic_tx
        .send(TopicEvent::Attach {
            uid: bob,
            sess: bob_client.sess.clone(),
        })
        .await
        .unwrap();

    CallRig {
        server,
        topic,
        topic_tx,
        alice,
        bob,
        alice_client,
        bob_client,
    }
}

fn invite_msg(id: &str, topic: &str) -> ClientPub {
    let mut head = HashMap::new();
    head.insert("mime".to_string(), json!(VIDEO_CALL_MIME_TYPE));
    ClientPub {
        id: id.to_string(),
        topic: topic.to_string(),
        head: Some(head),
        content: json!("incoming call"),
    }
}

fn call_note(topic: &str, event: &str, seq: i64, payload: Option<serde_json::Value>) -> ClientNote {
    ClientNote {
        topic: topic.to_string(),
        what: "call".to_string(),
        event: event.to_string(),
        seq,
        payload,
    }
}

async fn send_invite(rig: &mut CallRig) -> i64 {
    rig.topic_tx
        .send(TopicEvent::Publish {
            msg: invite_msg("10", &rig.topic),
            from: rig.alice,
            sess: rig.alice_client.sess.clone(),
        })
        .await
        .unwrap();

    // The invite is saved and broadcast before the ctrl reply.
    let data = rig
        .alice_client
        .recv_until(|m| matches!(m, ServerMsg::Data(_)))
        .await;
    let seq = match data {
        ServerMsg::Data(d) => d.seq,
        _ => unreachable!(),
    };
    let ctrl = rig.alice_client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["seq"], seq);

    // The callee's attached session sees the invite message too.
    let data = rig
        .bob_client
        .recv_until(|m| matches!(m, ServerMsg::Data(_)))
        .await;
    match data {
        ServerMsg::Data(d) => assert_eq!(d.seq, seq),
        _ => unreachable!(),
    }
    seq
}

#[tokio::test]
async fn p2p_call_happy_path() {
    let mut rig = call_rig().await;
    let seq = send_invite(&mut rig).await;

    // Bob's device starts ringing.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "ringing", seq, None),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();

    let info = rig
        .alice_client
        .recv_until(|m| matches!(m, ServerMsg::Info(_)))
        .await;
    match info {
        ServerMsg::Info(i) => {
            assert_eq!(i.what, "call");
            assert_eq!(i.event, "ringing");
            assert_eq!(i.seq, seq);
            assert_eq!(i.from, rig.bob.user_id());
            // The originator addresses the p2p topic by the peer's id.
            assert_eq!(i.topic, rig.bob.user_id());
        }
        _ => unreachable!(),
    }

    // Bob accepts.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "accept", seq, None),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();

    // The replacement data message anchors back to the invite.
    let data = rig
        .bob_client
        .recv_until(|m| matches!(m, ServerMsg::Data(_)))
        .await;
    match data {
        ServerMsg::Data(d) => {
            assert_eq!(d.content, json!("accepted"));
            let head = d.head.expect("replacement head");
            assert_eq!(head["mime"], json!(VIDEO_CALL_MIME_TYPE));
            assert_eq!(head["replace"], json!(format!(":{seq}")));
            assert_eq!(d.from, rig.alice.user_id());
        }
        _ => unreachable!(),
    }

    // The originator sees the second info forward.
    let info = rig
        .alice_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "accept"))
        .await;
    match info {
        ServerMsg::Info(i) => assert_eq!(i.seq, seq),
        _ => unreachable!(),
    }

    // Media metadata flows only to the other party.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "offer", seq, Some(json!({"sdp": "v=0"}))),
            from: rig.alice,
            sess: rig.alice_client.sess.clone(),
        })
        .await
        .unwrap();

    let info = rig
        .bob_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "offer"))
        .await;
    match info {
        ServerMsg::Info(i) => {
            assert_eq!(i.payload, Some(json!({"sdp": "v=0"})));
            assert_eq!(i.from, rig.alice.user_id());
        }
        _ => unreachable!(),
    }
    // Never echoed back to the sender.
    assert!(rig.alice_client.idle());
}

#[tokio::test]
async fn second_invite_is_busy() {
    let mut rig = call_rig().await;
    let seq = send_invite(&mut rig).await;

    // Bob tries to start another call while one is being established.
    rig.topic_tx
        .send(TopicEvent::Publish {
            msg: invite_msg("20", &rig.topic),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();
    let ctrl = rig.bob_client.recv_ctrl().await;
    assert_eq!(ctrl.code, 486);

    // The original call is unaffected: bob can still accept it.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "accept", seq, None),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();
    let info = rig
        .alice_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "accept"))
        .await;
    match info {
        ServerMsg::Info(i) => assert_eq!(i.seq, seq),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn invite_on_group_topic_is_denied() {
    let server = TestServer::spawn_with_required(&[]).await;
    let alice = Uid::new(0x0a11ce);
    server.seed_user(alice).await;

    // A group topic with alice as a full subscriber.
    let now = parleyd::store::types::time_now();
    let name = "grpAAAAAAAAB".to_string();
    server
        .db
        .create_topic(&parleyd::store::types::TopicRecord {
            name: name.clone(),
            created_at: now,
            updated_at: now,
            owner: alice,
            seq_id: 0,
            access: Default::default(),
            public: None,
            tags: Vec::new(),
        })
        .await
        .unwrap();
    server
        .db
        .add_subscription(&parleyd::store::types::Subscription {
            user_id: alice,
            topic: name.clone(),
            created_at: now,
            mode_want: parleyd::state::access::AccessMode::C_FULL,
            mode_given: parleyd::state::access::AccessMode::C_FULL,
            private: None,
            read_seq_id: 0,
            recv_seq_id: 0,
        })
        .await
        .unwrap();

    let topic_tx = server.sb.hub.get_or_spawn(&name).await.unwrap();
    let mut client = server.session_as(alice, AuthLevel::Auth);
    topic_tx
        .send(TopicEvent::Attach {
            uid: alice,
            sess: client.sess.clone(),
        })
        .await
        .unwrap();

    topic_tx
        .send(TopicEvent::Publish {
            msg: invite_msg("30", &name),
            from: alice,
            sess: client.sess.clone(),
        })
        .await
        .unwrap();

    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 403);
}

#[tokio::test]
async fn stale_or_foreign_call_events_are_dropped() {
    let mut rig = call_rig().await;
    let seq = send_invite(&mut rig).await;

    // Wrong seq: dropped silently.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "ringing", seq + 50, None),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();

    // Ringing from the originator's own session: dropped.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "ringing", seq, None),
            from: rig.alice,
            sess: rig.alice_client.sess.clone(),
        })
        .await
        .unwrap();

    // A valid ringing still goes through, proving the drops were silent.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "ringing", seq, None),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();
    let info = rig
        .alice_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "ringing"))
        .await;
    match info {
        ServerMsg::Info(i) => assert_eq!(i.seq, seq),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn hang_up_finishes_established_call() {
    let mut rig = call_rig().await;
    let seq = send_invite(&mut rig).await;

    for event in ["ringing", "accept"] {
        rig.topic_tx
            .send(TopicEvent::CallNote {
                note: call_note(&rig.topic, event, seq, None),
                from: rig.bob,
                sess: rig.bob_client.sess.clone(),
            })
            .await
            .unwrap();
    }
    rig.alice_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "accept"))
        .await;

    // Alice hangs up an established two-party call.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "hang-up", seq, None),
            from: rig.alice,
            sess: rig.alice_client.sess.clone(),
        })
        .await
        .unwrap();

    let data = rig
        .bob_client
        .recv_until(|m| matches!(m, ServerMsg::Data(d) if d.content == json!("finished")))
        .await;
    match data {
        ServerMsg::Data(d) => {
            let head = d.head.expect("replacement head");
            assert_eq!(head["replace"], json!(format!(":{seq}")));
        }
        _ => unreachable!(),
    }
    rig.bob_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "hang-up"))
        .await;

    // The call slot is free again.
    rig.topic_tx
        .send(TopicEvent::Publish {
            msg: invite_msg("40", &rig.topic),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();
    let ctrl = rig.bob_client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let mut rig = call_rig().await;
    let seq = send_invite(&mut rig).await;

    // Nobody answers; the establishment deadline fires and the call is
    // written off as disconnected.
    let data = rig
        .alice_client
        .recv_until(|m| matches!(m, ServerMsg::Data(d) if d.content == json!("disconnected")))
        .await;
    match data {
        ServerMsg::Data(d) => {
            let head = d.head.expect("replacement head");
            assert_eq!(head["mime"], json!(VIDEO_CALL_MIME_TYPE));
            assert_eq!(head["replace"], json!(format!(":{seq}")));
            assert_eq!(d.from, rig.alice.user_id());
        }
        _ => unreachable!(),
    }
    rig.alice_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "hang-up"))
        .await;

    // The topic is idle again: a new invite is accepted.
    rig.topic_tx
        .send(TopicEvent::Publish {
            msg: invite_msg("50", &rig.topic),
            from: rig.alice,
            sess: rig.alice_client.sess.clone(),
        })
        .await
        .unwrap();
    let ctrl = rig.alice_client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["seq"], seq + 2);
}

#[tokio::test]
async fn late_ringing_after_hangup_is_ignored() {
    let mut rig = call_rig().await;
    let seq = send_invite(&mut rig).await;

    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "hang-up", seq, None),
            from: rig.alice,
            sess: rig.alice_client.sess.clone(),
        })
        .await
        .unwrap();
    rig.bob_client
        .recv_until(|m| matches!(m, ServerMsg::Info(i) if i.event == "hang-up"))
        .await;

    // Bob's ringing races the hangup; there is no call to answer anymore.
    rig.topic_tx
        .send(TopicEvent::CallNote {
            note: call_note(&rig.topic, "ringing", seq, None),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();

    // A subsequent invite still works, proving the actor stayed healthy.
    rig.topic_tx
        .send(TopicEvent::Publish {
            msg: invite_msg("60", &rig.topic),
            from: rig.bob,
            sess: rig.bob_client.sess.clone(),
        })
        .await
        .unwrap();
    let ctrl = rig.bob_client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);
}
