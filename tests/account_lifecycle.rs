//! Integration tests for the account lifecycle: creation with login,
//! duplicate secrets, required credentials, credential updates, deletion.

mod common;

use common::TestServer;
use parleyd::auth::AuthLevel;
use parleyd::handlers::account;
use parleyd::messages::{ClientAcc, ClientCred, ClientDel, SetDesc};
use parleyd::state::uid::Uid;
use parleyd::store::UserPersistence;

fn create_msg(login: bool) -> ClientAcc {
    ClientAcc {
        id: "100".to_string(),
        user: "new".to_string(),
        scheme: "basic".to_string(),
        secret: b"alice:pw".to_vec(),
        login,
        tags: vec!["alice".to_string()],
        cred: vec![ClientCred {
            method: "email".to_string(),
            value: "a@x.com".to_string(),
            response: "123456".to_string(),
            params: None,
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn create_login_happy_path() {
    let server = TestServer::spawn().await;
    let mut client = server.session();

    account::create_user(&server.sb, &client.sess, &create_msg(true)).await;

    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 201, "expected created, got {}: {}", ctrl.code, ctrl.text);

    let params = ctrl.params.expect("created reply carries params");
    assert_eq!(params["authlvl"], "auth");
    assert_eq!(params["desc"]["defaultAcs"]["auth"], "JRWPA");
    assert_eq!(params["desc"]["defaultAcs"]["anon"], "N");
    assert!(params["token"].is_string(), "login-on-create returns a token");
    // All required credentials were validated in this call.
    assert!(params.get("cred").is_none());

    // The session is now authenticated as the new user.
    let uid = Uid::parse_user_id(params["user"].as_str().unwrap()).expect("user id");
    assert_eq!(client.sess.uid(), uid);
    assert_eq!(client.sess.auth_lvl(), AuthLevel::Auth);

    // The credential-derived and login-derived tags were persisted.
    let user = server.db.get_user(uid).await.unwrap().expect("user exists");
    assert!(user.tags.contains(&"email:a@x.com".to_string()));
    assert!(user.tags.contains(&"basic:alice".to_string()));
    assert!(user.tags.contains(&"alice".to_string()));

    // And the credential itself is validated.
    let creds = server.db.get_all_creds(uid, true).await.unwrap();
    assert_eq!(creds.len(), 1);
    assert_eq!(creds[0].value, "a@x.com");
}

#[tokio::test]
async fn create_duplicate_secret_persists_nothing() {
    let server = TestServer::spawn().await;

    let mut first = server.session();
    account::create_user(&server.sb, &first.sess, &create_msg(false)).await;
    assert_eq!(first.recv_ctrl().await.code, 201);

    let first_rec = server
        .db
        .get_auth_record("basic", "alice")
        .await
        .unwrap()
        .expect("auth record");

    // Same secret again: rejected before anything is written.
    let mut second = server.session();
    let mut msg = create_msg(false);
    msg.cred[0].value = "b@x.com".to_string();
    account::create_user(&server.sb, &second.sess, &msg).await;

    let ctrl = second.recv_ctrl().await;
    assert_eq!(ctrl.code, 409);
    assert!(!second.sess.is_authenticated());

    // The original record is untouched and no second user appeared.
    let rec = server
        .db
        .get_auth_record("basic", "alice")
        .await
        .unwrap()
        .expect("auth record survives");
    assert_eq!(rec.uid, first_rec.uid);
    assert!(server.db.get_user_by_cred("email", "b@x.com").await.unwrap().is_none());
}

#[tokio::test]
async fn create_missing_required_credential_rolls_back() {
    let server = TestServer::spawn_with_required(&["email", "tel"]).await;
    let mut client = server.session();

    // Only the email credential is supplied; tel is required too.
    account::create_user(&server.sb, &client.sess, &create_msg(false)).await;

    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 422);
    let params = ctrl.params.expect("policy reply lists missing methods");
    assert_eq!(params["creds"].as_array().unwrap().len(), 1);
    assert_eq!(params["creds"][0], "tel");

    // The provisional user was removed.
    let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE deleted_at IS NULL")
        .fetch_one(server.db.pool())
        .await
        .unwrap();
    assert_eq!(live, 0);
}

#[tokio::test]
async fn create_rejects_restricted_tags() {
    let server = TestServer::spawn().await;
    let mut client = server.session();

    let mut msg = create_msg(false);
    msg.tags.push("email:spoofed@x.com".to_string());
    account::create_user(&server.sb, &client.sess, &msg).await;

    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 403);
    assert_eq!(ctrl.params.unwrap()["what"], "tags");
}

#[tokio::test]
async fn create_applies_clamped_default_access() {
    let server = TestServer::spawn().await;
    let mut client = server.session();

    let mut msg = create_msg(false);
    msg.desc = Some(SetDesc {
        default_acs: Some(parleyd::messages::DefaultAcsText {
            auth: "JRWSDO".to_string(),
            anon: "".to_string(),
        }),
        public: None,
        private: None,
    });
    account::create_user(&server.sb, &client.sess, &msg).await;

    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 201);
    // Clamped to the p2p bits, with approve forced in.
    assert_eq!(ctrl.params.unwrap()["desc"]["defaultAcs"]["auth"], "JRWA");
}

#[tokio::test]
async fn login_with_created_account() {
    let server = TestServer::spawn().await;

    let mut creator = server.session();
    account::create_user(&server.sb, &creator.sess, &create_msg(false)).await;
    assert_eq!(creator.recv_ctrl().await.code, 201);
    assert!(!creator.sess.is_authenticated());

    let mut client = server.session();
    account::login(&server.sb, &client.sess, "5", "basic", b"alice:pw").await;
    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);
    assert!(client.sess.is_authenticated());
    assert_eq!(client.sess.auth_lvl(), AuthLevel::Auth);

    // Wrong password is a credentials failure.
    let mut other = server.session();
    account::login(&server.sb, &other.sess, "6", "basic", b"alice:nope").await;
    assert_eq!(other.recv_ctrl().await.code, 401);
    assert!(!other.sess.is_authenticated());
}

#[tokio::test]
async fn update_creds_validates_pending_credential() {
    let server = TestServer::spawn_with_required(&["email", "tel"]).await;
    let mut client = server.session();

    // Create with email validated in place and tel left pending.
    let mut msg = create_msg(true);
    msg.cred.push(ClientCred {
        method: "tel".to_string(),
        value: "+15551234567".to_string(),
        response: String::new(),
        params: None,
    });
    account::create_user(&server.sb, &client.sess, &msg).await;
    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 201);
    let params = ctrl.params.unwrap();
    assert_eq!(params["cred"][0], "tel", "tel still awaits confirmation");
    let uid = client.sess.uid();

    // Wrong response keeps the credential unvalidated but succeeds softly.
    let update = ClientAcc {
        id: "101".to_string(),
        cred: vec![ClientCred {
            method: "tel".to_string(),
            response: "000000".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    account::update_user(&server.sb, &client.sess, &update).await;
    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);
    assert_eq!(ctrl.params.unwrap()["cred"][0], "tel");

    // The right response confirms it; no methods remain missing.
    let update = ClientAcc {
        id: "102".to_string(),
        cred: vec![ClientCred {
            method: "tel".to_string(),
            response: "123456".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    account::update_user(&server.sb, &client.sess, &update).await;
    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);
    assert!(ctrl.params.is_none());

    let user = server.db.get_user(uid).await.unwrap().unwrap();
    assert!(user.tags.contains(&"tel:+15551234567".to_string()));
}

#[tokio::test]
async fn delete_cred_keeps_last_required_credential() {
    let server = TestServer::spawn().await;
    let mut client = server.session();
    account::create_user(&server.sb, &client.sess, &create_msg(true)).await;
    assert_eq!(client.recv_ctrl().await.code, 201);
    let uid = client.sess.uid();

    let cred = ClientCred {
        method: "email".to_string(),
        value: "a@x.com".to_string(),
        ..Default::default()
    };
    let err = account::delete_cred(&server.sb, uid, AuthLevel::Auth, &cred)
        .await
        .unwrap_err();
    assert_eq!(err, parleyd::error::StoreError::Policy);
    assert_eq!(server.db.get_all_creds(uid, true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_user_evicts_and_removes() {
    let server = TestServer::spawn().await;

    let mut client = server.session();
    account::create_user(&server.sb, &client.sess, &create_msg(true)).await;
    assert_eq!(client.recv_ctrl().await.code, 201);
    let uid = client.sess.uid();

    // A second session of the same user gets evicted; the requester stays
    // long enough to read the reply.
    let mut other = server.session_as(uid, AuthLevel::Auth);

    let del = ClientDel {
        id: "200".to_string(),
        user: String::new(),
        hard: false,
    };
    account::delete_user(&server.sb, &client.sess, &del).await;

    let ctrl = client.recv_ctrl().await;
    assert_eq!(ctrl.code, 200);

    // The other session received the eviction farewell on its stop channel.
    let farewell = other.stop_rx.recv().await.expect("stop signal");
    assert_eq!(farewell.unwrap().as_ctrl().unwrap().code, 205);

    // The requester was stopped after the reply.
    let farewell = client.stop_rx.recv().await.expect("stop signal");
    assert_eq!(farewell.unwrap().as_ctrl().unwrap().code, 205);

    // The account is gone, along with its login.
    assert!(server.db.get_user(uid).await.unwrap().is_none());
    assert!(server.db.get_auth_record("basic", "alice").await.unwrap().is_none());
}

#[tokio::test]
async fn non_root_cannot_delete_another_user() {
    let server = TestServer::spawn().await;

    let mut owner = server.session();
    account::create_user(&server.sb, &owner.sess, &create_msg(true)).await;
    assert_eq!(owner.recv_ctrl().await.code, 201);
    let victim = owner.sess.uid();

    let mut attacker = server.session_as(Uid::new(987654), AuthLevel::Auth);
    let del = ClientDel {
        id: "201".to_string(),
        user: victim.user_id(),
        hard: true,
    };
    account::delete_user(&server.sb, &attacker.sess, &del).await;
    assert_eq!(attacker.recv_ctrl().await.code, 403);
    assert!(server.db.get_user(victim).await.unwrap().is_some());
}
