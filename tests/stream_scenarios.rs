//! End-to-end stream scenarios over the in-memory transport: the full
//! negotiation sequence, conflict policies, size limits, blocking,
//! offline handling and routing edge cases.

mod common;

use common::{login, plain_credentials, TestServer, STREAM_OPEN};
use heron_xmpp::{C2sConfig, ResourceConflictPolicy, Storage};

/// Minimal PLAIN login: open, STARTTLS, open, SASL, open, bind, session.
#[tokio::test]
async fn minimal_plain_login() {
    let server = TestServer::new().await;
    let mut client = server.connect();

    client.send(STREAM_OPEN);
    let features = client.expect("</stream:features>").await;
    assert!(features.contains("<starttls"));
    assert!(features.contains("<required/>"));
    // mechanisms are withheld until the stream is secured
    assert!(!features.contains("<mechanisms"));

    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    client.expect("<proceed").await;
    assert!(client.is_secured());

    client.send(STREAM_OPEN);
    let features = client.expect("</stream:features>").await;
    assert!(features.contains("<mechanisms"));
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));
    assert!(!features.contains("<starttls"));

    client.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
        plain_credentials("alice", "s3cret")
    ));
    client.expect("<success").await;

    client.send(STREAM_OPEN);
    let features = client.expect("</stream:features>").await;
    assert!(features.contains("<bind"));
    assert!(features.contains("<session"));

    client.send(
        "<iq id='b1' type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>",
    );
    let bind_result = client.expect("</jid>").await;
    assert!(bind_result.contains("<jid>alice@localhost/"));

    client.send(
        "<iq id='s1' type='set'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
    );
    client.expect_all(&["id='s1'", "type='result'"]).await;

    // the session is live: a ping round trip works
    client.send("<iq id='p1' type='get'><ping xmlns='urn:xmpp:ping'/></iq>");
    client.expect_all(&["id='p1'", "type='result'"]).await;
}

/// Wrong credentials fail the exchange and leave the stream usable.
#[tokio::test]
async fn plain_login_bad_password() {
    let server = TestServer::new().await;
    let mut client = server.connect();

    client.send(STREAM_OPEN);
    client.expect("<starttls").await;
    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    client.expect("<proceed").await;
    client.send(STREAM_OPEN);
    client.expect("PLAIN").await;

    client.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
        plain_credentials("alice", "wrong")
    ));
    let failure = client.expect("</failure>").await;
    assert!(failure.contains("<not-authorized/>"));
    assert!(!client.is_closed());

    // a second attempt with the right password succeeds
    client.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
        plain_credentials("alice", "s3cret")
    ));
    client.expect("<success").await;
}

/// An unknown mechanism is refused without closing the stream.
#[tokio::test]
async fn unknown_sasl_mechanism() {
    let server = TestServer::new().await;
    let mut client = server.connect();

    client.send(STREAM_OPEN);
    client.expect("<starttls").await;
    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    client.expect("<proceed").await;
    client.send(STREAM_OPEN);
    client.expect("</stream:features>").await;

    client.send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='X-MAGIC'>AA==</auth>");
    let failure = client.expect("</failure>").await;
    assert!(failure.contains("<invalid-mechanism/>"));
    assert!(!client.is_closed());
}

/// Resource conflict with the `replace` policy: the first session is torn
/// down with `resource-constraint` and the second bind succeeds.
#[tokio::test]
async fn resource_conflict_replace() {
    let cfg = C2sConfig {
        resource_conflict: ResourceConflictPolicy::Replace,
        ..C2sConfig::default()
    };
    let server = TestServer::with_config(cfg).await;

    let mut first = server.connect();
    let jid = login(&mut first, "alice", "s3cret", Some("home")).await;
    assert_eq!(jid, "alice@localhost/home");

    let mut second = server.connect();
    let jid = login(&mut second, "alice", "s3cret", Some("home")).await;
    assert_eq!(jid, "alice@localhost/home");

    first.expect("<resource-constraint").await;
    first.expect_closed().await;
    assert!(!second.is_closed());
}

/// Resource conflict with the default `disallow` policy: the second bind
/// is refused with `<conflict/>`, twice, and its stream stays usable.
#[tokio::test]
async fn resource_conflict_disallow() {
    let server = TestServer::new().await;

    let mut first = server.connect();
    login(&mut first, "alice", "s3cret", Some("home")).await;

    let mut second = server.connect();
    second.send(STREAM_OPEN);
    second.expect("<starttls").await;
    second.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    second.expect("<proceed").await;
    second.send(STREAM_OPEN);
    second.expect("PLAIN").await;
    second.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
        plain_credentials("alice", "s3cret")
    ));
    second.expect("<success").await;
    second.send(STREAM_OPEN);
    second.expect("<bind").await;

    for attempt in ["c1", "c2"] {
        second.send(&format!(
            "<iq id='{}' type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>home</resource></bind></iq>",
            attempt
        ));
        let reply = second.expect("</iq>").await;
        assert!(reply.contains("<conflict"));
        assert!(reply.contains("type='error'"));
    }
    assert!(!second.is_closed());

    // binding a different resource still works on the same stream
    second.send(
        "<iq id='c3' type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>work</resource></bind></iq>",
    );
    let reply = second.expect("</jid>").await;
    assert!(reply.contains("alice@localhost/work"));
}

/// A stanza exceeding `max_stanza_size` is a policy violation.
#[tokio::test]
async fn oversized_stanza() {
    let cfg = C2sConfig {
        max_stanza_size: 512,
        ..C2sConfig::default()
    };
    let server = TestServer::with_config(cfg).await;
    let mut client = server.connect();
    login(&mut client, "alice", "s3cret", Some("home")).await;

    let body = "x".repeat(600);
    client.send(&format!(
        "<message to='bob@localhost' type='chat'><body>{}</body></message>",
        body
    ));
    client.expect("<policy-violation").await;
    client.expect("</stream:stream>").await;
    client.expect_closed().await;
}

/// Message to an account with no bound streams is archived offline, with
/// no error back to the sender.
#[tokio::test]
async fn message_to_offline_user_is_archived() {
    let server = TestServer::new().await;
    let mut client = server.connect();
    login(&mut client, "alice", "s3cret", Some("home")).await;

    client.send("<message to='bob@localhost' type='chat'><body>hi</body></message>");

    let deadline = tokio::time::Instant::now() + common::WAIT_TIMEOUT;
    loop {
        if server.storage.count_offline_messages("bob").await.unwrap() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message was never archived"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    client.assert_absent("type='error'");

    let stored = server.storage.fetch_offline_messages("bob").await.unwrap();
    assert!(stored[0].get_child("delay", "urn:xmpp:delay").is_some());
}

/// A stanza to a blocked JID is bounced with `not-acceptable` carrying
/// the blocked marker, and never routed.
#[tokio::test]
async fn blocked_recipient() {
    let server = TestServer::new().await;
    server
        .storage
        .insert_or_update_user(&heron_xmpp::User::new("carol", "pw"))
        .await
        .unwrap();
    server
        .storage
        .insert_blocklist_items("alice", &["carol@localhost".to_string()])
        .await
        .unwrap();

    let mut carol = server.connect();
    login(&mut carol, "carol", "pw", Some("desk")).await;

    let mut alice = server.connect();
    login(&mut alice, "alice", "s3cret", Some("home")).await;

    alice.send("<message id='m1' to='carol@localhost' type='chat'><body>hello?</body></message>");
    let reply = alice
        .expect_all(&[
            "not-acceptable",
            "blocked xmlns='urn:xmpp:blocking:errors'",
            "type='error'",
        ])
        .await;
    assert!(reply.contains("<body>hello?</body>"));

    // carol never sees it
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    carol.assert_absent("hello?");
}

/// IQ addressed to an unbound resource of a bound account.
#[tokio::test]
async fn iq_to_unknown_local_resource() {
    let server = TestServer::new().await;

    let mut bob = server.connect();
    login(&mut bob, "bob", "hunter2", Some("desktop")).await;

    let mut alice = server.connect();
    login(&mut alice, "alice", "s3cret", Some("home")).await;

    alice.send(
        "<iq id='q1' type='get' to='bob@localhost/phone'><ping xmlns='urn:xmpp:ping'/></iq>",
    );
    let reply = alice
        .expect_all(&["id='q1'", "type='error'", "service-unavailable"])
        .await;
    assert!(!reply.is_empty());
}

/// Messages route between two established sessions.
#[tokio::test]
async fn message_routing_between_sessions() {
    let server = TestServer::new().await;

    let mut bob = server.connect();
    login(&mut bob, "bob", "hunter2", Some("desktop")).await;

    let mut alice = server.connect();
    login(&mut alice, "alice", "s3cret", Some("home")).await;

    alice.send("<message to='bob@localhost' type='chat'><body>ping!</body></message>");
    let delivered = bob.expect("<body>ping!</body>").await;
    assert!(delivered.contains("from='alice@localhost/home'"));
}

/// A full-JID message to a missing resource retries once against the
/// bare JID and reaches the bound resource.
#[tokio::test]
async fn message_retries_bare_jid_after_resource_miss() {
    let server = TestServer::new().await;

    let mut bob = server.connect();
    login(&mut bob, "bob", "hunter2", Some("desktop")).await;

    let mut alice = server.connect();
    login(&mut alice, "alice", "s3cret", Some("home")).await;

    alice.send("<message to='bob@localhost/phone' type='chat'><body>anyone?</body></message>");
    bob.expect("<body>anyone?</body>").await;
}

/// Stream open addressed to a foreign domain.
#[tokio::test]
async fn stream_open_host_unknown() {
    let server = TestServer::new().await;
    let mut client = server.connect();

    client.send("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='evil.example' version='1.0'>");
    client.expect("<host-unknown").await;
    client.expect_closed().await;
}

/// Stream open with an unsupported version.
#[tokio::test]
async fn stream_open_unsupported_version() {
    let server = TestServer::new().await;
    let mut client = server.connect();

    client.send("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='localhost' version='0.9'>");
    client.expect("<unsupported-version").await;
    client.expect_closed().await;
}

/// Stanzas before authentication close the stream with `not-authorized`.
#[tokio::test]
async fn stanza_before_authentication() {
    let server = TestServer::new().await;
    let mut client = server.connect();

    client.send(STREAM_OPEN);
    client.expect("<starttls").await;
    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    client.expect("<proceed").await;
    client.send(STREAM_OPEN);
    client.expect("</stream:features>").await;

    client.send("<message to='bob@localhost'><body>sneaky</body></message>");
    client.expect("<not-authorized").await;
    client.expect_closed().await;
}

/// Legacy jabber:iq:auth is answered with service-unavailable instead of
/// tearing the stream down.
#[tokio::test]
async fn legacy_auth_is_refused() {
    let server = TestServer::new().await;
    let mut client = server.connect();

    client.send(STREAM_OPEN);
    client.expect("<starttls").await;
    client.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    client.expect("<proceed").await;
    client.send(STREAM_OPEN);
    client.expect("</stream:features>").await;

    client.send(
        "<iq id='auth1' type='get'><query xmlns='jabber:iq:auth'><username>alice</username></query></iq>",
    );
    client
        .expect_all(&["id='auth1'", "type='error'", "service-unavailable"])
        .await;
    assert!(!client.is_closed());
}

/// Offline messages are delivered exactly once, on the first available
/// presence with non-negative priority.
#[tokio::test]
async fn offline_delivery_is_latched() {
    let server = TestServer::new().await;
    let mut alice = server.connect();
    login(&mut alice, "alice", "s3cret", Some("home")).await;
    alice.send("<message to='bob@localhost' type='chat'><body>stored</body></message>");

    let deadline = tokio::time::Instant::now() + common::WAIT_TIMEOUT;
    while server.storage.count_offline_messages("bob").await.unwrap() == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let mut bob = server.connect();
    login(&mut bob, "bob", "hunter2", Some("desktop")).await;
    bob.send("<presence/>");
    bob.expect("<body>stored</body>").await;
    assert_eq!(server.storage.count_offline_messages("bob").await.unwrap(), 0);

    // a second initial presence must not redeliver
    bob.send("<presence/>");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    bob.assert_absent("<body>stored</body>");
}

/// On disconnect with an available presence, subscribers see an
/// unavailable broadcast before the transport closes.
#[tokio::test]
async fn unavailable_broadcast_on_disconnect() {
    let server = TestServer::new().await;

    // bob is subscribed to alice's presence
    server
        .storage
        .insert_or_update_roster_item(&heron_xmpp::RosterItem {
            username: "alice".to_string(),
            jid: "bob@localhost".to_string(),
            name: None,
            subscription: heron_xmpp::Subscription::Both,
            ask: false,
            groups: vec![],
        })
        .await
        .unwrap();

    let mut bob = server.connect();
    login(&mut bob, "bob", "hunter2", Some("desktop")).await;

    let mut alice = server.connect();
    login(&mut alice, "alice", "s3cret", Some("home")).await;
    alice.send("<presence/>");

    // bob sees alice come online
    bob.expect_all(&["<presence", "from='alice@localhost/home'"]).await;

    alice.hang_up();
    bob.expect_all(&["type='unavailable'", "from='alice@localhost/home'"])
        .await;
    alice.expect_closed().await;
}

/// Logout bookkeeping: the user record is stamped on disconnect, and an
/// unavailable status string is persisted.
#[tokio::test]
async fn logout_info_is_persisted() {
    let server = TestServer::new().await;
    let mut client = server.connect();
    login(&mut client, "alice", "s3cret", Some("home")).await;

    client.send("<presence/>");
    client.send("<presence type='unavailable'><status>brb</status></presence>");
    client.send("</stream:stream>");
    client.expect_closed().await;

    let user = server.storage.fetch_user("alice").await.unwrap().unwrap();
    assert!(user.logged_out_at.is_some());
    assert_eq!(user.logged_out_status.as_deref(), Some("brb"));
}

/// Subscription requests to an offline local user are queued and played
/// back on the target's first presence, exactly once.
#[tokio::test]
async fn pending_subscription_delivery() {
    let server = TestServer::new().await;

    let mut alice = server.connect();
    login(&mut alice, "alice", "s3cret", Some("home")).await;
    alice.send("<presence to='bob@localhost' type='subscribe'/>");

    let deadline = tokio::time::Instant::now() + common::WAIT_TIMEOUT;
    while server
        .storage
        .fetch_pending_notifications("bob")
        .await
        .unwrap()
        .is_empty()
    {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let mut bob = server.connect();
    login(&mut bob, "bob", "hunter2", Some("desktop")).await;
    bob.send("<presence/>");
    bob.expect_all(&["type='subscribe'", "from='alice@localhost'"]).await;
}
