//! Store-backed backend tests. Require a live, disposable Redis; see
//! `common/mod.rs`.

mod common;

use std::{collections::BTreeMap, time::Duration};

use marmot_server::{
    backend::Pull,
    client::ListenParams,
    config::{ChannelConfig, ServerConfig},
    crypto,
};
use redis::{streams::StreamRangeReply, AsyncCommands};

fn channel_config(whistlers: &[&str], listeners: &[&str]) -> ChannelConfig {
    ChannelConfig {
        whistlers: whistlers.iter().map(|s| s.to_string()).collect(),
        listeners: listeners.iter().map(|s| s.to_string()).collect(),
    }
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn add_listener_initializes_cursor_to_last_generated_id() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();
    let channel = common::unique("chan");
    let listener = common::unique("bob");

    backend
        .add_channel(&channel, &ChannelConfig::default())
        .await
        .unwrap();
    for n in 0..3 {
        backend
            .push(&common::message(&channel, &format!("historical {n}")))
            .await
            .unwrap();
    }
    backend.add_listener(&channel, &listener).await.unwrap();

    let mut conn = common::store().await;
    let cursor: String = conn
        .hget(format!("marmot::{channel}::listeners"), &listener)
        .await
        .unwrap();
    let info: redis::streams::StreamInfoStreamReply = conn
        .xinfo_stream(format!("marmot::{channel}::stream"))
        .await
        .unwrap();
    assert_eq!(cursor, info.last_generated_id);

    // enrollment never exposes historical messages
    let mut reader = backend
        .reader()
        .await
        .unwrap()
        .block(Duration::from_millis(100));
    match reader.pull(&listener, &[channel.clone()]).await.unwrap() {
        Pull::Batch(batch) => assert!(batch.is_empty()),
        Pull::Unsubscribed => panic!("listener should hold a cursor"),
    }

    backend.remove_channel(&channel).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn trim_keeps_everything_newer_than_the_minimum_cursor() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();
    let channel = common::unique("chan");
    let slow = common::unique("slow");
    let fast = common::unique("fast");

    backend
        .add_channel(&channel, &channel_config(&[], &[&slow, &fast]))
        .await
        .unwrap();
    let mut ids = Vec::new();
    for n in 0..10 {
        ids.push(
            backend
                .push(&common::message(&channel, &format!("msg {n}")))
                .await
                .unwrap(),
        );
    }
    backend.ack(&channel, &slow, &ids[2]).await.unwrap();
    backend.ack(&channel, &fast, &ids[6]).await.unwrap();

    // candidates: the sentinel plus the two entries before the slow cursor
    let count = backend.trim(&channel).await.unwrap();
    assert_eq!(count, Some(3));

    let mut conn = common::store().await;
    let key = format!("marmot::{channel}::stream");
    let len: usize = conn.xlen(&key).await.unwrap();
    assert_eq!(len, 8);
    let range: StreamRangeReply = conn.xrange(&key, "-", "+").await.unwrap();
    assert_eq!(range.ids.first().unwrap().id, ids[2]);

    backend.remove_channel(&channel).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn trim_without_listeners_truncates_to_a_single_entry() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();
    let channel = common::unique("chan");
    let listener = common::unique("late");

    backend
        .add_channel(&channel, &ChannelConfig::default())
        .await
        .unwrap();
    for n in 0..5 {
        backend
            .push(&common::message(&channel, &format!("msg {n}")))
            .await
            .unwrap();
    }
    assert_eq!(backend.trim(&channel).await.unwrap(), None);

    let mut conn = common::store().await;
    let len: usize = conn
        .xlen(format!("marmot::{channel}::stream"))
        .await
        .unwrap();
    assert_eq!(len, 1);

    // a listener enrolled after the truncation starts at the surviving entry
    backend.add_listener(&channel, &listener).await.unwrap();
    let mut reader = backend
        .reader()
        .await
        .unwrap()
        .block(Duration::from_millis(100));
    match reader.pull(&listener, &[channel.clone()]).await.unwrap() {
        Pull::Batch(batch) => assert!(batch.is_empty()),
        Pull::Unsubscribed => panic!("listener should hold a cursor"),
    }

    backend.remove_channel(&channel).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn remove_client_cascades_through_every_channel() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();
    let guid = common::unique("gone");
    let first = common::unique("chan");
    let second = common::unique("chan");

    let pubkey = crypto::dump_public_key(&crypto::generate_private_key().verifying_key()).unwrap();
    backend.add_client(&guid, &pubkey).await.unwrap();
    for channel in [&first, &second] {
        backend
            .add_channel(channel, &channel_config(&[&guid], &[&guid]))
            .await
            .unwrap();
    }

    backend.remove_client(&guid).await.unwrap();

    let mut conn = common::store().await;
    let registered: bool = conn.hexists("marmot::clients", &guid).await.unwrap();
    assert!(!registered);
    for channel in [&first, &second] {
        let listening: bool = conn
            .hexists(format!("marmot::{channel}::listeners"), &guid)
            .await
            .unwrap();
        assert!(!listening, "cursor left behind in {channel}");
        let whistling: bool = conn
            .sismember(format!("marmot::{channel}::whistlers"), &guid)
            .await
            .unwrap();
        assert!(!whistling, "whistler left behind in {channel}");
    }

    for channel in [&first, &second] {
        backend.remove_channel(channel).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn load_then_dump_round_trips() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();

    let alice = common::unique("alice");
    let bob = common::unique("bob");
    let general = common::unique("general");
    let audit = common::unique("audit");

    let key_of = |_: &str| {
        crypto::dump_public_key(&crypto::generate_private_key().verifying_key()).unwrap()
    };
    let config = ServerConfig {
        clients: BTreeMap::from([
            (alice.clone(), key_of(&alice)),
            (bob.clone(), key_of(&bob)),
        ]),
        channels: BTreeMap::from([
            (general.clone(), channel_config(&[&alice], &[&bob])),
            (audit.clone(), channel_config(&[&alice, &bob], &[])),
        ]),
        ..ServerConfig::default()
    };

    backend.load(&config).await.unwrap();
    let dumped = backend.dump().await.unwrap();
    assert_eq!(dumped.clients, config.clients);
    assert_eq!(dumped.channels, config.channels);

    // a second load is a no-op state transition
    backend.load(&config).await.unwrap();
    let dumped = backend.dump().await.unwrap();
    assert_eq!(dumped.clients, config.clients);
    assert_eq!(dumped.channels, config.channels);

    // shrinking the configuration removes the extras
    let mut smaller = config.clone();
    smaller.clients.remove(&bob);
    smaller.channels.remove(&audit);
    backend.load(&smaller).await.unwrap();
    let dumped = backend.dump().await.unwrap();
    assert_eq!(dumped.clients, smaller.clients);
    assert_eq!(dumped.channels.len(), 1);
    // bob's cursor went away with the client removal cascade
    assert!(dumped.channels[&general].listeners.is_empty());

    backend.remove_channel(&general).await.unwrap();
    backend.remove_client(&alice).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn authorization_predicates() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();

    let alice = common::unique("alice");
    let bob = common::unique("bob");
    let general = common::unique("general");
    let secret = common::unique("secret");

    let alice_key = crypto::generate_private_key();
    let bob_key = crypto::generate_private_key();
    backend
        .add_client(&alice, &crypto::dump_public_key(&alice_key.verifying_key()).unwrap())
        .await
        .unwrap();
    backend
        .add_client(&bob, &crypto::dump_public_key(&bob_key.verifying_key()).unwrap())
        .await
        .unwrap();
    backend
        .add_channel(&general, &channel_config(&[&alice], &[&bob]))
        .await
        .unwrap();
    backend
        .add_channel(&secret, &channel_config(&[], &[]))
        .await
        .unwrap();

    // whistling
    let mut message = common::message(&general, "hello");
    message.whistler = alice.clone();
    let message = message.sign(&alice_key);
    assert!(backend.can_whistle(&message).await.unwrap());

    let mut forbidden = common::message(&secret, "psst");
    forbidden.whistler = alice.clone();
    let forbidden = forbidden.sign(&alice_key);
    assert!(!backend.can_whistle(&forbidden).await.unwrap());

    let mut unknown_channel = common::message(&common::unique("nochan"), "hi");
    unknown_channel.whistler = alice.clone();
    let unknown_channel = unknown_channel.sign(&alice_key);
    assert!(!backend.can_whistle(&unknown_channel).await.unwrap());

    let mut tampered = message.clone();
    tampered.content = "goodbye".to_string();
    assert!(!backend.can_whistle(&tampered).await.unwrap());

    let mut impostor = common::message(&general, "hello");
    impostor.whistler = alice.clone();
    let impostor = impostor.sign(&bob_key);
    assert!(!backend.can_whistle(&impostor).await.unwrap());

    // listening
    let params = ListenParams::new(bob.clone(), [general.clone()]);
    let signature = params.sign(&bob_key);
    assert!(backend
        .can_listen(&bob, params.channels(), &signature)
        .await
        .unwrap());

    let params = ListenParams::new(bob.clone(), [secret.clone()]);
    let signature = params.sign(&bob_key);
    assert!(!backend
        .can_listen(&bob, params.channels(), &signature)
        .await
        .unwrap());

    let params = ListenParams::new(bob.clone(), [general.clone()]);
    let forged = params.sign(&alice_key);
    assert!(!backend
        .can_listen(&bob, params.channels(), &forged)
        .await
        .unwrap());

    let ghost = common::unique("ghost");
    let params = ListenParams::new(ghost.clone(), [general.clone()]);
    let signature = params.sign(&bob_key);
    assert!(!backend
        .can_listen(&ghost, params.channels(), &signature)
        .await
        .unwrap());

    for channel in [&general, &secret] {
        backend.remove_channel(channel).await.unwrap();
    }
    for client in [&alice, &bob] {
        backend.remove_client(client).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn pull_yields_unsubscribe_sentinel_without_cursors() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();
    let listener = common::unique("nobody");
    let channel = common::unique("nochan");

    let mut reader = backend
        .reader()
        .await
        .unwrap()
        .block(Duration::from_millis(100));
    assert!(matches!(
        reader.pull(&listener, &[channel]).await.unwrap(),
        Pull::Unsubscribed
    ));
}

#[tokio::test]
#[ignore = "requires a running redis"]
async fn push_pull_ack_advances_the_cursor() {
    let _lock = common::STORE_LOCK.lock().await;
    let backend = common::backend();
    let channel = common::unique("chan");
    let listener = common::unique("bob");

    backend
        .add_channel(&channel, &channel_config(&[], &[&listener]))
        .await
        .unwrap();
    let first = backend
        .push(&common::message(&channel, "one"))
        .await
        .unwrap();
    let second = backend
        .push(&common::message(&channel, "two"))
        .await
        .unwrap();

    let mut reader = backend
        .reader()
        .await
        .unwrap()
        .block(Duration::from_millis(100));
    let batch = match reader.pull(&listener, &[channel.clone()]).await.unwrap() {
        Pull::Batch(batch) => batch,
        Pull::Unsubscribed => panic!("listener should hold a cursor"),
    };
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].0, first);
    assert_eq!(batch[0].1.content, "one");
    assert_eq!(batch[1].0, second);
    assert_eq!(batch[1].1.content, "two");

    for (id, message) in &batch {
        backend.ack(&message.channel, &listener, id).await.unwrap();
    }

    let mut conn = common::store().await;
    let cursor: String = conn
        .hget(format!("marmot::{channel}::listeners"), &listener)
        .await
        .unwrap();
    assert_eq!(cursor, second);

    // nothing left to deliver
    match reader.pull(&listener, &[channel.clone()]).await.unwrap() {
        Pull::Batch(batch) => assert!(batch.is_empty()),
        Pull::Unsubscribed => panic!("listener should hold a cursor"),
    }

    backend.remove_channel(&channel).await.unwrap();
}
