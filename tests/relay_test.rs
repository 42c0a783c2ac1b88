mod common;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use common::{recipient, Outbox};
use notification_relay::{
    load_settings, ApiUsers, ConfigError, Credentials, DispatchOutcome, InMemoryKvStore,
    OverflowPolicy, Relay, ResolverRegistry, SessionIdentity, StaticResolver, SubscriptionUpdate,
};

const EVT_1: &[u8] = br#"{
    "id": "evt-1",
    "subject": "disk full",
    "message": "node-3 is at 98%",
    "validity": "1h",
    "target": {"type": "group", "id": "ops"}
}"#;

fn ops() -> Credentials {
    Credentials::new("ops", "s3cret")
}

fn relay(outbox: &Outbox) -> Relay {
    Relay::builder()
        .store(Arc::new(InMemoryKvStore::new()))
        .channels(outbox.channels())
        .resolvers(ResolverRegistry::new().with(
            "group",
            Arc::new(StaticResolver::default().with_group("default", "ops", ["alice", "bob"])),
        ))
        .api_users(ApiUsers::new(&HashMap::from([("ops".to_string(), "s3cret".to_string())])))
        .build()
}

#[tokio::test]
async fn submission_requires_api_credentials() {
    let outbox = Outbox::default();
    let mut relay = relay(&outbox);

    let err = relay.submit(None, EVT_1).await.unwrap_err();
    assert_eq!(err.status_code(), 401);

    let err = relay
        .submit(Some(&Credentials::new("ops", "guess")), EVT_1)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 401);

    assert!(relay.submit(Some(&ops()), EVT_1).await.is_ok());
    relay.shutdown().await;
}

#[tokio::test]
async fn submission_errors_map_to_statuses() {
    let outbox = Outbox::default();
    let mut relay = relay(&outbox);

    let malformed = relay.submit(Some(&ops()), b"{not json").await.unwrap_err();
    assert_eq!(malformed.status_code(), 400);

    let missing_id = br#"{"subject": "s", "message": "b", "target": {"type": "group", "id": "ops"}}"#;
    assert_eq!(relay.submit(Some(&ops()), missing_id).await.unwrap_err().status_code(), 400);

    let bad_ttl = br#"{"id": "e", "validity": "soon", "target": {"type": "group", "id": "ops"}}"#;
    assert_eq!(relay.submit(Some(&ops()), bad_ttl).await.unwrap_err().status_code(), 400);

    let unknown = br#"{"id": "e", "target": {"type": "org", "id": "ops"}}"#;
    assert_eq!(relay.submit(Some(&ops()), unknown).await.unwrap_err().status_code(), 501);

    let no_group = br#"{"id": "e", "target": {"type": "group", "id": "nobody"}}"#;
    assert_eq!(relay.submit(Some(&ops()), no_group).await.unwrap_err().status_code(), 500);

    relay.shutdown().await;
}

#[tokio::test]
async fn submit_subscribe_and_report() {
    let outbox = Outbox::default();
    let mut relay = relay(&outbox);

    relay
        .subscribe(
            Some(&SessionIdentity(recipient("alice"))),
            "alice",
            SubscriptionUpdate::new().with_address("email", "a@x.com"),
        )
        .await
        .unwrap();

    let outcome = relay.submit(Some(&ops()), EVT_1).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Dispatched(ref r) if r.queued == 1));
    let again = relay.submit(Some(&ops()), EVT_1).await.unwrap();
    assert!(matches!(again, DispatchOutcome::Duplicate { .. }));

    let stats = relay.stats().await.unwrap();
    assert_eq!(stats.messages_stored, 1);
    assert_eq!(stats.users_subscribed, 1);
    assert_eq!(stats.messages_sent.get("email"), Some(&1));

    assert_eq!(relay.subscribers(None).await.unwrap_err().status_code(), 401);
    assert_eq!(relay.subscribers(Some(&ops())).await.unwrap(), vec![recipient("alice")]);

    relay.shutdown().await;
    // Welcome notice plus the notification.
    assert_eq!(outbox.sent().len(), 2);
    assert!(relay.dead_letters().await.is_empty());

    let err = relay.submit(Some(&ops()), br#"{"id": "evt-2", "target": {"type": "group", "id": "ops"}}"#).await;
    assert_eq!(err.unwrap_err().status_code(), 503);
}

#[tokio::test]
async fn subscribe_checks_the_session_before_the_recipient_id() {
    let outbox = Outbox::default();
    let mut relay = relay(&outbox);
    let update = || SubscriptionUpdate::new().with_address("email", "a@x.com");

    let err = relay.subscribe(None, "counters", update()).await.unwrap_err();
    assert_eq!(err.status_code(), 401);

    let alice = SessionIdentity(recipient("alice"));
    let err = relay.subscribe(Some(&alice), "msg-evt-1", update()).await.unwrap_err();
    assert_eq!(err.status_code(), 401);
    let err = relay.subscribe(Some(&alice), "bob", update()).await.unwrap_err();
    assert_eq!(err.status_code(), 401);

    relay.shutdown().await;
    assert!(outbox.sent().is_empty());
}

#[tokio::test]
async fn relay_from_settings_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
log_level = "debug"

[store]
subscription_prefix = "subscription-"

[dispatcher]
worker_count = 2
queue_capacity = 16
overflow_policy = "block"

[api_users]
ops = "s3cret"

[[channels]]
type = "email"
kind = "log"

[[channels]]
type = "pager"
kind = "log"
address_pattern = "^[0-9]{{4}}$"

[resolvers.group]
kind = "static"

[resolvers.group.scopes.default]
ops = ["alice", "bob"]
"#
    )
    .unwrap();

    let settings = load_settings(Some(file.path())).unwrap();
    assert_eq!(settings.log_level, "debug");
    assert_eq!(settings.dispatcher.overflow_policy, OverflowPolicy::Block);
    assert_eq!(settings.dispatcher.pool_config().worker_count, 2);

    let mut relay = Relay::from_settings(&settings).unwrap();
    let channel_types: Vec<_> = relay.channels().channel_types().iter().map(|c| c.to_string()).collect();
    assert_eq!(channel_types, vec!["email", "pager"]);

    let bob = SessionIdentity(recipient("bob"));
    let err = relay
        .subscribe(Some(&bob), "bob", SubscriptionUpdate::new().with_address("pager", "12"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    relay
        .subscribe(Some(&bob), "bob", SubscriptionUpdate::new().with_address("pager", "4711"))
        .await
        .unwrap();

    let view = relay.subscription_view(&recipient("bob")).await.unwrap();
    let pager = view.channels.iter().find(|c| c.channel.as_str() == "pager").unwrap();
    assert_eq!(pager.rule, "^[0-9]{4}$");
    assert_eq!(pager.address.as_deref(), Some("4711"));

    let DispatchOutcome::Dispatched(report) = relay.submit(Some(&ops()), EVT_1).await.unwrap() else {
        panic!("expected a dispatch");
    };
    assert_eq!(report.recipients_found, 1);
    assert_eq!(relay.stats().await.unwrap().messages_sent.get("pager"), Some(&1));

    relay.shutdown().await;
    assert!(relay.dead_letters().await.is_empty());
}

#[test]
fn reserved_subscription_prefix_is_a_config_error() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(file, "[store]\nsubscription_prefix = \"msg\"\n").unwrap();

    let settings = load_settings(Some(file.path())).unwrap();
    let err = Relay::from_settings(&settings).err().unwrap();
    assert!(matches!(err, ConfigError::Keyspace(ref reserved) if reserved.reserved == "msg-"));
}

#[test]
fn missing_settings_file_is_an_error() {
    assert!(load_settings(Some(std::path::Path::new("/nonexistent/relay.toml"))).is_err());
}
