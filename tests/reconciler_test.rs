mod common;

use std::sync::Arc;

use common::{recipient, Outbox};
use notification_relay::{
    ChannelType, InMemoryKvStore, KvStore, NoticeTemplates, Relay, RelayError, SessionIdentity, SubscribeError,
    SubscriptionUpdate, COUNTERS_KEY,
};

fn relay(outbox: &Outbox, store: Arc<InMemoryKvStore>) -> Relay {
    Relay::builder()
        .store(store)
        .channels(outbox.channels())
        .notices(NoticeTemplates {
            welcome_subject: "welcome".into(),
            goodbye_subject: "goodbye".into(),
            ..Default::default()
        })
        .build()
}

fn session(id: &str) -> SessionIdentity {
    SessionIdentity(recipient(id))
}

#[tokio::test]
async fn switching_channels_says_goodbye_then_welcome() {
    let outbox = Outbox::default();
    let store = Arc::new(InMemoryKvStore::new());
    let mut relay = relay(&outbox, store.clone());
    let carol = session("carol");

    let first = relay
        .subscribe(Some(&carol), "carol", SubscriptionUpdate::new().with_address("email", "c@x.com"))
        .await
        .unwrap();
    assert_eq!(first.welcomed, vec![(ChannelType::new("email"), "c@x.com".to_string())]);
    assert!(first.farewelled.is_empty());

    let second = relay
        .subscribe(Some(&carol), "carol", SubscriptionUpdate::new().with_address("sms", "+15550100"))
        .await
        .unwrap();
    assert_eq!(second.farewelled, vec![(ChannelType::new("email"), "c@x.com".to_string())]);
    assert_eq!(second.welcomed, vec![(ChannelType::new("sms"), "+15550100".to_string())]);
    assert!(!second.deleted);

    let view = relay.subscription_view(&recipient("carol")).await.unwrap();
    assert!(view.subscribed);
    let addresses: Vec<_> = view
        .channels
        .iter()
        .map(|c| (c.channel.as_str().to_string(), c.address.clone()))
        .collect();
    assert_eq!(
        addresses,
        vec![
            ("email".to_string(), None),
            ("sms".to_string(), Some("+15550100".to_string())),
        ]
    );

    relay.shutdown().await;

    let sent = outbox.sent();
    assert_eq!(sent.len(), 3);
    let goodbyes: Vec<_> = sent.iter().filter(|s| s.subject == "goodbye").collect();
    assert_eq!(goodbyes.len(), 1);
    assert_eq!((goodbyes[0].channel.as_str(), goodbyes[0].address.as_str()), ("email", "c@x.com"));
    let welcomes: Vec<_> = sent.iter().filter(|s| s.subject == "welcome").map(|s| s.address.as_str()).collect();
    assert_eq!(welcomes.len(), 2);
    assert!(welcomes.contains(&"+15550100"));
}

#[tokio::test]
async fn notices_do_not_touch_sent_counters() {
    let outbox = Outbox::default();
    let store = Arc::new(InMemoryKvStore::new());
    let mut relay = relay(&outbox, store.clone());

    relay
        .subscribe(Some(&session("dave")), "dave", SubscriptionUpdate::new().with_address("email", "d@x.com"))
        .await
        .unwrap();
    relay.shutdown().await;

    assert_eq!(outbox.sent().len(), 1);
    assert!(store.fields(COUNTERS_KEY).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_update_deletes_the_record() {
    let outbox = Outbox::default();
    let store = Arc::new(InMemoryKvStore::new());
    let mut relay = relay(&outbox, store.clone());
    let erin = session("erin");

    relay
        .subscribe(Some(&erin), "erin", SubscriptionUpdate::new().with_address("email", "e@x.com"))
        .await
        .unwrap();
    assert!(store.get("sub-erin").await.unwrap().is_some());

    let report = relay
        .subscribe(Some(&erin), "erin", SubscriptionUpdate::new().with_address("email", ""))
        .await
        .unwrap();
    assert!(report.deleted);
    assert_eq!(report.farewelled.len(), 1);
    assert!(store.get("sub-erin").await.unwrap().is_none());
    assert!(!relay.subscription_view(&recipient("erin")).await.unwrap().subscribed);

    relay.shutdown().await;
}

#[tokio::test]
async fn any_invalid_address_rejects_the_whole_update() {
    let outbox = Outbox::default();
    let store = Arc::new(InMemoryKvStore::new());
    let mut relay = relay(&outbox, store.clone());

    let update = SubscriptionUpdate::new()
        .with_address("email", "not-an-address")
        .with_address("sms", "+15550100");
    let err = relay.subscribe(Some(&session("frank")), "frank", update).await.unwrap_err();

    assert_eq!(err.status_code(), 400);
    let RelayError::Subscribe(SubscribeError::InvalidAddresses(violations)) = err else {
        panic!("expected invalid addresses");
    };
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].channel, ChannelType::new("email"));
    assert_eq!(violations[0].address, "not-an-address");

    relay.shutdown().await;
    assert!(outbox.sent().is_empty());
    assert!(store.get("sub-frank").await.unwrap().is_none());
}

#[tokio::test]
async fn sessions_only_update_their_own_record() {
    let outbox = Outbox::default();
    let mut relay = relay(&outbox, Arc::new(InMemoryKvStore::new()));
    let update = SubscriptionUpdate::new().with_address("email", "g@x.com");

    let err = relay
        .subscribe(Some(&session("mallory")), "grace", update.clone())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 401);

    let err = relay.subscribe(None, "grace", update).await.unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized));

    relay.shutdown().await;
    assert!(outbox.sent().is_empty());
}

#[tokio::test]
async fn form_fields_feed_subscription_updates() {
    let outbox = Outbox::default();
    let mut relay = relay(&outbox, Arc::new(InMemoryKvStore::new()));

    let update = relay
        .parse_form([("address-email", "h@x.com"), ("address-sms", ""), ("submit", "Save")])
        .unwrap();
    let report = relay.subscribe(Some(&session("heidi")), "heidi", update).await.unwrap();
    assert_eq!(report.welcomed, vec![(ChannelType::new("email"), "h@x.com".to_string())]);

    let err = relay.parse_form([("address-fax", "0301234")]).unwrap_err();
    assert_eq!(err.status_code(), 400);

    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_for_one_recipient_are_serialized() {
    let outbox = Outbox::default();
    let relay = Arc::new(relay(&outbox, Arc::new(InMemoryKvStore::new())));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let relay = relay.clone();
            tokio::spawn(async move {
                let update = SubscriptionUpdate::new().with_address("email", format!("ivan{i}@x.com"));
                relay.subscribe(Some(&session("ivan")), "ivan", update).await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut relay = Arc::try_unwrap(relay).ok().expect("all tasks joined");
    relay.shutdown().await;

    // Every update sees its predecessor: one goodbye per replaced address.
    let sent = outbox.sent();
    assert_eq!(sent.iter().filter(|s| s.subject == "welcome").count(), 8);
    assert_eq!(sent.iter().filter(|s| s.subject == "goodbye").count(), 7);
}
