mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{
    manager_with, presence_uri, record_states, settle, Hook, MockService, RecordingSubscription,
};
use futures_util::FutureExt;
use rta_sdk::rta::{ConnectionState, RtaError, StaticUser};
use serde_json::json;

use ConnectionState::{Connected, Connecting, Disconnected};

#[tokio::test]
async fn last_removal_tears_down_with_one_disconnected() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let user = StaticUser::new(1);
    let first = record_states(&manager, &user);
    let second = record_states(&manager, &user);
    let id = manager.register_subscription(RecordingSubscription::new(presence_uri(1)));

    let _ = manager.add_subscription(&user, id);
    settle().await;
    service.subscribe_ok(1, 10, json!({}));
    settle().await;

    let remove = manager.remove_subscription(&user, id);
    settle().await;
    service.unsubscribe_ok(1);
    settle().await;

    assert_eq!(remove.now_or_never(), Some(Ok(())));
    for states in [&first, &second] {
        assert_eq!(*states.lock(), vec![Connecting, Connected, Disconnected]);
    }
    assert_eq!(manager.connection_state(&user), Disconnected);
    assert_eq!(service.disconnect_calls(), 1);

    // A later add builds a fresh connection.
    let _ = manager.add_subscription(&user, id);
    settle().await;
    assert_eq!(service.connect_attempts(), 2);
    assert_eq!(
        *first.lock(),
        vec![Connecting, Connected, Disconnected, Connecting, Connected]
    );
}

#[tokio::test]
async fn removal_on_unknown_user_is_a_noop() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let id = manager.register_subscription(RecordingSubscription::new(presence_uri(2)));

    let remove = manager.remove_subscription(&StaticUser::new(2), id);
    assert_eq!(remove.now_or_never(), Some(Ok(())));
    assert_eq!(service.connect_attempts(), 0);
}

#[tokio::test]
async fn activation_keeps_idle_connection_alive() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let user = StaticUser::new(3);
    let states = record_states(&manager, &user);
    let id = manager.register_subscription(RecordingSubscription::new(presence_uri(3)));

    manager.activate(&user, false).expect("activate");
    let _ = manager.add_subscription(&user, id);
    settle().await;
    service.subscribe_ok(1, 30, json!({}));
    settle().await;

    let _ = manager.remove_subscription(&user, id);
    settle().await;
    service.unsubscribe_ok(1);
    settle().await;
    assert_eq!(manager.connection_state(&user), Connected);

    manager.deactivate(&user);
    assert_eq!(manager.connection_state(&user), Disconnected);
    assert_eq!(*states.lock(), vec![Connecting, Connected, Disconnected]);
}

#[tokio::test]
async fn explicit_activation_connects_without_subscriptions() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let user = StaticUser::new(4);
    let states = record_states(&manager, &user);

    manager.activate(&user, true).expect("activate");
    manager.activate(&user, false).expect("activate");
    settle().await;
    assert_eq!(manager.connection_state(&user), Connected);

    manager.deactivate(&user);
    assert_eq!(manager.connection_state(&user), Connected);
    manager.deactivate(&user);
    assert_eq!(manager.connection_state(&user), Disconnected);
    assert_eq!(*states.lock(), vec![Connecting, Connected, Disconnected]);

    // Unbalanced deactivation is tolerated.
    manager.deactivate(&user);
    assert_eq!(states.lock().len(), 3);
}

#[tokio::test]
async fn removed_handlers_are_not_invoked() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let user = StaticUser::new(5);
    let kept = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    {
        let kept = Arc::clone(&kept);
        manager.add_state_changed_handler(&user, move |_| {
            kept.fetch_add(1, Ordering::SeqCst);
        });
    }
    let token = {
        let dropped = Arc::clone(&dropped);
        manager.add_state_changed_handler(&user, move |_| {
            dropped.fetch_add(1, Ordering::SeqCst);
        })
    };
    manager.remove_state_changed_handler(&user, token);

    manager.activate(&user, true).expect("activate");
    settle().await;
    assert_eq!(kept.load(Ordering::SeqCst), 2);
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handlers_are_scoped_to_their_user() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let alice = StaticUser::new(6);
    let bob = StaticUser::new(7);
    let alice_states = record_states(&manager, &alice);
    let bob_states = record_states(&manager, &bob);

    manager.activate(&alice, true).expect("activate");
    settle().await;
    assert_eq!(*alice_states.lock(), vec![Connecting, Connected]);
    assert!(bob_states.lock().is_empty());
}

#[tokio::test]
async fn trigger_resync_reaches_subscriptions_and_handlers() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let users = [StaticUser::new(8), StaticUser::new(9)];
    let resyncs = Arc::new(AtomicUsize::new(0));
    let mut subscriptions = Vec::new();

    for (n, user) in users.iter().enumerate() {
        let subscription = RecordingSubscription::new(presence_uri(n as u64));
        let id = manager.register_subscription(subscription.clone());
        let _ = manager.add_subscription(user, id);
        settle().await;
        // Each user has its own connection, so client ids restart at 1.
        service.subscribe_ok(1, 80 + n as u32, json!({}));
        settle().await;

        let resyncs = Arc::clone(&resyncs);
        manager.add_resync_handler(user, move || {
            resyncs.fetch_add(1, Ordering::SeqCst);
        });
        subscriptions.push(subscription);
    }

    manager.trigger_resync();
    settle().await;
    assert_eq!(resyncs.load(Ordering::SeqCst), 2);
    for subscription in &subscriptions {
        assert_eq!(subscription.hooks(), vec![Hook::Subscribed(json!({})), Hook::Resync]);
    }

    // A service-initiated resync only concerns the connection it arrived on.
    service.resync();
    settle().await;
    assert_eq!(resyncs.load(Ordering::SeqCst), 3);
    assert_eq!(subscriptions[0].hooks().len(), 2);
    assert_eq!(subscriptions[1].hooks().len(), 3);
}

#[tokio::test]
async fn shutdown_aborts_pending_operations_silently() {
    let service = MockService::new();
    let manager = manager_with(&service);
    let user = StaticUser::new(10);
    let states = record_states(&manager, &user);
    let id = manager.register_subscription(RecordingSubscription::new(presence_uri(10)));

    let add = manager.add_subscription(&user, id);
    settle().await;
    assert!(add.clone().now_or_never().is_none());

    manager.shutdown();
    settle().await;
    assert_eq!(add.now_or_never(), Some(Err(RtaError::Aborted)));
    assert_eq!(*states.lock(), vec![Connecting, Connected]);
    assert_eq!(service.disconnect_calls(), 1);
    assert_eq!(manager.connection_state(&user), Disconnected);
}
