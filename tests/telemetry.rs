mod common;

use std::time::Duration;

use bioage_sync_lib::core::bluetooth::{
    BleError, ConnectionState, DisconnectInitiator, LastDeviceRecord, Subscription,
    TelemetryEvent, TelemetryListener, TelemetryReading, UUID_HEART_RATE_CHAR, UUID_SPO2_CHAR,
    UUID_STEPS_CHAR,
};
use tokio::sync::mpsc;

use common::Harness;

async fn connected() -> (Harness, TelemetryListener) {
    let harness = Harness::new();
    harness.platform.remember("band-1");
    harness
        .manager
        .connect_to_record(&LastDeviceRecord::new("band-1", "BioAge Band"))
        .await
        .unwrap();
    let listener = TelemetryListener::new(harness.manager.clone());
    (harness, listener)
}

async fn subscribe(
    listener: &TelemetryListener,
) -> (Subscription, mpsc::UnboundedReceiver<TelemetryEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = listener
        .subscribe(move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();
    (subscription, rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TelemetryEvent>) -> TelemetryEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no telemetry event delivered")
        .expect("event channel closed")
}

async fn wait_until_inactive(subscription: &Subscription) {
    for _ in 0..100 {
        if !subscription.is_active() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("subscription still active");
}

#[tokio::test(start_paused = true)]
async fn subscribing_needs_a_connection() {
    let harness = Harness::new();
    let listener = TelemetryListener::new(harness.manager.clone());

    let result = listener.subscribe(|_| {}).await;
    assert_eq!(result.err(), Some(BleError::NotConnected));
    assert_eq!(harness.platform.subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn notifications_are_decoded_and_delivered() {
    let (harness, listener) = connected().await;
    let (subscription, mut events) = subscribe(&listener).await;
    assert!(subscription.is_active());
    assert_eq!(harness.platform.subscriptions(), 3);

    assert!(harness.platform.notify(UUID_HEART_RATE_CHAR, &[0x00, 72]).await);
    let event = next_event(&mut events).await;
    assert_eq!(event.characteristic, UUID_HEART_RATE_CHAR);
    assert_eq!(event.reading, TelemetryReading::HeartRate { bpm: 72 });

    assert!(
        harness
            .platform
            .notify(UUID_STEPS_CHAR, &[0x10, 0x27, 0x00, 0x00])
            .await
    );
    assert_eq!(
        next_event(&mut events).await.reading,
        TelemetryReading::Steps { count: 10_000 }
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_notifications_are_dropped() {
    let (harness, listener) = connected().await;
    let (_subscription, mut events) = subscribe(&listener).await;

    assert!(harness.platform.notify(UUID_SPO2_CHAR, &[150]).await);
    assert!(harness.platform.notify(UUID_SPO2_CHAR, &[97]).await);

    assert_eq!(
        next_event(&mut events).await.reading,
        TelemetryReading::SpO2 { percent: 97 }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn link_loss_releases_the_subscription() {
    let (harness, listener) = connected().await;
    let (subscription, mut events) = subscribe(&listener).await;

    harness.platform.drop_link("band-1");
    harness
        .wait_for_status(|s| s.state == ConnectionState::Idle)
        .await;
    wait_until_inactive(&subscription).await;

    assert!(harness.platform.subscriptions_released());
    assert!(!harness.platform.notify(UUID_HEART_RATE_CHAR, &[0x00, 80]).await);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn requested_disconnect_releases_the_subscription() {
    let (harness, listener) = connected().await;
    let (subscription, _events) = subscribe(&listener).await;

    harness
        .manager
        .disconnect_requested(DisconnectInitiator::App)
        .await
        .unwrap();
    wait_until_inactive(&subscription).await;
    assert!(harness.platform.subscriptions_released());
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_releases_every_registration() {
    let (harness, listener) = connected().await;
    let (subscription, _events) = subscribe(&listener).await;

    subscription.unsubscribe().await;
    assert!(harness.platform.subscriptions_released());
    assert_eq!(harness.manager.status().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn subscription_does_not_follow_into_a_new_session() {
    let (harness, listener) = connected().await;
    let (subscription, mut events) = subscribe(&listener).await;
    let old_session = subscription.session_id();

    harness.platform.drop_link("band-1");
    harness
        .wait_for_status(|s| s.state == ConnectionState::Idle)
        .await;
    let status = harness
        .manager
        .connect_to_record(&LastDeviceRecord::new("band-1", "BioAge Band"))
        .await
        .unwrap();
    assert_ne!(status.session_id, old_session);

    wait_until_inactive(&subscription).await;
    assert!(!harness.platform.notify(UUID_HEART_RATE_CHAR, &[0x00, 64]).await);
    assert!(events.try_recv().is_err());
}
