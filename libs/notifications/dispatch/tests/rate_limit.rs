mod common;

use common::{config, enable, senders, Harness};
use notification_dispatch::{Channel, DispatchEvent, NotificationMessage, ScriptedSender};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_sixty_per_minute_spreads_hundred_sends_over_99_seconds() {
    let mut config = config();
    enable(&mut config, Channel::Sms, 1, 60);
    let sender = Arc::new(ScriptedSender::succeeding(Channel::Sms));
    let mut harness = Harness::start(&config, senders(&[sender.clone()]));

    for i in 0..100 {
        let message = NotificationMessage::new(Channel::Sms, "+15550100", json!({"body": format!("#{i}")}));
        harness.publish(&message).await;
    }

    let mut delivered = 0;
    while delivered < 100 {
        match harness.next_terminal().await {
            DispatchEvent::Delivered { .. } => delivered += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }

    let records = sender.records().await;
    assert_eq!(records.len(), 100);
    let elapsed = records[99].started_at - records[0].started_at;
    assert!(elapsed >= Duration::from_secs(99), "finished in {elapsed:?}");

    // No rolling minute holds more than 60 sends.
    for window in records.windows(61) {
        assert!(window[60].started_at - window[0].started_at >= Duration::from_secs(60));
    }

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_channel_does_not_wait() {
    let mut config = config();
    enable(&mut config, Channel::Push, 4, 0);
    let sender = Arc::new(ScriptedSender::succeeding(Channel::Push));
    let mut harness = Harness::start(&config, senders(&[sender.clone()]));

    for _ in 0..20 {
        let message = NotificationMessage::new(Channel::Push, "device-token", json!({"title": "t", "body": "b"}));
        harness.publish(&message).await;
    }
    for _ in 0..20 {
        assert!(matches!(harness.next_terminal().await, DispatchEvent::Delivered { .. }));
    }

    let records = sender.records().await;
    assert!(records[19].started_at - records[0].started_at < Duration::from_secs(1));

    harness.stop().await.unwrap();
}
