// Connection manager tests
// These tests verify room join/leave bookkeeping and broadcast routing

mod common;
use common::{fast_settings, loopback_harness, open_session, setup_logging, CONVERSATION};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use dugout::chat::{ConnectionManager, Transport};
use dugout::models::{OutgoingMessage, SendAck};
use dugout::ChatError;

/// Transport whose room joins take a while and can be refused
struct SlowJoinTransport {
    joins: AtomicUsize,
    refuse: AtomicBool,
}

impl SlowJoinTransport {
    fn new(refuse: bool) -> Arc<Self> {
        Arc::new(SlowJoinTransport {
            joins: AtomicUsize::new(0),
            refuse: AtomicBool::new(refuse),
        })
    }
}

#[async_trait]
impl Transport for SlowJoinTransport {
    async fn join(&self, _conversation_id: &str) -> dugout::Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        if self.refuse.load(Ordering::SeqCst) {
            Err(ChatError::Transport("join refused".to_string()))
        } else {
            Ok(())
        }
    }

    async fn leave(&self, _conversation_id: &str) -> dugout::Result<()> {
        Ok(())
    }

    async fn send(&self, _message: OutgoingMessage) -> dugout::Result<SendAck> {
        Ok(SendAck::ok())
    }
}

#[tokio::test]
async fn test_listeners_share_one_room_join() -> Result<()> {
    setup_logging();
    let harness = loopback_harness();
    let connection = harness.services.connection.clone();

    let mut first = connection.join(CONVERSATION).await?;
    let mut second = connection.join(CONVERSATION).await?;
    assert_eq!(harness.server.join_calls(), 1);
    assert_eq!(connection.listener_count(CONVERSATION), 2);
    assert_eq!(connection.joined_rooms(), vec![CONVERSATION.to_string()]);

    let published = harness.server.publish("coach-ray", CONVERSATION, "Game moved to 10am").await;

    for subscription in [&mut first, &mut second] {
        let received = timeout(Duration::from_secs(1), subscription.recv()).await?;
        assert_eq!(received.map(|m| m.id), Some(published.id.clone()));
    }
    // Exactly one copy per listener
    assert!(timeout(Duration::from_millis(100), first.recv()).await.is_err());

    connection.leave(first).await?;
    assert_eq!(connection.listener_count(CONVERSATION), 1);
    assert!(harness.server.is_joined(CONVERSATION));

    connection.leave(second).await?;
    assert_eq!(connection.listener_count(CONVERSATION), 0);
    assert!(!harness.server.is_joined(CONVERSATION));
    assert!(connection.joined_rooms().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_broadcasts_are_routed_by_conversation() -> Result<()> {
    setup_logging();
    let harness = loopback_harness();
    let connection = harness.services.connection.clone();

    let mut gold = connection.join(CONVERSATION).await?;
    let mut blue = connection.join("u10-blue").await?;
    assert_eq!(harness.server.join_calls(), 2);

    harness.server.publish("coach-kim", "u10-blue", "Pictures after practice").await;

    let received = timeout(Duration::from_secs(1), blue.recv()).await?;
    assert_eq!(received.map(|m| m.conversation_id), Some("u10-blue".to_string()));
    assert_eq!(gold.conversation_id(), CONVERSATION);
    assert!(timeout(Duration::from_millis(100), gold.recv()).await.is_err());

    Ok(())
}

#[tokio::test]
async fn test_dropping_last_subscription_leaves_room() -> Result<()> {
    setup_logging();
    let harness = loopback_harness();
    let connection = harness.services.connection.clone();

    let subscription = connection.join(CONVERSATION).await?;
    assert!(harness.server.is_joined(CONVERSATION));
    drop(subscription);
    assert_eq!(connection.listener_count(CONVERSATION), 0);

    // The leave is sent from a spawned task
    for _ in 0..50 {
        if !harness.server.is_joined(CONVERSATION) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(!harness.server.is_joined(CONVERSATION));

    Ok(())
}

#[tokio::test]
async fn test_two_sessions_on_one_conversation() -> Result<()> {
    setup_logging();
    let harness = loopback_harness();

    let mut left = open_session(&harness, fast_settings()).await?;
    let mut right = open_session(&harness, fast_settings()).await?;
    assert_eq!(harness.server.join_calls(), 1);

    harness.server.publish("parent-4", CONVERSATION, "Bringing oranges").await;
    common::next_update(&mut left).await?;
    common::next_update(&mut right).await?;
    assert_eq!(left.messages().len(), 1);
    assert_eq!(right.messages().len(), 1);

    left.close().await?;
    assert!(harness.server.is_joined(CONVERSATION));
    right.close().await?;
    assert!(!harness.server.is_joined(CONVERSATION));

    Ok(())
}

#[tokio::test]
async fn test_send_requires_a_joined_room() -> Result<()> {
    setup_logging();
    let harness = loopback_harness();
    let outgoing = OutgoingMessage {
        text: "Hello?".to_string(),
        conversation_id: CONVERSATION.to_string(),
        sender_id: common::ME.to_string(),
        client_temp_id: "1-0-0000-local".to_string(),
    };

    match harness.services.connection.send(outgoing.clone()).await {
        Err(ChatError::NotJoined(conversation)) => assert_eq!(conversation, CONVERSATION),
        other => panic!("Expected not joined, got {:?}", other),
    }
    assert!(harness.server.transmissions().is_empty());

    let _subscription = harness.services.connection.join(CONVERSATION).await?;
    assert!(harness.services.connection.send(outgoing).await?.success);
    assert_eq!(harness.server.transmissions().len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_join_fails_when_room_join_is_refused() -> Result<()> {
    setup_logging();
    let transport = SlowJoinTransport::new(true);
    let (_events_tx, events) = mpsc::channel(10);
    let connection = ConnectionManager::start(transport.clone(), events);

    let (first, second) = tokio::join!(connection.join(CONVERSATION), async {
        sleep(Duration::from_millis(10)).await;
        connection.join(CONVERSATION).await
    });

    assert!(matches!(first, Err(ChatError::Transport(_))));
    assert!(matches!(second, Err(ChatError::Transport(_))));
    assert_eq!(connection.listener_count(CONVERSATION), 0);
    assert!(connection.joined_rooms().is_empty());

    // Once the transport accepts, the room works again
    transport.refuse.store(false, Ordering::SeqCst);
    let _subscription = connection.join(CONVERSATION).await?;
    assert_eq!(connection.listener_count(CONVERSATION), 1);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_joins_share_one_slow_room_join() -> Result<()> {
    setup_logging();
    let transport = SlowJoinTransport::new(false);
    let (_events_tx, events) = mpsc::channel(10);
    let connection = ConnectionManager::start(transport.clone(), events);

    let (first, second) = tokio::join!(connection.join(CONVERSATION), async {
        sleep(Duration::from_millis(10)).await;
        connection.join(CONVERSATION).await
    });

    let _first = first?;
    let _second = second?;
    assert_eq!(transport.joins.load(Ordering::SeqCst), 1);
    assert_eq!(connection.listener_count(CONVERSATION), 2);

    Ok(())
}

#[tokio::test]
async fn test_idle_listener_does_not_stall_other_rooms() -> Result<()> {
    setup_logging();
    let harness = loopback_harness();
    let connection = harness.services.connection.clone();

    // Never polled while the broadcasts arrive
    let mut background = connection.join("u10-blue").await?;
    let mut active = connection.join(CONVERSATION).await?;

    for i in 0..150 {
        harness
            .server
            .publish("coach-kim", "u10-blue", &format!("reminder {}", i))
            .await;
    }
    let published = harness.server.publish("coach-ray", CONVERSATION, "Bus leaves at 7").await;

    let received = timeout(Duration::from_secs(1), active.recv()).await?;
    assert_eq!(received.map(|m| m.id), Some(published.id));

    // Nothing was dropped for the idle room either
    for i in 0..150 {
        let message = timeout(Duration::from_secs(1), background.recv()).await?;
        assert_eq!(message.map(|m| m.text), Some(format!("reminder {}", i)));
    }

    Ok(())
}
