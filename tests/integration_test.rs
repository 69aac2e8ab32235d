use huddle::hub::Hub;
use huddle::protocol::ServerEvent;
use huddle::registry::RegistryError;
use huddle::types::{AuthorRef, ChatMessage};
use tokio::sync::mpsc;

async fn open_connection(hub: &Hub, id: &str) -> mpsc::Receiver<ServerEvent> {
    open_connection_with_queue(hub, id, 8).await
}

async fn open_connection_with_queue(
    hub: &Hub,
    id: &str,
    queue: usize,
) -> mpsc::Receiver<ServerEvent> {
    let (tx, rx) = mpsc::channel(queue);
    hub.connect(id, tx).await;
    rx
}

fn chat_message(content: &str) -> ChatMessage {
    ChatMessage {
        id: ulid::Ulid::new().to_string(),
        content: content.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        edited: false,
        edited_at: None,
        author: AuthorRef {
            id: "u1".to_string(),
            display_name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
            avatar_url: None,
        },
    }
}

fn expect_message(rx: &mut mpsc::Receiver<ServerEvent>, expected: &str) {
    match rx.try_recv() {
        Ok(ServerEvent::ReceiveMessage { message }) => {
            assert_eq!(message.content, expected);
        }
        other => panic!("expected ReceiveMessage({:?}), got {:?}", expected, other),
    }
}

/// A broadcast reaches exactly the current members of the group: joined
/// connections in other groups see nothing, and the member set is the one
/// at call time.
#[tokio::test]
async fn broadcast_reaches_exactly_the_current_members() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;
    let mut b = open_connection(&hub, "b").await;
    let mut c = open_connection(&hub, "c").await;

    hub.join("a", "g1").await.expect("a joins g1");
    hub.join("b", "g1").await.expect("b joins g1");
    hub.join("c", "g2").await.expect("c joins g2");

    hub.broadcast_message("g1", chat_message("hello g1")).await;

    expect_message(&mut a, "hello g1");
    expect_message(&mut b, "hello g1");
    assert!(
        c.try_recv().is_err(),
        "a member of g2 must not see g1 traffic"
    );

    // Late joiner misses the broadcast that preceded it
    hub.join("c", "g1").await.expect("c joins g1");
    assert!(c.try_recv().is_err());

    hub.broadcast_message("g1", chat_message("second")).await;
    expect_message(&mut a, "second");
    expect_message(&mut b, "second");
    expect_message(&mut c, "second");
}

/// Disconnecting removes the connection from every group before any later
/// broadcast is computed; broadcasting to the now-empty group is a silent
/// no-op.
#[tokio::test]
async fn disconnect_scrubs_membership_before_the_next_broadcast() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;

    hub.join("a", "g1").await.expect("a joins g1");
    hub.disconnect("a").await;

    assert_eq!(hub.member_count("g1").await, 0);
    hub.broadcast_message("g1", chat_message("into the void"))
        .await;
    assert!(a.try_recv().is_err(), "no delivery to a dead connection");

    // Repeated disconnects are safe
    hub.disconnect("a").await;
}

#[tokio::test]
async fn join_is_idempotent() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;

    hub.join("a", "g1").await.expect("first join");
    hub.join("a", "g1").await.expect("second join");
    assert_eq!(hub.member_count("g1").await, 1);

    hub.broadcast_message("g1", chat_message("once")).await;
    expect_message(&mut a, "once");
    assert!(
        a.try_recv().is_err(),
        "double join must not cause double delivery"
    );
}

#[tokio::test]
async fn leave_when_not_a_member_is_a_noop() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;

    hub.leave("a", "g1").await;

    hub.join("a", "g1").await.expect("join after stray leave");
    hub.broadcast_message("g1", chat_message("still works")).await;
    expect_message(&mut a, "still works");

    hub.leave("a", "g1").await;
    assert_eq!(hub.member_count("g1").await, 0, "empty group is discarded");
    hub.broadcast_message("g1", chat_message("gone")).await;
    assert!(a.try_recv().is_err());
}

#[tokio::test]
async fn join_requires_a_registered_connection() {
    let hub = Hub::new();
    let err = hub.join("ghost", "g1").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotRegistered(id) if id == "ghost"));
}

/// Typing signals fan out like messages and arrive in the order they were
/// broadcast; a stop is never synthesized, only relayed.
#[tokio::test]
async fn typing_start_then_stop_arrive_in_order() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;
    let mut b = open_connection(&hub, "b").await;

    hub.join("a", "g1").await.expect("a joins g1");
    hub.join("b", "g1").await.expect("b joins g1");

    hub.broadcast_typing("g1", "alice", true).await;
    hub.broadcast_typing("g1", "alice", false).await;

    for rx in [&mut a, &mut b] {
        match rx.try_recv() {
            Ok(ServerEvent::UserTyping { author_identity }) => {
                assert_eq!(author_identity, "alice");
            }
            other => panic!("expected UserTyping first, got {:?}", other),
        }
        match rx.try_recv() {
            Ok(ServerEvent::UserStoppedTyping { author_identity }) => {
                assert_eq!(author_identity, "alice");
            }
            other => panic!("expected UserStoppedTyping second, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn deletion_notifications_fan_out_to_members() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;
    let mut b = open_connection(&hub, "b").await;

    hub.join("a", "g1").await.expect("a joins g1");
    hub.join("b", "g1").await.expect("b joins g1");

    hub.broadcast_deletion("g1", "m-42").await;

    for rx in [&mut a, &mut b] {
        match rx.try_recv() {
            Ok(ServerEvent::MessageDeleted { message_id }) => {
                assert_eq!(message_id, "m-42");
            }
            other => panic!("expected MessageDeleted, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn broadcast_to_an_unknown_group_is_a_noop() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;

    hub.broadcast_message("never-joined", chat_message("anyone?"))
        .await;
    assert!(a.try_recv().is_err());
}

/// Two concurrent joins to the same group must both land (no lost update).
#[tokio::test]
async fn concurrent_joins_do_not_lose_members() {
    let hub = Hub::new();
    let mut c1 = open_connection(&hub, "c1").await;
    let mut c2 = open_connection(&hub, "c2").await;

    let h1 = hub.clone();
    let h2 = hub.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { h1.join("c1", "g").await }),
        tokio::spawn(async move { h2.join("c2", "g").await }),
    );
    r1.expect("join task").expect("c1 join");
    r2.expect("join task").expect("c2 join");

    assert_eq!(hub.member_count("g").await, 2);

    hub.broadcast_message("g", chat_message("both of you")).await;
    expect_message(&mut c1, "both of you");
    expect_message(&mut c2, "both of you");
}

/// A member whose outbound queue is full loses the overflowing event but
/// never delays or aborts delivery to the rest of the group.
#[tokio::test]
async fn slow_member_does_not_block_fanout() {
    let hub = Hub::new();
    let mut slow = open_connection_with_queue(&hub, "slow", 1).await;
    let mut fast = open_connection(&hub, "fast").await;

    hub.join("slow", "g1").await.expect("slow joins g1");
    hub.join("fast", "g1").await.expect("fast joins g1");

    hub.broadcast_message("g1", chat_message("first")).await;
    hub.broadcast_message("g1", chat_message("second")).await;

    expect_message(&mut fast, "first");
    expect_message(&mut fast, "second");

    expect_message(&mut slow, "first");
    assert!(
        slow.try_recv().is_err(),
        "overflowing event for the slow member is dropped, not queued"
    );
}

/// Full hub lifecycle: members come and go across several groups while
/// broadcasts keep reaching exactly the members of the moment.
#[tokio::test]
async fn membership_churn_end_to_end() {
    let hub = Hub::new();
    let mut a = open_connection(&hub, "a").await;
    let mut b = open_connection(&hub, "b").await;
    let mut c = open_connection(&hub, "c").await;

    // a and b share g1, c watches g2, a also sits in g2
    hub.join("a", "g1").await.expect("a joins g1");
    hub.join("b", "g1").await.expect("b joins g1");
    hub.join("c", "g2").await.expect("c joins g2");
    hub.join("a", "g2").await.expect("a joins g2");

    hub.broadcast_message("g2", chat_message("g2 only")).await;
    expect_message(&mut a, "g2 only");
    expect_message(&mut c, "g2 only");
    assert!(b.try_recv().is_err());

    // a disconnects abruptly; both groups forget it
    hub.disconnect("a").await;
    assert_eq!(hub.member_count("g1").await, 1);
    assert_eq!(hub.member_count("g2").await, 1);

    hub.broadcast_message("g1", chat_message("b alone")).await;
    expect_message(&mut b, "b alone");
    assert!(a.try_recv().is_err());

    // b leaves; g1 evaporates
    hub.leave("b", "g1").await;
    assert_eq!(hub.member_count("g1").await, 0);
    hub.broadcast_message("g1", chat_message("nobody home")).await;
    assert!(b.try_recv().is_err());

    println!("✅ Membership churn test passed!");
}
