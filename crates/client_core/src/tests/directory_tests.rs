use super::*;

#[path = "support.rs"]
mod support;

use support::{payload, summary, FakeConversationApi};

fn me() -> UserId {
    UserId::new("user-me")
}

fn other() -> UserId {
    UserId::new("user-other")
}

async fn seeded_directory() -> (Arc<ConversationDirectory>, Arc<FakeConversationApi>) {
    let api = FakeConversationApi::new();
    api.set_conversations(vec![
        summary(&ConversationId::new("conv-old"), &other(), 0, 100),
        summary(&ConversationId::new("conv-new"), &other(), 0, 200),
    ])
    .await;
    let directory = ConversationDirectory::new(api.clone());
    directory.set_local_user(me()).await;
    directory.refresh().await.expect("refresh");
    (directory, api)
}

#[tokio::test]
async fn refresh_orders_by_most_recent_activity() {
    let api = FakeConversationApi::new();
    api.set_conversations(vec![
        summary(&ConversationId::new("conv-a"), &other(), 0, 50),
        summary(&ConversationId::new("conv-c"), &other(), 0, 300),
        summary(&ConversationId::new("conv-b"), &other(), 0, 150),
    ])
    .await;
    let directory = ConversationDirectory::new(api);

    directory.refresh().await.expect("refresh");

    let ids: Vec<String> = directory
        .snapshot()
        .await
        .into_iter()
        .map(|c| c.conversation_id.0)
        .collect();
    assert_eq!(ids, vec!["conv-c", "conv-b", "conv-a"]);
}

#[tokio::test]
async fn inbound_message_bumps_unread_and_moves_the_entry_up() {
    let (directory, _api) = seeded_directory().await;
    let conversation_id = ConversationId::new("conv-old");

    let message = payload(&conversation_id, &other(), "m-1", "hey", 300);
    directory.apply_new_message(&message).await;

    let snapshot = directory.snapshot().await;
    assert_eq!(snapshot[0].conversation_id, conversation_id);
    assert_eq!(snapshot[0].unread_count, 1);
    assert_eq!(
        snapshot[0]
            .last_message
            .as_ref()
            .map(|m| m.body.as_str()),
        Some("hey")
    );
    assert_eq!(snapshot[0].last_activity_at, message.sent_at);
}

#[tokio::test]
async fn own_message_reorders_without_touching_unread() {
    let (directory, _api) = seeded_directory().await;
    let conversation_id = ConversationId::new("conv-old");

    let message = payload(&conversation_id, &me(), "m-1", "sent from here", 300);
    directory.apply_new_message(&message).await;

    let snapshot = directory.snapshot().await;
    assert_eq!(snapshot[0].conversation_id, conversation_id);
    assert_eq!(snapshot[0].unread_count, 0);
}

#[tokio::test]
async fn active_conversation_never_accumulates_unread() {
    let (directory, _api) = seeded_directory().await;
    let conversation_id = ConversationId::new("conv-old");
    directory.set_active(Some(conversation_id.clone())).await;

    let message = payload(&conversation_id, &other(), "m-1", "hey", 300);
    directory.apply_new_message(&message).await;

    assert_eq!(directory.unread_count(&conversation_id).await, 0);
}

#[tokio::test]
async fn unknown_conversation_gets_one_targeted_refetch() {
    let api = FakeConversationApi::new();
    api.set_conversations(vec![summary(
        &ConversationId::new("conv-known"),
        &other(),
        0,
        100,
    )])
    .await;
    let directory = ConversationDirectory::new(api.clone());
    directory.refresh().await.expect("refresh");

    // The backend now knows about a conversation the local list has never
    // seen.
    let fresh_id = ConversationId::new("conv-fresh");
    api.set_conversations(vec![
        summary(&ConversationId::new("conv-known"), &other(), 0, 100),
        summary(&fresh_id, &other(), 1, 400),
    ])
    .await;

    let message = payload(&fresh_id, &other(), "m-1", "first contact", 400);
    directory.apply_new_message(&message).await;

    assert_eq!(api.fetch_conversation_calls().await, 1);
    let snapshot = directory.snapshot().await;
    assert_eq!(snapshot[0].conversation_id, fresh_id);
    assert_eq!(snapshot.len(), 2);
}

#[tokio::test]
async fn failed_refetch_leaves_the_list_untouched() {
    let (directory, api) = seeded_directory().await;

    let ghost = ConversationId::new("conv-ghost");
    let message = payload(&ghost, &other(), "m-1", "from nowhere", 400);
    directory.apply_new_message(&message).await;

    assert_eq!(api.fetch_conversation_calls().await, 1);
    assert_eq!(directory.snapshot().await.len(), 2);
}

#[tokio::test]
async fn clear_unread_zeroes_the_counter() {
    let (directory, _api) = seeded_directory().await;
    let conversation_id = ConversationId::new("conv-old");

    let message = payload(&conversation_id, &other(), "m-1", "hey", 300);
    directory.apply_new_message(&message).await;
    assert_eq!(directory.unread_count(&conversation_id).await, 1);

    directory.clear_unread(&conversation_id).await;
    assert_eq!(directory.unread_count(&conversation_id).await, 0);
}

#[tokio::test]
async fn read_receipt_from_another_device_clears_unread() {
    let (directory, _api) = seeded_directory().await;
    let conversation_id = ConversationId::new("conv-old");

    let message = payload(&conversation_id, &other(), "m-1", "hey", 300);
    directory.apply_new_message(&message).await;

    // A receipt for the counterpart must not clear our counter.
    directory.apply_message_read(&conversation_id, &other()).await;
    assert_eq!(directory.unread_count(&conversation_id).await, 1);

    directory.apply_message_read(&conversation_id, &me()).await;
    assert_eq!(directory.unread_count(&conversation_id).await, 0);
}
