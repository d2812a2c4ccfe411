//! User-visible unread state derived from the read cursor and message log.

use shared::model::Conversation;

use crate::{error::SyncResult, store::StoreGateway};

/// Stored count when positive, a synthetic 1 for a live manual flag, else 0.
pub fn display_unread_count(conversation: &Conversation) -> u32 {
    if conversation.unread_count > 0 {
        return conversation.unread_count;
    }
    match (conversation.marked_unread_at, conversation.read_cursor()) {
        (Some(marked), Some(cursor)) if marked > cursor => 1,
        (Some(_), None) => 1,
        _ => 0,
    }
}

/// The loaded window reaches the newest remote id and `cursor` is at or past the
/// newest message that could count as unread.
pub fn cursor_covers_bottom(conversation: &Conversation, cursor: i64) -> bool {
    let at_bottom = match (
        conversation.latest_loaded_msg_seq_id,
        conversation.latest_remote_msg_seq_id,
    ) {
        (Some(loaded), Some(remote)) => loaded >= remote,
        (None, Some(_)) => false,
        (_, None) => true,
    };
    let boundary = conversation
        .last_incoming_timestamp
        .or(conversation.last_message_timestamp);
    at_bottom && boundary.map_or(true, |boundary| cursor >= boundary)
}

/// Applies a cursor move to the cached count and returns the new value.
pub fn update_unread_count(
    conversation: &mut Conversation,
    newest_unread_server_ts: i64,
    count_delta: Option<u32>,
) -> u32 {
    if cursor_covers_bottom(conversation, newest_unread_server_ts) {
        conversation.unread_count = 0;
    } else if let Some(delta) = count_delta {
        conversation.unread_count = conversation.unread_count.saturating_sub(delta);
    }
    conversation.unread_count
}

/// Full count from storage: incoming messages past the cursor plus remote ids not
/// yet loaded.
pub async fn recount(store: &StoreGateway, conversation: &Conversation) -> SyncResult<u32> {
    let after = conversation.read_cursor().unwrap_or(i64::MIN);
    let local = store
        .get_unread_message_count(conversation.id, after, i64::MAX)
        .await?;
    Ok(local.saturating_add(conversation.unloaded_backlog()))
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
