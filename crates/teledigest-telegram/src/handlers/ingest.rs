use std::sync::Arc;

use teloxide::types::Message;
use tracing::{debug, error};

use teledigest_core::{
    config::Config,
    domain::{ChannelMessage, ChatId, MessageId, MessageRef},
};

use crate::router::AppState;

/// Stored text: `text`, else `caption`. `None` for media-only posts.
pub(crate) fn message_text<'a>(text: Option<&'a str>, caption: Option<&'a str>) -> Option<&'a str> {
    text.or(caption).filter(|t| !t.trim().is_empty())
}

/// `@username`, else the chat title, else the numeric id.
pub(crate) fn channel_label(username: Option<&str>, title: Option<&str>, chat_id: i64) -> String {
    if let Some(u) = username.filter(|u| !u.is_empty()) {
        return format!("@{}", u.trim_start_matches('@'));
    }
    if let Some(t) = title.map(str::trim).filter(|t| !t.is_empty()) {
        return t.to_string();
    }
    chat_id.to_string()
}

pub(crate) fn is_source_chat(cfg: &Config, chat_id: ChatId, username: Option<&str>) -> bool {
    chat_id != cfg.digest_target && cfg.is_source(chat_id, username)
}

pub(crate) fn is_ingestible(cfg: &Config, msg: &Message) -> bool {
    is_source_chat(cfg, ChatId(msg.chat.id.0), msg.chat.username())
}

fn to_channel_message(msg: &Message) -> Option<ChannelMessage> {
    let text = message_text(msg.text(), msg.caption())?;
    Some(ChannelMessage {
        source: MessageRef {
            chat_id: ChatId(msg.chat.id.0),
            message_id: MessageId(msg.id.0),
        },
        channel: channel_label(msg.chat.username(), msg.chat.title(), msg.chat.id.0),
        date: msg.date,
        text: text.to_string(),
    })
}

pub(crate) async fn ingest_message(msg: &Message, state: &Arc<AppState>) {
    if !is_ingestible(&state.cfg, msg) {
        debug!("Chat {} is not a configured source", msg.chat.id.0);
        return;
    }
    let Some(m) = to_channel_message(msg) else {
        debug!("Skipping media-only message {} in chat {}", msg.id.0, msg.chat.id.0);
        return;
    };

    let store = state.store.clone();
    let id = m.source.storage_id();
    let channel = m.channel.clone();
    match tokio::task::spawn_blocking(move || store.save_message(&m)).await {
        Ok(Ok(true)) => debug!("Stored message {id} from {channel}"),
        Ok(Ok(false)) => debug!("Message {id} already stored"),
        Ok(Err(e)) => error!("Failed to store message {id}: {e}"),
        Err(e) => error!("Store task for message {id} failed: {e}"),
    }
}
