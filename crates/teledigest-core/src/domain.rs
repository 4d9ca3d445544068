use chrono::{DateTime, Utc};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric). Channels and supergroups are negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl MessageRef {
    /// Primary key used in the `messages` table.
    pub fn storage_id(&self) -> String {
        format!("{}:{}", self.chat_id.0, self.message_id.0)
    }
}

/// A message collected from a source chat, ready to be stored.
#[derive(Clone, Debug)]
pub struct ChannelMessage {
    pub source: MessageRef,
    pub channel: String,
    pub date: DateTime<Utc>,
    pub text: String,
}

/// A stored message as returned by digest queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub channel: String,
    pub text: String,
}

/// Inclusive UTC time range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Rolling window ending now.
    pub fn last_hours(hours: u32) -> Self {
        let end = Utc::now();
        Self {
            start: end - chrono::Duration::hours(i64::from(hours)),
            end,
        }
    }
}
