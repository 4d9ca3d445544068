use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::{ChatAction, MenuCommand, MessagingCapabilities},
    Result,
};

/// Outbound messenger port.
///
/// Implemented by the Telegram adapter; tests use in-memory fakes.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()>;

    /// Replace the bot's command menu for the default scope and `lang_code`.
    async fn set_menu_commands(&self, commands: &[MenuCommand], lang_code: &str) -> Result<()>;
}
