/// Outgoing "chat action" (typing indicator).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
}

/// One entry of the bot's command menu.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MenuCommand {
    pub command: String,
    pub description: String,
}

impl MenuCommand {
    pub fn new(command: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
        }
    }
}

/// Capabilities / limits of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub max_message_len: usize,
}
