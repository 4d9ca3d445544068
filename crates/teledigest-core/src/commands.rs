//! Bot command surface shared by adapters: the Telegram menu and the parser
//! for incoming `/command` texts.

use crate::{
    messaging::{port::MessagingPort, types::MenuCommand},
    Result,
};

pub const MENU_LANG_CODE: &str = "en";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BotCommand {
    Help,
    Status,
    Today,
    Auth(String),
    Unknown(String),
}

/// Commands shown in the Telegram menu, in display order.
pub fn menu_commands() -> Vec<MenuCommand> {
    vec![
        MenuCommand::new("status", "Check system status"),
        MenuCommand::new("today", "Request today's summary"),
        MenuCommand::new("help", "Get help info"),
        MenuCommand::new("auth", "Set authentication"),
    ]
}

/// Register [`menu_commands`] for the default scope in English.
pub async fn set_bot_menu_commands(messenger: &dyn MessagingPort) -> Result<()> {
    messenger
        .set_menu_commands(&menu_commands(), MENU_LANG_CODE)
        .await
}

/// Split `/cmd@botname args` into a lowercase command name and trimmed args.
pub fn split_command(text: &str) -> (String, String) {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

impl BotCommand {
    pub fn parse(text: &str) -> Self {
        let (cmd, args) = split_command(text);
        match cmd.as_str() {
            "start" | "help" => BotCommand::Help,
            "status" => BotCommand::Status,
            "today" => BotCommand::Today,
            "auth" => BotCommand::Auth(args),
            _ => BotCommand::Unknown(cmd),
        }
    }
}

pub fn help_html() -> String {
    let mut lines = vec![
        "📰 <b>Teledigest</b>".to_string(),
        String::new(),
        "I collect posts from the configured channels and publish an LLM-written digest on schedule.".to_string(),
        String::new(),
        "<b>Commands:</b>".to_string(),
    ];
    for c in menu_commands() {
        lines.push(format!("/{} - {}", c.command, c.description));
    }
    lines.push(String::new());
    lines.push("<i>/auth &lt;secret&gt; grants access when a passphrase is configured.</i>".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChatId, MessageId, MessageRef},
        messaging::types::{ChatAction, MessagingCapabilities},
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MenuRecorder {
        calls: Mutex<Vec<(Vec<MenuCommand>, String)>>,
    }

    #[async_trait]
    impl MessagingPort for MenuRecorder {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                max_message_len: 4096,
            }
        }

        async fn send_html(&self, chat_id: ChatId, _html: &str) -> Result<MessageRef> {
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(1),
            })
        }

        async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
            Ok(())
        }

        async fn set_menu_commands(&self, commands: &[MenuCommand], lang_code: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((commands.to_vec(), lang_code.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_bot_menu_commands_registers_menu_in_english() {
        let rec = MenuRecorder::default();
        set_bot_menu_commands(&rec).await.unwrap();

        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (cmds, lang) = &calls[0];
        assert_eq!(lang, "en");
        assert_eq!(
            cmds.iter().map(|c| c.command.as_str()).collect::<Vec<_>>(),
            vec!["status", "today", "help", "auth"]
        );
        assert_eq!(cmds[0].description, "Check system status");
        assert_eq!(cmds[1].description, "Request today's summary");
        assert_eq!(cmds[2].description, "Get help info");
        assert_eq!(cmds[3].description, "Set authentication");
    }

    #[test]
    fn parses_commands_with_bot_suffix_and_args() {
        assert_eq!(BotCommand::parse("/today"), BotCommand::Today);
        assert_eq!(BotCommand::parse("/Status@teledigest_bot"), BotCommand::Status);
        assert_eq!(BotCommand::parse("/start"), BotCommand::Help);
        assert_eq!(
            BotCommand::parse("/auth@bot   s3cret phrase "),
            BotCommand::Auth("s3cret phrase".to_string())
        );
        assert_eq!(
            BotCommand::parse("/weather now"),
            BotCommand::Unknown("weather".to_string())
        );
    }

    #[test]
    fn help_lists_every_menu_command() {
        let help = help_html();
        for c in menu_commands() {
            assert!(help.contains(&format!("/{}", c.command)));
        }
    }
}
