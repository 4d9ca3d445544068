//! Telegram update handlers.
//!
//! Channel posts and group messages from configured sources are stored;
//! `/commands` from users go to the command handler.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::{debug, error, warn};

use teledigest_core::{
    commands::BotCommand,
    domain::{ChatId, UserId},
    security::is_authorized,
    storage::MessageStore,
};

use crate::router::AppState;

mod commands;
mod ingest;

pub const UNAUTHORIZED_REPLY: &str =
    "Unauthorized. Use /auth &lt;secret&gt; or contact the bot owner.";

pub async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    ingest::ingest_message(&msg, &state).await;
    Ok(())
}

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let text = msg.text().unwrap_or("");

    if !text.starts_with('/') {
        if ingest::is_ingestible(&state.cfg, &msg) {
            ingest::ingest_message(&msg, &state).await;
        } else {
            debug!("Ignoring non-command message in chat {}", msg.chat.id.0);
        }
        return Ok(());
    }

    let command = BotCommand::parse(text);
    let user_id = msg.from().map(|u| UserId(u.id.0 as i64));

    // /auth is the way in, so it skips the check.
    if !matches!(command, BotCommand::Auth(_))
        && !user_is_authorized(&state.store, &state.cfg.allowed_users, user_id).await
    {
        reject_unauthorized(&state, ChatId(msg.chat.id.0)).await;
        return Ok(());
    }

    commands::handle_command(command, &msg, user_id, state).await
}

async fn reject_unauthorized(state: &AppState, chat_id: ChatId) {
    if let Err(e) = state.messenger.send_html(chat_id, UNAUTHORIZED_REPLY).await {
        warn!("Failed to send unauthorized reply in chat {}: {e}", chat_id.0);
    }
}

/// Allowlist first, then runtime grants from `/auth`.
async fn user_is_authorized(
    store: &Arc<MessageStore>,
    allowed_users: &[i64],
    user_id: Option<UserId>,
) -> bool {
    if is_authorized(user_id, allowed_users) {
        return true;
    }
    let Some(user_id) = user_id else {
        return false;
    };

    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.is_user_authorized(user_id)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            error!("Authorization lookup failed: {e}");
            false
        }
        Err(e) => {
            error!("Authorization lookup task failed: {e}");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{Mutex, Notify};

    use teledigest_core::{
        config::Config,
        digest::DigestService,
        domain::{MessageId, MessageRef},
        llm::{ChatRequest, ChatResponse, LlmClient},
        messaging::{
            port::MessagingPort,
            types::{ChatAction, MenuCommand, MessagingCapabilities},
        },
        scheduler::DigestScheduler,
        security::RateLimiter,
        storage::DEFAULT_RELEVANCE_QUERY,
        Result,
    };

    #[derive(Default)]
    pub(crate) struct FakeLlm {
        pub gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        fn describe(&self) -> String {
            "fake:test-model".to_string()
        }

        async fn complete(&self, _req: ChatRequest) -> Result<ChatResponse> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(ChatResponse {
                text: "**Digest**".to_string(),
                usage: None,
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeMessenger {
        pub sent: StdMutex<Vec<(ChatId, String)>>,
        pub actions: StdMutex<Vec<ChatId>>,
    }

    impl FakeMessenger {
        pub(crate) fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                max_message_len: 4096,
            }
        }

        async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((chat_id, html.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(sent.len() as i32),
            })
        }

        async fn send_chat_action(&self, chat_id: ChatId, _action: ChatAction) -> Result<()> {
            self.actions.lock().unwrap().push(chat_id);
            Ok(())
        }

        async fn set_menu_commands(&self, _c: &[MenuCommand], _l: &str) -> Result<()> {
            Ok(())
        }
    }

    /// `[telegram]` and `[limits]` lines are appended to a minimal config.
    pub(crate) fn test_state(
        telegram_extra: &str,
        limits: &str,
        llm: FakeLlm,
    ) -> (Arc<AppState>, Arc<FakeMessenger>) {
        let cfg = Arc::new(
            Config::from_toml_str(&format!(
                "[telegram]\nbot_token = \"1:x\"\ndigest_target = -100500\nsources = [\"@news\"]\n\
                 allowed_users = [42]\n{telegram_extra}\n[llm]\napi_key = \"k\"\n[limits]\n{limits}\n"
            ))
            .unwrap(),
        );
        let store = Arc::new(MessageStore::open_in_memory(DEFAULT_RELEVANCE_QUERY).unwrap());
        let digest = Arc::new(DigestService::new(cfg.clone(), store.clone(), Arc::new(llm)));
        let messenger = Arc::new(FakeMessenger::default());
        let scheduler = Arc::new(
            DigestScheduler::new(cfg.clone(), digest.clone(), messenger.clone()).unwrap(),
        );
        let state = Arc::new(AppState {
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                cfg.today_rate_limit_requests,
                cfg.today_rate_limit_window,
            ))),
            cfg,
            store,
            digest,
            messenger: messenger.clone(),
            scheduler,
        });
        (state, messenger)
    }

    #[tokio::test]
    async fn allowlisted_or_granted_users_are_authorized() {
        let (state, _) = test_state("", "", FakeLlm::default());
        let allowed = &state.cfg.allowed_users;

        assert!(user_is_authorized(&state.store, allowed, Some(UserId(42))).await);
        assert!(!user_is_authorized(&state.store, allowed, Some(UserId(7))).await);
        assert!(!user_is_authorized(&state.store, allowed, None).await);

        state.store.authorize_user(UserId(7)).unwrap();
        assert!(user_is_authorized(&state.store, allowed, Some(UserId(7))).await);
    }

    #[tokio::test]
    async fn unauthorized_reply_goes_through_messenger() {
        let (state, messenger) = test_state("", "", FakeLlm::default());
        reject_unauthorized(&state, ChatId(5)).await;

        let sent = messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChatId(5));
        assert_eq!(
            sent[0].1,
            "Unauthorized. Use /auth &lt;secret&gt; or contact the bot owner."
        );
    }
}
