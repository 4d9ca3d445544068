use std::sync::Arc;

use chrono::{DateTime, Local};
use teloxide::{prelude::*, types::Message};
use tracing::{error, info, warn};

use teledigest_core::{
    commands::{help_html, BotCommand},
    digest::DigestOutcome,
    domain::{ChatId, TimeWindow, UserId},
    errors::Error,
    formatting::{escape_html, truncate_text},
    messaging::types::ChatAction,
    security::secrets_match,
};

use crate::router::AppState;

const NO_MESSAGES_REPLY: &str = "No messages collected in the last 24 hours.";
const BUSY_REPLY: &str = "A digest is already being generated, try again shortly.";
const AUTH_DISABLED_REPLY: &str = "Authentication is disabled.";
const AUTH_OK_REPLY: &str = "✅ Authenticated.";
const AUTH_WRONG_REPLY: &str = "❌ Wrong secret.";
const AUTH_USAGE_REPLY: &str = "Usage: /auth &lt;secret&gt;";

pub(crate) struct StatusSnapshot {
    pub last_24h: u64,
    pub total: u64,
    pub fts_enabled: bool,
    pub sources: usize,
    pub model: String,
    pub next_run: Option<DateTime<Local>>,
    pub running: bool,
}

pub(crate) fn status_html(s: &StatusSnapshot) -> String {
    let next = s
        .next_run
        .map(|t| t.format("%Y-%m-%d %H:%M %Z").to_string())
        .unwrap_or_else(|| "not scheduled".to_string());
    format!(
        "📊 <b>Teledigest status</b>\n\n\
Messages (24h): {}\n\
Messages (total): {}\n\
Full-text search: {}\n\
Sources: {}\n\
Model: <code>{}</code>\n\
Next digest: {}\n\
Digest running: {}",
        s.last_24h,
        s.total,
        if s.fts_enabled { "on" } else { "off" },
        s.sources,
        escape_html(&s.model),
        escape_html(&next),
        if s.running { "yes" } else { "no" },
    )
}

pub(crate) fn unknown_command_reply(cmd: &str) -> String {
    format!("Unknown command: /{}", escape_html(cmd))
}

/// Whole seconds to wait, rounded up.
pub(crate) fn rate_limited_reply(wait: std::time::Duration) -> String {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    format!("⏳ Too many /today requests. Try again in {}s.", secs.max(1))
}

async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    if let Err(e) = state.messenger.send_html(chat_id, html).await {
        warn!("Failed to reply in chat {}: {e}", chat_id.0);
    }
}

pub async fn handle_command(
    command: BotCommand,
    msg: &Message,
    user_id: Option<UserId>,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let chat_id = ChatId(msg.chat.id.0);

    match command {
        BotCommand::Help => reply(&state, chat_id, &help_html()).await,

        BotCommand::Status => {
            let body = match status_snapshot(&state).await {
                Ok(s) => status_html(&s),
                Err(e) => {
                    error!("Status lookup failed: {e}");
                    format!("⚠️ Status unavailable: <code>{}</code>", escape_html(&e.to_string()))
                }
            };
            reply(&state, chat_id, &body).await;
        }

        BotCommand::Today => {
            let Some(user_id) = user_id else {
                return Ok(());
            };
            handle_today(&state, chat_id, user_id).await;
        }

        BotCommand::Auth(secret) => {
            let Some(user_id) = user_id else {
                return Ok(());
            };
            let body = handle_auth(&state, user_id, &secret).await;
            reply(&state, chat_id, body).await;
        }

        BotCommand::Unknown(cmd) => reply(&state, chat_id, &unknown_command_reply(&cmd)).await,
    }

    Ok(())
}

async fn status_snapshot(state: &AppState) -> teledigest_core::Result<StatusSnapshot> {
    let store = state.store.clone();
    let (last_24h, total) = tokio::task::spawn_blocking(move || {
        Ok::<_, Error>((
            store.count_messages_for_range(TimeWindow::last_hours(24))?,
            store.count_messages()?,
        ))
    })
    .await
    .map_err(|e| Error::External(format!("status task failed: {e}")))??;

    Ok(StatusSnapshot {
        last_24h,
        total,
        fts_enabled: state.store.fts_enabled(),
        sources: state.cfg.sources.len(),
        model: state.digest.llm_description(),
        next_run: state.scheduler.next_run().await,
        running: state.digest.is_running(),
    })
}

async fn handle_today(state: &AppState, chat_id: ChatId, user_id: UserId) {
    let allowed = state.rate_limiter.lock().await.check(user_id);
    if let Err(wait) = allowed {
        reply(state, chat_id, &rate_limited_reply(wait)).await;
        return;
    }

    if let Err(e) = state
        .messenger
        .send_chat_action(chat_id, ChatAction::Typing)
        .await
    {
        warn!("Failed to send typing action: {e}");
    }

    info!("/today requested by user {} in chat {}", user_id.0, chat_id.0);
    match state
        .digest
        .publish(chat_id, TimeWindow::last_hours(24), state.messenger.as_ref())
        .await
    {
        Ok(DigestOutcome::Ready(_)) => {}
        Ok(DigestOutcome::Empty { .. }) => reply(state, chat_id, NO_MESSAGES_REPLY).await,
        Err(Error::Busy) => reply(state, chat_id, BUSY_REPLY).await,
        Err(e) => {
            error!("/today digest failed: {e}");
            let body = format!(
                "⚠️ Failed to generate digest: <code>{}</code>",
                escape_html(&truncate_text(&e.to_string(), 500))
            );
            reply(state, chat_id, &body).await;
        }
    }
}

async fn handle_auth(state: &AppState, user_id: UserId, secret: &str) -> &'static str {
    let Some(expected) = state.cfg.auth_secret.as_deref() else {
        return AUTH_DISABLED_REPLY;
    };
    if secret.is_empty() {
        return AUTH_USAGE_REPLY;
    }
    if !secrets_match(expected, secret) {
        warn!("Wrong /auth secret from user {}", user_id.0);
        return AUTH_WRONG_REPLY;
    }

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.authorize_user(user_id)).await {
        Ok(Ok(())) => {
            info!("User {} authenticated", user_id.0);
            AUTH_OK_REPLY
        }
        Ok(Err(e)) => {
            error!("Failed to persist authorization for {}: {e}", user_id.0);
            "⚠️ Could not save authorization, try again later."
        }
        Err(e) => {
            error!("Authorization task failed: {e}");
            "⚠️ Could not save authorization, try again later."
        }
    }
}
