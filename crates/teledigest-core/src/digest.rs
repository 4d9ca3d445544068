//! Digest pipeline: fetch recent messages, ask the LLM for a summary, post it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Local, Utc};
use tracing::{info, warn};

use crate::{
    config::Config,
    domain::{ChatId, StoredMessage, TimeWindow},
    formatting::{collapse_whitespace, convert_markdown_to_html, split_html_chunks, truncate_text},
    llm::{ChatMessage, ChatRequest, LlmClient},
    messaging::port::MessagingPort,
    storage::MessageStore,
    Error, Result,
};

const MESSAGES_PLACEHOLDER: &str = "{messages}";

#[derive(Clone, Debug)]
pub struct Digest {
    pub text_markdown: String,
    pub message_count: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum DigestOutcome {
    /// Nothing was collected in the window; the LLM was not called.
    Empty { window: TimeWindow },
    Ready(Digest),
}

/// Render rows as `[channel] text` paragraphs for the prompt.
pub fn render_messages(rows: &[StoredMessage], max_message_chars: usize) -> String {
    rows.iter()
        .map(|m| {
            format!(
                "[{}] {}",
                m.channel,
                truncate_text(&collapse_whitespace(&m.text), max_message_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn build_digest_prompt(rows: &[StoredMessage], cfg: &Config) -> Vec<ChatMessage> {
    let body = render_messages(rows, cfg.digest.max_message_chars);
    vec![
        ChatMessage::system(cfg.llm.system_prompt.clone()),
        ChatMessage::user(cfg.llm.user_prompt.replace(MESSAGES_PLACEHOLDER, &body)),
    ]
}

/// Telegram HTML for a finished digest: header, body, footer.
pub fn render_digest_html(digest: &Digest) -> String {
    let start = digest.start.with_timezone(&Local);
    let end = digest.end.with_timezone(&Local);
    format!(
        "📰 <b>Digest</b> · {} – {}\n\n{}\n\n<i>Based on {} post{}.</i>",
        start.format("%d %b %H:%M"),
        end.format("%d %b %H:%M"),
        convert_markdown_to_html(&digest.text_markdown),
        digest.message_count,
        if digest.message_count == 1 { "" } else { "s" }
    )
}

pub struct DigestService {
    cfg: Arc<Config>,
    store: Arc<MessageStore>,
    llm: Arc<dyn LlmClient>,
    running: AtomicBool,
}

/// Clears the running flag when a generation ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DigestService {
    pub fn new(cfg: Arc<Config>, store: Arc<MessageStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            cfg,
            store,
            llm,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn llm_description(&self) -> String {
        self.llm.describe()
    }

    /// The configured rolling window ending now.
    pub fn default_window(&self) -> TimeWindow {
        TimeWindow::last_hours(self.cfg.digest.window_hours)
    }

    pub async fn generate(&self, window: TimeWindow) -> Result<DigestOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let _guard = RunningGuard(&self.running);

        let rows = self.fetch_rows(window).await?;
        if rows.is_empty() {
            info!("No messages between {} and {}", window.start, window.end);
            return Ok(DigestOutcome::Empty { window });
        }

        info!("Generating digest from {} messages", rows.len());
        let req = ChatRequest {
            model: self.cfg.llm.model.clone(),
            messages: build_digest_prompt(&rows, &self.cfg),
            temperature: self.cfg.llm.temperature,
            max_tokens: self.cfg.llm.max_tokens,
        };
        let resp = self.llm.complete(req).await?;
        if let Some(u) = &resp.usage {
            info!(
                "LLM usage: {} prompt + {} completion tokens",
                u.prompt_tokens, u.completion_tokens
            );
        }

        let text = resp.text.trim().to_string();
        if text.is_empty() {
            return Err(Error::External("LLM returned an empty digest".to_string()));
        }

        Ok(DigestOutcome::Ready(Digest {
            text_markdown: text,
            message_count: rows.len(),
            start: window.start,
            end: window.end,
        }))
    }

    /// Generate and post a digest to `chat_id`. `Empty` posts nothing.
    pub async fn publish(
        &self,
        chat_id: ChatId,
        window: TimeWindow,
        messenger: &dyn MessagingPort,
    ) -> Result<DigestOutcome> {
        let outcome = self.generate(window).await?;
        let html = match &outcome {
            DigestOutcome::Ready(digest) => render_digest_html(digest),
            DigestOutcome::Empty { .. } => return Ok(outcome),
        };

        let limit = self
            .cfg
            .telegram_safe_limit
            .min(messenger.capabilities().max_message_len);
        let chunks = split_html_chunks(&html, limit);
        info!("Posting digest to chat {} in {} message(s)", chat_id.0, chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            if let Err(e) = messenger.send_html(chat_id, chunk).await {
                warn!("Failed to send digest part {}/{}: {e}", i + 1, chunks.len());
                return Err(e);
            }
        }

        Ok(outcome)
    }

    async fn fetch_rows(&self, window: TimeWindow) -> Result<Vec<StoredMessage>> {
        let store = self.store.clone();
        let use_relevance = self.cfg.digest.use_relevance;
        let max = self.cfg.digest.max_messages;

        tokio::task::spawn_blocking(move || {
            if use_relevance {
                store.get_relevant_messages_for_range(window, max)
            } else {
                store.get_messages_for_range(window, Some(max))
            }
        })
        .await
        .map_err(|e| Error::External(format!("storage task failed: {e}")))?
    }
}
