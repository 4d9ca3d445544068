use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Local;
use serde::Deserialize;

use crate::{cron::CronExpr, domain::ChatId, errors::Error, storage::DEFAULT_RELEVANCE_QUERY, Result};

const DEFAULT_CONFIG_PATH: &str = "teledigest.toml";
const MESSAGES_PLACEHOLDER: &str = "{messages}";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a news editor. You read posts collected from \
Telegram channels and write a concise digest of the most important events. \
Group related posts into topics, keep facts and numbers, drop duplicates and ads, \
and never invent information that is not present in the posts.";

const DEFAULT_USER_PROMPT: &str = "Below are Telegram posts from the reporting period, \
one per paragraph, each prefixed with its channel in square brackets.\n\
Write a digest in Markdown: a short headline list of the key events followed by \
a few sections with bullet points. Mention the source channel for notable claims.\n\n\
Posts:\n\n{messages}";

/// Typed configuration, loaded from `teledigest.toml` plus env overrides.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub sources: Vec<SourceChat>,
    pub digest_target: ChatId,
    pub allowed_users: Vec<i64>,
    pub auth_secret: Option<String>,
    pub telegram_safe_limit: usize,

    pub llm: LlmConfig,
    pub db_path: PathBuf,
    pub digest: DigestConfig,

    // /today rate limiting
    pub today_rate_limit_requests: u32,
    pub today_rate_limit_window: Duration,

    pub log_level: String,

    /// Non-fatal problems found while loading; logged once tracing is up.
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Clone, Debug)]
pub struct DigestConfig {
    pub schedule: String,
    pub window_hours: u32,
    pub max_messages: usize,
    pub max_message_chars: usize,
    pub relevance_query: String,
    pub use_relevance: bool,
}

/// A chat the bot collects messages from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceChat {
    Id(ChatId),
    /// Public username, stored lowercase without the leading `@`.
    Username(String),
}

impl SourceChat {
    pub fn matches(&self, chat_id: ChatId, username: Option<&str>) -> bool {
        match self {
            SourceChat::Id(id) => *id == chat_id,
            SourceChat::Username(name) => username
                .map(|u| u.trim_start_matches('@').eq_ignore_ascii_case(name))
                .unwrap_or(false),
        }
    }
}

// === File format ===

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    telegram: RawTelegram,
    #[serde(default)]
    llm: RawLlm,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    digest: RawDigest,
    #[serde(default)]
    limits: RawLimits,
    #[serde(default)]
    logging: RawLogging,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTelegram {
    bot_token: Option<String>,
    #[serde(default)]
    sources: Vec<RawSource>,
    digest_target: Option<i64>,
    #[serde(default)]
    allowed_users: Vec<i64>,
    auth_secret: Option<String>,
    safe_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSource {
    Id(i64),
    Name(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLlm {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
    system_prompt: Option<String>,
    user_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorage {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDigest {
    schedule: Option<String>,
    window_hours: Option<u32>,
    max_messages: Option<usize>,
    max_message_chars: Option<usize>,
    relevance_query: Option<String>,
    use_relevance: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    today_requests: Option<u32>,
    today_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLogging {
    level: Option<String>,
}

impl Config {
    /// Load `.env`, then the TOML file (`TELEDIGEST_CONFIG` or `./teledigest.toml`),
    /// then apply env overrides for secrets.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let path = env_path("TELEDIGEST_CONFIG").unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let contents = fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;

        let mut raw: RawConfig = toml::from_str(&contents)?;
        apply_env_overrides(&mut raw);
        Self::from_raw(raw)
    }

    /// Parse a config document without consulting the environment.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(input)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let RawConfig {
            telegram,
            llm,
            storage,
            digest,
            limits,
            logging,
        } = raw;

        let telegram_bot_token = telegram
            .bot_token
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config(
                    "telegram.bot_token (or TELEGRAM_BOT_TOKEN) is required".to_string(),
                )
            })?;

        let digest_target = telegram
            .digest_target
            .map(ChatId)
            .ok_or_else(|| Error::Config("telegram.digest_target is required".to_string()))?;

        let sources = telegram
            .sources
            .into_iter()
            .filter_map(|s| match s {
                RawSource::Id(id) => Some(SourceChat::Id(ChatId(id))),
                RawSource::Name(name) => {
                    let name = name.trim().trim_start_matches('@').to_lowercase();
                    if name.is_empty() {
                        None
                    } else {
                        Some(SourceChat::Username(name))
                    }
                }
            })
            .collect::<Vec<_>>();
        let mut warnings = Vec::new();
        if sources.is_empty() {
            warnings.push("telegram.sources is empty; no messages will be collected".to_string());
        }

        let api_key = llm.api_key.and_then(non_empty).ok_or_else(|| {
            Error::Config("llm.api_key (or OPENAI_API_KEY) is required".to_string())
        })?;

        let user_prompt = llm
            .user_prompt
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_USER_PROMPT.to_string());
        if !user_prompt.contains(MESSAGES_PLACEHOLDER) {
            return Err(Error::Config(format!(
                "llm.user_prompt must contain the {MESSAGES_PLACEHOLDER} placeholder"
            )));
        }

        let llm = LlmConfig {
            api_key,
            base_url: llm
                .base_url
                .and_then(non_empty)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: llm
                .model
                .and_then(non_empty)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            temperature: llm.temperature.unwrap_or(0.4).clamp(0.0, 2.0),
            max_tokens: llm.max_tokens,
            timeout: Duration::from_secs(llm.timeout_secs.unwrap_or(120).max(1)),
            system_prompt: llm
                .system_prompt
                .and_then(non_empty)
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            user_prompt,
        };

        let schedule = digest
            .schedule
            .and_then(non_empty)
            .unwrap_or_else(|| "0 21 * * *".to_string());
        let expr = CronExpr::parse(&schedule)
            .map_err(|e| Error::Config(format!("digest.schedule {schedule:?}: {e}")))?;
        if expr.next_after(&Local::now()).is_none() {
            return Err(Error::Config(format!(
                "digest.schedule {schedule:?} never fires"
            )));
        }

        let window_hours = digest.window_hours.unwrap_or(24);
        if !(1..=168).contains(&window_hours) {
            return Err(Error::Config(format!(
                "digest.window_hours must be between 1 and 168, got {window_hours}"
            )));
        }
        let max_messages = digest.max_messages.unwrap_or(200);
        if max_messages == 0 {
            return Err(Error::Config("digest.max_messages must be >= 1".to_string()));
        }

        let digest = DigestConfig {
            schedule,
            window_hours,
            max_messages,
            max_message_chars: digest.max_message_chars.unwrap_or(1000).max(50),
            relevance_query: digest
                .relevance_query
                .and_then(non_empty)
                .unwrap_or_else(|| DEFAULT_RELEVANCE_QUERY.to_string()),
            use_relevance: digest.use_relevance.unwrap_or(true),
        };

        Ok(Self {
            telegram_bot_token,
            sources,
            digest_target,
            allowed_users: telegram.allowed_users,
            auth_secret: telegram.auth_secret.and_then(non_empty),
            telegram_safe_limit: telegram.safe_limit.unwrap_or(4000).clamp(200, 4096),
            llm,
            db_path: storage
                .db_path
                .unwrap_or_else(|| PathBuf::from("data/messages.db")),
            digest,
            today_rate_limit_requests: limits.today_requests.unwrap_or(3).max(1),
            today_rate_limit_window: Duration::from_secs(
                limits.today_window_secs.unwrap_or(3600).max(1),
            ),
            log_level: logging
                .level
                .and_then(non_empty)
                .unwrap_or_else(|| "info".to_string()),
            warnings,
        })
    }

    pub fn is_source(&self, chat_id: ChatId, username: Option<&str>) -> bool {
        self.sources.iter().any(|s| s.matches(chat_id, username))
    }
}

fn apply_env_overrides(raw: &mut RawConfig) {
    if let Some(v) = env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty) {
        raw.telegram.bot_token = Some(v);
    }
    if let Some(v) = env_str("OPENAI_API_KEY").and_then(non_empty) {
        raw.llm.api_key = Some(v);
    }
    if let Some(v) = env_str("OPENAI_BASE_URL").and_then(non_empty) {
        raw.llm.base_url = Some(v);
    }
    if let Some(v) = env_str("TELEDIGEST_AUTH_SECRET").and_then(non_empty) {
        raw.telegram.auth_secret = Some(v);
    }
    if let Some(v) = env_path("TELEDIGEST_DB_PATH") {
        raw.storage.db_path = Some(v);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue;
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return &s[1..s.len() - 1];
    }
    s
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
