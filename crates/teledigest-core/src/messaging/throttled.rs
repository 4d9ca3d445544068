use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, MenuCommand, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two Bot API calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

/// Hands out evenly spaced time slots.
#[derive(Debug)]
struct SlotClock {
    interval: Duration,
    next_free: Instant,
}

impl SlotClock {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_free: Instant::now(),
        }
    }

    /// Claim the next slot and return how long to wait for it.
    fn claim(&mut self) -> Duration {
        let now = Instant::now();
        let slot = self.next_free.max(now);
        self.next_free = slot + self.interval;
        slot - now
    }
}

/// MessagingPort decorator that spaces outbound calls.
///
/// Digests go out as several consecutive messages to one channel, which is
/// exactly what trips Telegram's per-chat flood limits.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<SlotClock>,
    per_chat: Mutex<HashMap<i64, SlotClock>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(SlotClock::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn wait_for_chat(&self, chat_id: ChatId) {
        let global_wait = self.global.lock().await.claim();
        let chat_wait = {
            let mut map = self.per_chat.lock().await;
            map.entry(chat_id.0)
                .or_insert_with(|| SlotClock::new(self.cfg.per_chat_min_interval))
                .claim()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn wait_global(&self) {
        let wait = self.global.lock().await.claim();
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.wait_for_chat(chat_id).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.wait_for_chat(chat_id).await;
        self.inner.send_chat_action(chat_id, action).await
    }

    async fn set_menu_commands(&self, commands: &[MenuCommand], lang_code: &str) -> Result<()> {
        self.wait_global().await;
        self.inner.set_menu_commands(commands, lang_code).await
    }
}
