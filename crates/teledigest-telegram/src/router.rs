use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use teledigest_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use teledigest_core::{
    commands::set_bot_menu_commands, config::Config, digest::DigestService,
    messaging::port::MessagingPort, scheduler::DigestScheduler, security::RateLimiter,
    storage::MessageStore,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<MessageStore>,
    pub digest: Arc<DigestService>,
    pub messenger: Arc<dyn MessagingPort>,
    pub scheduler: Arc<DigestScheduler>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

pub async fn run_polling(
    cfg: Arc<Config>,
    store: Arc<MessageStore>,
    digest: Arc<DigestService>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => info!("teledigest started: @{}", me.username()),
        Err(e) => warn!("getMe failed: {e}"),
    }
    info!(
        "Sources: {}, digest target: {}, allowed users: {}",
        cfg.sources.len(),
        cfg.digest_target.0,
        cfg.allowed_users.len()
    );

    // Digests go out as bursts to one chat; keep RetryAfter in the adapter too.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    if let Err(e) = set_bot_menu_commands(messenger.as_ref()).await {
        error!("Failed to set bot menu commands: {e}");
    }

    let scheduler = Arc::new(DigestScheduler::new(
        cfg.clone(),
        digest.clone(),
        messenger.clone(),
    )?);
    scheduler.start().await;

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        store,
        digest,
        messenger,
        scheduler: scheduler.clone(),
        rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
            cfg.today_rate_limit_requests,
            cfg.today_rate_limit_window,
        ))),
    });

    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(handlers::handle_channel_post))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    scheduler.stop().await;
    info!("teledigest stopped");
    Ok(())
}
