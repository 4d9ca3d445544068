use std::sync::Arc;

use anyhow::Context;
use teledigest_core::{config::Config, digest::DigestService, llm::LlmClient, storage::MessageStore};
use teledigest_openai::OpenAiClient;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::load().context("failed to load configuration")?);
    teledigest_core::logging::init("teledigest", &cfg.log_level)?;
    for w in &cfg.warnings {
        warn!("{w}");
    }

    let store = Arc::new(
        MessageStore::open(&cfg.db_path, cfg.digest.relevance_query.clone())
            .with_context(|| format!("failed to open database {}", cfg.db_path.display()))?,
    );
    info!(
        "Database ready at {} (FTS {})",
        store.path().display(),
        if store.fts_enabled() { "on" } else { "off" }
    );

    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::from_config(&cfg.llm)?);
    info!("LLM backend: {}", llm.describe());

    let digest = Arc::new(DigestService::new(cfg.clone(), store.clone(), llm));

    teledigest_telegram::router::run_polling(cfg, store, digest)
        .await
        .context("telegram bot failed")?;

    Ok(())
}
