//! Cron-driven digest publishing.
//!
//! One job: at every match of `digest.schedule` (local time) generate a digest
//! for the configured window and post it to `telegram.digest_target`.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    cron::CronExpr,
    digest::{DigestOutcome, DigestService},
    formatting::{escape_html, truncate_text},
    messaging::port::MessagingPort,
    Error, Result,
};

const MAX_ERROR_REPORT_CHARS: usize = 500;
const RECHECK_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct DigestScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    cfg: Arc<Config>,
    expr: CronExpr,
    digest: Arc<DigestService>,
    messenger: Arc<dyn MessagingPort>,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    job: Option<(CancellationToken, JoinHandle<()>)>,
    next_run: Option<DateTime<Local>>,
}

impl DigestScheduler {
    pub fn new(
        cfg: Arc<Config>,
        digest: Arc<DigestService>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Result<Self> {
        let expr = CronExpr::parse(&cfg.digest.schedule)?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                cfg,
                expr,
                digest,
                messenger,
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        })
    }

    /// Spawn the job loop. Restarts it if already running.
    pub async fn start(&self) {
        self.stop().await;

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let cancel_for_task = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.job_loop(cancel_for_task).await;
        });

        let mut st = self.inner.state.lock().await;
        st.next_run = self.inner.expr.next_after(&Local::now());
        st.job = Some((cancel, handle));
        info!(
            "Digest scheduler started ({}), next run at {}",
            self.inner.expr,
            describe_next(st.next_run)
        );
    }

    pub async fn stop(&self) {
        let mut st = self.inner.state.lock().await;
        if let Some((cancel, handle)) = st.job.take() {
            cancel.cancel();
            handle.abort();
        }
        st.next_run = None;
    }

    /// Next scheduled run, or `None` when stopped.
    pub async fn next_run(&self) -> Option<DateTime<Local>> {
        self.inner.state.lock().await.next_run
    }

    async fn job_loop(&self, cancel: CancellationToken) {
        loop {
            let next = self.inner.expr.next_after(&Local::now());
            self.inner.state.lock().await.next_run = next;

            let Some(next) = next else {
                warn!(
                    "No upcoming run for schedule {}, checking again in {:?}",
                    self.inner.expr, RECHECK_INTERVAL
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(RECHECK_INTERVAL) => {}
                }
                continue;
            };

            let dur = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(dur) => self.run_once().await,
            }
        }
    }

    /// Publish one scheduled digest. Failures are logged and reported to the
    /// target chat; an overlapping run is skipped.
    pub async fn run_once(&self) {
        let target = self.inner.cfg.digest_target;
        let window = self.inner.digest.default_window();
        info!("Running scheduled digest for chat {}", target.0);

        match self
            .inner
            .digest
            .publish(target, window, self.inner.messenger.as_ref())
            .await
        {
            Ok(DigestOutcome::Ready(d)) => {
                info!("Scheduled digest posted ({} messages)", d.message_count)
            }
            Ok(DigestOutcome::Empty { .. }) => {
                info!("No messages in the window, scheduled digest skipped")
            }
            Err(Error::Busy) => warn!("Digest already running, scheduled run skipped"),
            Err(e) => {
                error!("Scheduled digest failed: {e}");
                let report = format!(
                    "⚠️ Scheduled digest failed: <code>{}</code>",
                    escape_html(&truncate_text(&e.to_string(), MAX_ERROR_REPORT_CHARS))
                );
                if let Err(e) = self.inner.messenger.send_html(target, &report).await {
                    error!("Failed to report digest failure: {e}");
                }
            }
        }
    }
}

fn describe_next(next: Option<DateTime<Local>>) -> String {
    next.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::tests::{seeded_store, test_config, FakeLlm, FakeMessenger};
    use crate::domain::ChatId;

    fn scheduler(llm_reply: &str, texts: &[&str]) -> (DigestScheduler, Arc<FakeMessenger>) {
        let cfg = test_config();
        let digest = Arc::new(DigestService::new(
            cfg.clone(),
            seeded_store(texts),
            Arc::new(FakeLlm::replying(llm_reply)),
        ));
        let messenger = Arc::new(FakeMessenger::default());
        let s = DigestScheduler::new(cfg, digest, messenger.clone()).unwrap();
        (s, messenger)
    }

    #[tokio::test]
    async fn run_once_posts_to_digest_target() {
        let (s, messenger) = scheduler("Sanctions **expanded**", &["EU sanctions"]);
        s.run_once().await;

        let sent = messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChatId(-100500));
        assert!(sent[0].1.contains("Sanctions <b>expanded</b>"));
    }

    #[tokio::test]
    async fn run_once_with_no_messages_sends_nothing() {
        let (s, messenger) = scheduler("unused", &[]);
        s.run_once().await;
        assert!(messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_reported_to_target_chat() {
        let (s, messenger) = scheduler("", &["war update"]);
        s.run_once().await;

        let sent = messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChatId(-100500));
        assert!(sent[0].1.starts_with("⚠️ Scheduled digest failed: <code>"));
        assert!(sent[0].1.contains("empty digest"));
    }

    #[tokio::test]
    async fn start_and_stop_track_next_run() {
        let (s, _messenger) = scheduler("unused", &[]);
        assert!(s.next_run().await.is_none());

        s.start().await;
        let next = s.next_run().await.unwrap();
        assert!(next > Local::now());

        s.stop().await;
        assert!(s.next_run().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_survives_schedule_without_upcoming_run() {
        let mut cfg = (*test_config()).clone();
        cfg.digest.schedule = "0 0 31 2 *".to_string();
        let cfg = Arc::new(cfg);
        let digest = Arc::new(DigestService::new(
            cfg.clone(),
            seeded_store(&[]),
            Arc::new(FakeLlm::replying("")),
        ));
        let s = DigestScheduler::new(cfg, digest, Arc::new(FakeMessenger::default())).unwrap();

        s.start().await;
        tokio::time::sleep(RECHECK_INTERVAL * 3).await;
        {
            let st = s.inner.state.lock().await;
            let (_, handle) = st.job.as_ref().unwrap();
            assert!(!handle.is_finished());
            assert!(st.next_run.is_none());
        }
        s.stop().await;
    }

    #[test]
    fn bad_schedule_is_rejected() {
        let mut cfg = (*test_config()).clone();
        cfg.digest.schedule = "61 * * * *".to_string();
        let cfg = Arc::new(cfg);
        let digest = Arc::new(DigestService::new(
            cfg.clone(),
            seeded_store(&[]),
            Arc::new(FakeLlm::replying("")),
        ));
        assert!(DigestScheduler::new(cfg, digest, Arc::new(FakeMessenger::default())).is_err());
    }
}
