//! Repeating crawls for one search identity.
//!
//! The scheduler task owns its `SchedulerContext` and publishes read-only
//! snapshots through a watch channel. Cancellation is honored while idle and
//! before a crawl starts; a crawl already running always finishes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::crawler::{CrawlOutcome, CrawlRunner};
use crate::data_models::SearchIdentity;
use crate::notify::{NotifyConfig, NotifyReport, Notifier, notify_new_listings};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerContext {
    pub last_result: Option<CrawlOutcome>,
    pub params: SearchIdentity,
    pub scheduled: bool,
    #[serde(with = "duration_secs")]
    pub frequency: Duration,
    /// Crawls left to run; `None` repeats until cancelled.
    pub remaining: Option<u32>,
    pub last_error: Option<String>,
    pub last_notify: Option<NotifyReport>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }
}

impl SchedulerContext {
    pub fn new(params: SearchIdentity, frequency: Duration, remaining: Option<u32>) -> Self {
        Self {
            last_result: None,
            params,
            scheduled: false,
            frequency,
            remaining,
            last_error: None,
            last_notify: None,
        }
    }
}

pub struct Scheduler {
    runner: Arc<dyn CrawlRunner>,
    notifier: Option<(Arc<dyn Notifier>, NotifyConfig)>,
    context: SchedulerContext,
    updates: watch::Sender<SchedulerContext>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn CrawlRunner>,
        context: SchedulerContext,
    ) -> (Self, watch::Receiver<SchedulerContext>) {
        let (updates, receiver) = watch::channel(context.clone());
        (
            Self {
                runner,
                notifier: None,
                context,
                updates,
            },
            receiver,
        )
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, config: NotifyConfig) -> Self {
        self.notifier = Some((notifier, config));
        self
    }

    /// Runs until `remaining` reaches zero, the token is cancelled, or login fails.
    pub async fn run(mut self, token: CancellationToken) -> SchedulerContext {
        self.context.scheduled = true;
        self.publish();

        loop {
            if token.is_cancelled() || self.context.remaining == Some(0) {
                break;
            }

            let identity = self.context.params.clone();
            match self.runner.crawl(&identity).await {
                Ok(outcome) => {
                    self.context.last_notify = self.notify(&outcome).await;
                    self.context.last_error = None;
                    self.context.last_result = Some(outcome);
                }
                Err(e) => {
                    log::error!("scheduled crawl for {identity} failed: {e}");
                    self.context.last_error = Some(e.to_string());
                    if e.is_auth() {
                        self.context.remaining = self.context.remaining.map(|n| n.saturating_sub(1));
                        break;
                    }
                }
            }
            if let Some(n) = self.context.remaining.as_mut() {
                *n = n.saturating_sub(1);
            }
            self.publish();

            if self.context.remaining == Some(0) {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("schedule for {identity} cancelled");
                    break;
                }
                _ = tokio::time::sleep(self.context.frequency) => {}
            }
        }

        self.context.scheduled = false;
        self.publish();
        self.context
    }

    async fn notify(&self, outcome: &CrawlOutcome) -> Option<NotifyReport> {
        let (notifier, config) = self.notifier.as_ref()?;
        if outcome.new_listings.is_empty() {
            return None;
        }
        let report = notify_new_listings(
            notifier.as_ref(),
            config,
            &outcome.new_listings,
            outcome.batch_len,
        )
        .await;
        log::info!(
            "alerts: {} sent, {} suppressed, {} summarized, {} failed",
            report.sent,
            report.suppressed,
            report.summarized,
            report.failed
        );
        Some(report)
    }

    fn publish(&self) {
        self.updates.send_replace(self.context.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrawlError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        calls: AtomicUsize,
        fail_login: bool,
    }

    impl CountingRunner {
        fn new(fail_login: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_login,
            })
        }
    }

    #[async_trait]
    impl CrawlRunner for CountingRunner {
        async fn crawl(&self, identity: &SearchIdentity) -> Result<CrawlOutcome, CrawlError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_login {
                return Err(CrawlError::LoginFailure { attempts: 3 });
            }
            Ok(CrawlOutcome {
                crawl_id: format!("crawl-{n}"),
                identity: identity.clone(),
                listings: Vec::new(),
                new_listings: Vec::new(),
                batch_len: 0,
                rejected: 0,
                failed_steps: Vec::new(),
                crawled_at: Utc::now(),
            })
        }
    }

    fn context(remaining: Option<u32>) -> SchedulerContext {
        SchedulerContext::new(
            SearchIdentity::new("montreal", "search", "bike"),
            Duration::from_millis(1),
            remaining,
        )
    }

    #[tokio::test]
    async fn runs_exactly_remaining_times() {
        let runner = CountingRunner::new(false);
        let (scheduler, updates) = Scheduler::new(runner.clone(), context(Some(3)));

        let finished = scheduler.run(CancellationToken::new()).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(finished.remaining, Some(0));
        assert!(!finished.scheduled);
        assert_eq!(
            finished.last_result.map(|o| o.crawl_id),
            Some("crawl-2".to_string())
        );
        assert!(!updates.borrow().scheduled);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_crawls() {
        let runner = CountingRunner::new(false);
        let (scheduler, _updates) = Scheduler::new(runner.clone(), context(None));
        let token = CancellationToken::new();
        token.cancel();

        let finished = scheduler.run(token).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(finished.last_result.is_none());
    }

    #[tokio::test]
    async fn cancel_while_waiting_stops_schedule() {
        let runner = CountingRunner::new(false);
        let mut ctx = context(None);
        ctx.frequency = Duration::from_secs(3600);
        let (scheduler, mut updates) = Scheduler::new(runner.clone(), ctx);
        let token = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(token.clone()));

        updates
            .wait_for(|c| c.last_result.is_some())
            .await
            .unwrap();
        token.cancel();

        let finished = handle.await.unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(!finished.scheduled);
    }

    #[tokio::test]
    async fn login_failure_ends_schedule() {
        let runner = CountingRunner::new(true);
        let (scheduler, _updates) = Scheduler::new(runner.clone(), context(Some(5)));

        let finished = scheduler.run(CancellationToken::new()).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(finished.remaining, Some(4));
        assert_eq!(
            finished.last_error.as_deref(),
            Some("login failed after 3 attempt(s)")
        );
    }
}
