//! Transient, UI-facing download state.
//!
//! `DownloadTracker` turns download outcomes into a `DownloadUiState` that a
//! front end can watch. Success and error flags clear themselves after a
//! fixed delay; analytics are recorded only for confirmed downloads.

use crate::backend::Backend;
use crate::database::Database;
use crate::downloader::{DownloadOptions, DownloadRequest, Downloader};
use crate::error::PortalResult;
use crate::models::{BatchDownloadResult, DownloadOutcome, Progress};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// The download half of the tracker, implemented by `Downloader`.
pub trait FileDownloader: Send + Sync + 'static {
    fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> impl Future<Output = DownloadOutcome> + Send;

    fn download_batch(
        &self,
        requests: &[DownloadRequest],
        on_batch_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> impl Future<Output = BatchDownloadResult> + Send;
}

impl FileDownloader for Downloader {
    async fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> DownloadOutcome {
        self.download_file(url, options, on_progress).await
    }

    async fn download_batch(
        &self,
        requests: &[DownloadRequest],
        on_batch_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> BatchDownloadResult {
        self.download_multiple(requests, on_batch_progress).await
    }
}

/// The resource a download belongs to, for analytics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub id: String,
    pub title: String,
}

pub trait AnalyticsSink: Send + Sync + 'static {
    fn record_download(
        &self,
        resource: &ResourceRef,
    ) -> impl Future<Output = PortalResult<()>> + Send;
}

/// Writes download events to the backend.
pub struct DatabaseAnalytics<B: Backend> {
    db: Database<B>,
}

impl<B: Backend> DatabaseAnalytics<B> {
    pub fn new(db: Database<B>) -> Self {
        Self { db }
    }
}

impl<B: Backend> AnalyticsSink for DatabaseAnalytics<B> {
    async fn record_download(&self, resource: &ResourceRef) -> PortalResult<()> {
        self.db
            .record_download(&resource.id, &resource.title)
            .await
            .map(|_| ())
    }
}

/// Only logs; used when no backend is configured.
pub struct LogAnalytics;

impl AnalyticsSink for LogAnalytics {
    async fn record_download(&self, resource: &ResourceRef) -> PortalResult<()> {
        info!(resource_id = %resource.id, "Downloaded {}", resource.title);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadUiState {
    pub is_downloading: bool,
    pub progress: u8,
    pub error: Option<String>,
    pub success: bool,
}

struct TrackerInner<D, A> {
    downloader: Arc<D>,
    analytics: Arc<A>,
    state: watch::Sender<DownloadUiState>,
    generation: AtomicU64,
    success_clear_after: Duration,
    error_clear_after: Duration,
}

pub struct DownloadTracker<D, A> {
    inner: Arc<TrackerInner<D, A>>,
}

impl<D, A> Clone for DownloadTracker<D, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Clone, Copy)]
enum Flag {
    Success,
    Error,
}

impl<D: FileDownloader, A: AnalyticsSink> DownloadTracker<D, A> {
    pub fn new(
        downloader: Arc<D>,
        analytics: Arc<A>,
        success_clear_after: Duration,
        error_clear_after: Duration,
    ) -> Self {
        let (state, _) = watch::channel(DownloadUiState::default());
        Self {
            inner: Arc::new(TrackerInner {
                downloader,
                analytics,
                state,
                generation: AtomicU64::new(0),
                success_clear_after,
                error_clear_after,
            }),
        }
    }

    pub fn state(&self) -> DownloadUiState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadUiState> {
        self.inner.state.subscribe()
    }

    pub async fn download(
        &self,
        url: &str,
        options: &DownloadOptions,
        resource: Option<ResourceRef>,
    ) -> DownloadOutcome {
        let generation = self.begin();
        let state = &self.inner.state;
        let on_progress = |p: Progress| state.send_modify(|s| s.progress = p.percent);

        let outcome = self
            .inner
            .downloader
            .download(url, options, &on_progress)
            .await;

        match &outcome.error {
            None if outcome.success => {
                self.succeed(generation);
                if let Some(resource) = resource {
                    if let Err(e) = self.inner.analytics.record_download(&resource).await {
                        warn!("Failed to record download of {}: {}", resource.id, e);
                    }
                }
            }
            error => {
                let message = error
                    .clone()
                    .unwrap_or_else(|| "Download failed".to_string());
                self.fail(generation, message);
            }
        }

        outcome
    }

    pub async fn download_multiple(&self, requests: &[DownloadRequest]) -> BatchDownloadResult {
        let generation = self.begin();
        let state = &self.inner.state;
        let on_batch_progress = |done: usize, total: usize| {
            let percent = if total == 0 { 100 } else { done * 100 / total };
            state.send_modify(|s| s.progress = percent as u8);
        };

        let result = self
            .inner
            .downloader
            .download_batch(requests, &on_batch_progress)
            .await;

        if result.failed() == 0 {
            self.succeed(generation);
        } else {
            self.fail(
                generation,
                format!("{} of {} downloads failed", result.failed(), result.total()),
            );
        }
        result
    }

    fn begin(&self) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.send_modify(|s| {
            s.is_downloading = true;
            s.progress = 0;
            s.error = None;
            s.success = false;
        });
        generation
    }

    fn succeed(&self, generation: u64) {
        self.inner.state.send_modify(|s| {
            s.is_downloading = false;
            s.progress = 100;
            s.success = true;
            s.error = None;
        });
        self.schedule_clear(generation, Flag::Success, self.inner.success_clear_after);
    }

    fn fail(&self, generation: u64, message: String) {
        self.inner.state.send_modify(|s| {
            s.is_downloading = false;
            s.success = false;
            s.error = Some(message);
        });
        self.schedule_clear(generation, Flag::Error, self.inner.error_clear_after);
    }

    fn schedule_clear(&self, generation: u64, flag: Flag, after: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            sleep(after).await;
            // A newer download owns the state now.
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            inner.state.send_modify(|s| match flag {
                Flag::Success => s.success = false,
                Flag::Error => s.error = None,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::config::{DatabaseConfig, MonitorConfig};
    use crate::monitor::ConnectionMonitor;
    use std::sync::Mutex;

    struct FakeDownloader {
        outcome: DownloadOutcome,
    }

    impl FileDownloader for FakeDownloader {
        async fn download(
            &self,
            _url: &str,
            _options: &DownloadOptions,
            on_progress: &(dyn Fn(Progress) + Send + Sync),
        ) -> DownloadOutcome {
            for percent in [20, 60] {
                on_progress(Progress {
                    percent,
                    estimated: false,
                });
            }
            self.outcome.clone()
        }

        async fn download_batch(
            &self,
            requests: &[DownloadRequest],
            on_batch_progress: &(dyn Fn(usize, usize) + Send + Sync),
        ) -> BatchDownloadResult {
            let mut result = BatchDownloadResult::default();
            for (idx, request) in requests.iter().enumerate() {
                result.outcomes.push(if request.url.contains("missing") {
                    DownloadOutcome::failed(None, "HTTP request failed: 404")
                } else {
                    DownloadOutcome::succeeded("file".into(), 1)
                });
                on_batch_progress(idx + 1, requests.len());
            }
            result
        }
    }

    #[derive(Default)]
    struct RecordingAnalytics {
        events: Mutex<Vec<ResourceRef>>,
    }

    impl AnalyticsSink for RecordingAnalytics {
        async fn record_download(&self, resource: &ResourceRef) -> PortalResult<()> {
            self.events.lock().unwrap().push(resource.clone());
            Ok(())
        }
    }

    fn tracker(
        outcome: DownloadOutcome,
    ) -> (
        DownloadTracker<FakeDownloader, RecordingAnalytics>,
        Arc<RecordingAnalytics>,
    ) {
        let analytics = Arc::new(RecordingAnalytics::default());
        let tracker = DownloadTracker::new(
            Arc::new(FakeDownloader { outcome }),
            Arc::clone(&analytics),
            Duration::from_millis(3000),
            Duration::from_millis(5000),
        );
        (tracker, analytics)
    }

    fn resource() -> ResourceRef {
        ResourceRef {
            id: "17".into(),
            title: "Contingency plan".into(),
        }
    }

    async fn advance(ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_flag_clears_after_three_seconds() {
        let (tracker, analytics) = tracker(DownloadOutcome::succeeded("plan.pdf".into(), 10));

        let outcome = tracker
            .download("https://x.org/plan.pdf", &DownloadOptions::default(), Some(resource()))
            .await;
        assert!(outcome.success);

        let state = tracker.state();
        assert!(state.success);
        assert!(!state.is_downloading);
        assert_eq!(state.progress, 100);
        assert_eq!(*analytics.events.lock().unwrap(), vec![resource()]);

        advance(2999).await;
        assert!(tracker.state().success);
        advance(2).await;
        assert!(!tracker.state().success);
    }

    #[tokio::test(start_paused = true)]
    async fn error_clears_after_five_seconds_without_analytics() {
        let (tracker, analytics) =
            tracker(DownloadOutcome::failed(None, "HTTP request failed: 404"));

        tracker
            .download("https://x.org/gone.pdf", &DownloadOptions::default(), Some(resource()))
            .await;

        assert_eq!(tracker.state().error.as_deref(), Some("HTTP request failed: 404"));
        assert!(!tracker.state().success);
        assert!(analytics.events.lock().unwrap().is_empty());

        advance(4999).await;
        assert!(tracker.state().error.is_some());
        advance(2).await;
        assert!(tracker.state().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn external_open_is_not_recorded() {
        let outcome = DownloadOutcome {
            opened_externally: true,
            ..DownloadOutcome::failed(None, "HTTP request failed: 500")
        };
        let (tracker, analytics) = tracker(outcome);

        tracker
            .download("https://x.org/plan.pdf", &DownloadOptions::default(), Some(resource()))
            .await;

        assert!(analytics.events.lock().unwrap().is_empty());
        assert!(tracker.state().error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_clear_newer_result() {
        let (tracker, _analytics) = tracker(DownloadOutcome::succeeded("a.pdf".into(), 1));

        tracker
            .download("https://x.org/a.pdf", &DownloadOptions::default(), None)
            .await;
        advance(2000).await;
        tracker
            .download("https://x.org/a.pdf", &DownloadOptions::default(), None)
            .await;

        advance(1500).await;
        assert!(tracker.state().success);
        advance(1501).await;
        assert!(!tracker.state().success);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_failure_is_summarised() {
        let (tracker, _analytics) = tracker(DownloadOutcome::default());
        let requests = vec![
            DownloadRequest::new("https://x.org/a.pdf"),
            DownloadRequest::new("https://x.org/missing.pdf"),
            DownloadRequest::new("https://x.org/c.pdf"),
        ];

        let result = tracker.download_multiple(&requests).await;

        assert_eq!(result.total(), 3);
        let state = tracker.state();
        assert_eq!(state.progress, 100);
        assert_eq!(state.error.as_deref(), Some("1 of 3 downloads failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_published_to_watchers() {
        let (tracker, _analytics) = tracker(DownloadOutcome::succeeded("a.pdf".into(), 1));
        let mut rx = tracker.subscribe();

        tracker
            .download("https://x.org/a.pdf", &DownloadOptions::default(), None)
            .await;

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().success);
    }

    #[tokio::test(start_paused = true)]
    async fn database_analytics_writes_event_rows() {
        let backend = Arc::new(FakeBackend::new());
        let monitor = ConnectionMonitor::new(Arc::clone(&backend), MonitorConfig::default());
        let database = Database::new(monitor.clone(), DatabaseConfig::default());
        let analytics = DatabaseAnalytics::new(database);

        analytics.record_download(&resource()).await.unwrap();

        let rows = backend.rows("download_events");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Contingency plan");
        monitor.dispose();
    }
}
