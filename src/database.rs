//! Connection-guarded access to backend tables and storage buckets.

use crate::backend::{Backend, Query};
use crate::config::DatabaseConfig;
use crate::error::{PortalError, PortalResult};
use crate::models::{DownloadEvent, Record};
use crate::monitor::ConnectionMonitor;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub struct Database<B: Backend> {
    backend: Arc<B>,
    monitor: ConnectionMonitor<B>,
    config: DatabaseConfig,
}

impl<B: Backend> Clone for Database<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            monitor: self.monitor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: Backend> Database<B> {
    pub fn new(monitor: ConnectionMonitor<B>, config: DatabaseConfig) -> Self {
        Self {
            backend: Arc::clone(monitor.backend()),
            monitor,
            config,
        }
    }

    pub fn monitor(&self) -> &ConnectionMonitor<B> {
        &self.monitor
    }

    /// Make sure the backend is usable before a request goes out.
    pub async fn ensure_connection(&self) -> PortalResult<()> {
        let state = self.monitor.state();

        if !state.is_connected {
            debug!("Not connected, attempting reconnection");
            return self.reconnect_or_fail().await;
        }

        if !state.is_fresh(self.config.freshness_window) {
            debug!("Connection state is stale, re-checking");
            if !self.monitor.test_connection().await {
                return self.reconnect_or_fail().await;
            }
        }

        Ok(())
    }

    async fn reconnect_or_fail(&self) -> PortalResult<()> {
        if self.reconnect_with_retry().await {
            return Ok(());
        }
        let last_error = self
            .monitor
            .state()
            .last_error
            .unwrap_or_else(|| "unknown error".to_string());
        Err(PortalError::Network(format!(
            "Backend unreachable after {} attempts: {}",
            self.config.reconnect_attempts, last_error
        )))
    }

    /// Probe up to `reconnect_attempts` times, waiting `retry_delay * n`
    /// after the n-th failure.
    pub async fn reconnect_with_retry(&self) -> bool {
        let attempts = self.config.reconnect_attempts.max(1);

        for attempt in 1..=attempts {
            if self.monitor.test_connection().await {
                if attempt > 1 {
                    info!("Reconnected on attempt {}/{}", attempt, attempts);
                }
                return true;
            }

            if attempt < attempts {
                let delay = self.config.retry_delay * attempt;
                warn!(
                    "Reconnect attempt {}/{} failed, retrying in {}ms",
                    attempt,
                    attempts,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }

        error!("Unable to reconnect after {} attempts", attempts);
        false
    }

    pub async fn list<R: Record>(&self) -> PortalResult<Vec<R>> {
        self.list_where(Query::new().order("id", false)).await
    }

    pub async fn list_where<R: Record>(&self, query: Query) -> PortalResult<Vec<R>> {
        self.ensure_connection().await?;
        let rows = self.backend.select(R::TABLE, &query).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(PortalError::from))
            .collect()
    }

    pub async fn get<R: Record>(&self, id: i64) -> PortalResult<Option<R>> {
        let mut rows = self
            .list_where::<R>(Query::new().eq("id", id).limit(1))
            .await?;
        Ok(rows.pop())
    }

    pub async fn create<R: Record>(&self, record: &R) -> PortalResult<R> {
        self.ensure_connection().await?;
        let row = serde_json::to_value(record)?;
        let created = self.backend.insert(R::TABLE, row).await?;
        Ok(serde_json::from_value(created)?)
    }

    pub async fn update<R: Record>(&self, id: i64, record: &R) -> PortalResult<Option<R>> {
        self.ensure_connection().await?;
        let patch = serde_json::to_value(record)?;
        let mut rows = self
            .backend
            .update(R::TABLE, &Query::new().eq("id", id), patch)
            .await?;
        match rows.pop() {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete<R: Record>(&self, id: i64) -> PortalResult<()> {
        self.ensure_connection().await?;
        self.backend
            .delete(R::TABLE, &Query::new().eq("id", id))
            .await
    }

    pub async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> PortalResult<String> {
        self.ensure_connection().await?;
        self.backend.upload(bucket, path, bytes, content_type).await
    }

    pub async fn remove_files(&self, bucket: &str, paths: &[String]) -> PortalResult<()> {
        self.ensure_connection().await?;
        self.backend.remove(bucket, paths).await
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        self.backend.public_url(bucket, path)
    }

    /// Upload a file, then insert the row that references it. If the insert
    /// fails the uploaded object is removed again and the insert error is
    /// returned.
    pub async fn create_with_upload<R, F>(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        build: F,
    ) -> PortalResult<R>
    where
        R: Record,
        F: FnOnce(String) -> R,
    {
        let url = self.upload_file(bucket, path, bytes, content_type).await?;
        let record = build(url);

        match self.create(&record).await {
            Ok(created) => Ok(created),
            Err(e) => {
                warn!(
                    "Insert into {} failed after upload, removing {}/{}: {}",
                    R::TABLE,
                    bucket,
                    path,
                    e
                );
                if let Err(cleanup) = self.backend.remove(bucket, &[path.to_string()]).await {
                    error!("Failed to remove orphaned object {}/{}: {}", bucket, path, cleanup);
                }
                Err(e)
            }
        }
    }

    pub async fn record_download(
        &self,
        resource_id: &str,
        title: &str,
    ) -> PortalResult<DownloadEvent> {
        let event = DownloadEvent {
            id: None,
            resource_id: resource_id.to_string(),
            title: title.to_string(),
            downloaded_at: Utc::now(),
        };
        self.create(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::config::MonitorConfig;
    use crate::models::{ConnectionEvent, GalleryImage, NewsArticle};
    use std::time::Duration;

    fn database(backend: FakeBackend) -> (Database<FakeBackend>, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let monitor_config = MonitorConfig {
            // Keep the monitor's own retry timers out of the way; the default
            // interaction is covered by facade_failures_count_toward_monitor_give_up.
            reconnect_base_delay: Duration::from_secs(600),
            ..Default::default()
        };
        let monitor = ConnectionMonitor::new(Arc::clone(&backend), monitor_config);
        (Database::new(monitor, DatabaseConfig::default()), backend)
    }

    /// Facade connection checks go through the monitor, so their failures
    /// count toward its give-up threshold.
    #[tokio::test(start_paused = true)]
    async fn facade_failures_count_toward_monitor_give_up() {
        let backend = Arc::new(FakeBackend::offline());
        let monitor = ConnectionMonitor::new(Arc::clone(&backend), MonitorConfig::default());
        let db = Database::new(monitor, DatabaseConfig::default());
        let mut events = db.monitor().subscribe();

        assert!(db.list::<NewsArticle>().await.is_err());
        assert!(db.list::<NewsArticle>().await.is_err());

        assert!(db.monitor().state().consecutive_failures >= 5);
        assert!(!db.monitor().has_pending_reconnect());
        let mut gave_up = false;
        while let Ok(event) = events.try_recv() {
            gave_up |= matches!(event, ConnectionEvent::GaveUp { .. });
        }
        assert!(gave_up);

        let probes = backend.probes();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(backend.probes(), probes);

        backend.set_default_probe(Ok(()));
        assert!(db.list::<NewsArticle>().await.is_ok());
        assert_eq!(db.monitor().state().consecutive_failures, 0);
        db.monitor().dispose();
    }

    fn article(title: &str) -> NewsArticle {
        NewsArticle {
            id: None,
            title: title.to_string(),
            content: "Evacuation routes updated".to_string(),
            image_url: None,
            published_at: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crud_passthroughs_round_trip() {
        let (db, _backend) = database(FakeBackend::new());

        let created = db.create(&article("Typhoon advisory")).await.unwrap();
        let id = created.id.unwrap();

        let listed: Vec<NewsArticle> = db.list().await.unwrap();
        assert_eq!(listed.len(), 1);

        let mut edited = created.clone();
        edited.title = "Typhoon advisory (lifted)".to_string();
        let updated = db.update(id, &edited).await.unwrap().unwrap();
        assert_eq!(updated.title, "Typhoon advisory (lifted)");

        let fetched: Option<NewsArticle> = db.get(id).await.unwrap();
        assert_eq!(fetched.unwrap().title, "Typhoon advisory (lifted)");

        db.delete::<NewsArticle>(id).await.unwrap();
        assert!(db.get::<NewsArticle>(id).await.unwrap().is_none());
        db.monitor().dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_before_request_when_disconnected() {
        let backend = FakeBackend::new();
        let net = || -> PortalResult<()> { Err(PortalError::Network("connection refused".into())) };
        backend.script_probes(vec![net(), net()]);
        let (db, backend) = database(backend);

        let rows: Vec<NewsArticle> = db.list().await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(backend.probes(), 3);
        assert!(db.monitor().is_connected());
        db.monitor().dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let (db, backend) = database(FakeBackend::offline());

        let err = db.list::<NewsArticle>().await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::NetworkError);
        assert_eq!(backend.probes(), 3);
        assert_eq!(backend.select_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        db.monitor().dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connection_is_rechecked() {
        let (db, backend) = database(FakeBackend::new());
        assert!(db.monitor().init().await);

        db.list::<NewsArticle>().await.unwrap();
        assert_eq!(backend.probes(), 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        db.list::<NewsArticle>().await.unwrap();
        assert_eq!(backend.probes(), 2);
        db.monitor().dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn backend_errors_are_returned_unchanged() {
        let (db, backend) = database(FakeBackend::new());
        let err = PortalError::Backend {
            status: 409,
            message: "duplicate key value violates unique constraint".into(),
        };
        backend.fail_inserts(err.clone());

        assert_eq!(db.create(&article("Dup")).await.unwrap_err(), err);
        db.monitor().dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_insert_removes_uploaded_object() {
        let (db, backend) = database(FakeBackend::new());
        backend.fail_inserts(PortalError::Backend {
            status: 400,
            message: "null value in column \"title\"".into(),
        });

        let result = db
            .create_with_upload("gallery", "2024/flood.jpg", vec![1, 2, 3], "image/jpeg", |url| {
                GalleryImage {
                    id: None,
                    title: "Flood".into(),
                    image_url: url,
                    caption: None,
                }
            })
            .await;

        assert!(result.is_err());
        assert!(!backend.has_object("gallery", "2024/flood.jpg"));
        db.monitor().dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn upload_then_insert_links_public_url() {
        let (db, backend) = database(FakeBackend::new());

        let image = db
            .create_with_upload("gallery", "drill.jpg", vec![0xFF], "image/jpeg", |url| {
                GalleryImage {
                    id: None,
                    title: "Drill".into(),
                    image_url: url,
                    caption: Some("Barangay drill".into()),
                }
            })
            .await
            .unwrap();

        assert_eq!(image.image_url, "memory://gallery/drill.jpg");
        assert!(backend.has_object("gallery", "drill.jpg"));
        assert_eq!(backend.rows("gallery").len(), 1);
        db.monitor().dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn records_download_events() {
        let (db, backend) = database(FakeBackend::new());

        let event = db.record_download("42", "Evacuation map").await.unwrap();
        assert_eq!(event.resource_id, "42");
        assert_eq!(backend.rows("download_events").len(), 1);
        db.monitor().dispose();
    }
}
