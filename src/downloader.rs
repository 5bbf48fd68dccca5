use crate::config::DownloadConfig;
use crate::error::{PortalError, PortalResult};
use crate::models::{
    BatchDownloadResult, DownloadOutcome, DownloadStatus, DownloadTask, LinkEntry, Progress,
};
use futures::future::{AbortHandle, Abortable};
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use reqwest::{Client, Url};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, info, warn};

const DEFAULT_FILENAME: &str = "download";

/// Estimated progress never claims completion before the transfer ends.
const SIMULATED_CEILING: u8 = 90;

/// Finished tasks kept for `recent_downloads`.
const RECENT_LIMIT: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub filename: Option<String>,
    pub fallback_url: Option<String>,
    /// Fallback attempts; `None` uses the configured default.
    pub retries: Option<u32>,
    /// Buffer the body in memory and write it in one go.
    pub use_blob: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub options: DownloadOptions,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: DownloadOptions::default(),
        }
    }
}

impl From<LinkEntry> for DownloadRequest {
    fn from(entry: LinkEntry) -> Self {
        Self {
            url: entry.url,
            options: DownloadOptions {
                filename: Some(entry.file_name),
                ..Default::default()
            },
        }
    }
}

/// Last resort when every download attempt failed: offer to hand the URL
/// to something else (a browser tab, the system opener).
pub trait ExternalFallback: Send + Sync {
    fn confirm_open(&self, url: &str, error: &str) -> bool;

    fn open(&self, url: &str) -> std::io::Result<()>;
}

pub struct NoFallback;

impl ExternalFallback for NoFallback {
    fn confirm_open(&self, _url: &str, _error: &str) -> bool {
        false
    }

    fn open(&self, _url: &str) -> std::io::Result<()> {
        Ok(())
    }
}

struct ProgressTracker {
    total: Option<u64>,
    last: Option<u8>,
    step: u8,
}

impl ProgressTracker {
    fn new(total: Option<u64>, step: u8) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            last: None,
            step,
        }
    }

    /// 100 is only reported for an exact match; an over-long body stays at 99
    /// until the size check rejects it.
    fn on_bytes(&mut self, received: u64) -> Option<Progress> {
        let total = self.total?;
        let percent = if received == total {
            100
        } else {
            (received.min(total) * 100 / total).min(99) as u8
        };
        self.advance(percent, false)
    }

    fn on_tick(&mut self) -> Option<Progress> {
        if self.total.is_some() {
            return None;
        }
        let next = self
            .last
            .unwrap_or(0)
            .saturating_add(self.step)
            .min(SIMULATED_CEILING);
        self.advance(next, true)
    }

    fn finish(&mut self) -> Option<Progress> {
        self.advance(100, self.total.is_none())
    }

    fn advance(&mut self, percent: u8, estimated: bool) -> Option<Progress> {
        if self.last.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last = Some(percent);
        Some(Progress { percent, estimated })
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Streamed,
    Blob,
}

/// One registered download, fallbacks and retry pauses included.
struct ActiveDownload {
    abort: AbortHandle,
    cancelled: bool,
    task: DownloadTask,
}

pub struct Downloader {
    client: Client,
    output_dir: PathBuf,
    config: DownloadConfig,
    fallback: Arc<dyn ExternalFallback>,
    active: Arc<Mutex<HashMap<u64, ActiveDownload>>>,
    recent: Arc<Mutex<VecDeque<DownloadTask>>>,
    next_id: Arc<AtomicU64>,
}

impl Downloader {
    pub fn new(output_dir: &Path, config: DownloadConfig) -> PortalResult<Self> {
        if !output_dir.exists() {
            std::fs::create_dir_all(output_dir)?;
        }

        let mut client_builder = Client::builder().timeout(config.request_timeout);

        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| PortalError::Config(format!("Invalid proxy {}: {}", proxy_url, e)))?;
            client_builder = client_builder.proxy(proxy);
        }

        let client = client_builder
            .build()
            .map_err(|e| PortalError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            output_dir: output_dir.to_path_buf(),
            config,
            fallback: Arc::new(NoFallback),
            active: Arc::new(Mutex::new(HashMap::new())),
            recent: Arc::new(Mutex::new(VecDeque::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ExternalFallback>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Explicit name, else the last path segment of the URL, else a default.
    pub fn resolve_filename(url: &str, explicit: Option<&str>) -> String {
        let sanitize =
            |name: &str| name.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");

        if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
            return sanitize(name);
        }

        Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|segment| !segment.is_empty())
            .map(|segment| sanitize(&segment))
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
    }

    /// HEAD the URL. Non-success statuses are errors; returns the declared size.
    pub async fn check_accessible(&self, url: &str) -> PortalResult<Option<u64>> {
        let request = self.client.head(url).send();
        let response = timeout(self.config.probe_timeout, request)
            .await
            .map_err(|_| PortalError::Timeout(self.config.probe_timeout.as_millis() as u64))??;

        if !response.status().is_success() {
            return Err(PortalError::Http(response.status().as_u16()));
        }

        Ok(content_length(response.headers()))
    }

    /// In-flight tasks in start order.
    pub fn active_downloads(&self) -> Vec<DownloadTask> {
        let active = self.active.lock().unwrap();
        let mut entries: Vec<_> = active.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        entries.into_iter().map(|(_, a)| a.task.clone()).collect()
    }

    /// The last finished tasks with their terminal status, oldest first.
    pub fn recent_downloads(&self) -> Vec<DownloadTask> {
        self.recent.lock().unwrap().iter().cloned().collect()
    }

    /// Abort every in-flight download requested for `url`, including one
    /// that is currently on its fallback URL. Returns whether any was running.
    pub fn cancel_download(&self, url: &str) -> bool {
        let cancelled = self.cancel_where(|task| task.url == url);
        if cancelled > 0 {
            info!("Cancelled {} download(s) of {}", cancelled, url);
        }
        cancelled > 0
    }

    pub fn cancel_all_downloads(&self) -> usize {
        let cancelled = self.cancel_where(|_| true);
        if cancelled > 0 {
            info!("Cancelled {} downloads", cancelled);
        }
        cancelled
    }

    fn cancel_where(&self, matches: impl Fn(&DownloadTask) -> bool) -> usize {
        let mut active = self.active.lock().unwrap();
        let mut cancelled = 0;
        for entry in active.values_mut() {
            if !entry.cancelled && matches(&entry.task) {
                entry.cancelled = true;
                entry.abort.abort();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Download `url`, falling back to `options.fallback_url` while the retry
    /// budget lasts, and finally offering to open the URL externally.
    /// Failures are reported in the outcome, never as an error.
    pub async fn download_file<P>(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: P,
    ) -> DownloadOutcome
    where
        P: Fn(Progress) + Send + Sync,
    {
        if options.use_blob {
            return self.download_as_blob(url, options, on_progress).await;
        }
        self.run(url, options, Transfer::Streamed, &on_progress).await
    }

    /// Like `download_file`, but the body is buffered in memory and written
    /// once complete. No partial file is ever left on disk.
    pub async fn download_as_blob<P>(
        &self,
        url: &str,
        options: &DownloadOptions,
        on_progress: P,
    ) -> DownloadOutcome
    where
        P: Fn(Progress) + Send + Sync,
    {
        self.run(url, options, Transfer::Blob, &on_progress).await
    }

    async fn run(
        &self,
        url: &str,
        options: &DownloadOptions,
        transfer: Transfer,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> DownloadOutcome {
        let filename = Self::resolve_filename(url, options.filename.as_deref());
        let (abort, registration) = AbortHandle::new_pair();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().unwrap().insert(
            id,
            ActiveDownload {
                abort,
                cancelled: false,
                task: DownloadTask::new(url.to_string(), filename.clone()),
            },
        );

        let attempts = self.attempts(id, url, options, transfer, on_progress);
        let outcome = match Abortable::new(attempts, registration).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => self.last_resort(url, options, err),
            Err(_aborted) => {
                debug!("Download of {} was cancelled", url);
                let current = self.current_filename(id).unwrap_or(filename);
                if transfer == Transfer::Streamed {
                    let _ = fs::remove_file(self.partial_path(&current)).await;
                }
                DownloadOutcome::failed(Some(current), PortalError::Cancelled.to_string())
            }
        };

        self.finish(id, &outcome);
        outcome
    }

    async fn attempts(
        &self,
        id: u64,
        url: &str,
        options: &DownloadOptions,
        transfer: Transfer,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> PortalResult<DownloadOutcome> {
        let report = |p: Progress| {
            self.update_task(id, |task| {
                task.status = DownloadStatus::Downloading;
                task.progress_percent = p.percent;
            });
            on_progress(p);
        };

        let mut target = url;
        let mut budget = options.retries.unwrap_or(self.config.retries);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let filename = Self::resolve_filename(target, options.filename.as_deref());
            self.update_task(id, |task| {
                task.resolved_filename = filename.clone();
                task.status = DownloadStatus::Pending;
            });

            let result = match transfer {
                Transfer::Streamed => self.fetch_streamed(id, target, &filename, &report).await,
                Transfer::Blob => self.fetch_blob(id, target, &filename, &report).await,
            };

            let err = match result {
                Ok(outcome) => {
                    info!(
                        "Downloaded {} ({} bytes)",
                        filename,
                        outcome.size.unwrap_or_default()
                    );
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            warn!("Download attempt {} failed for {}: {}", attempt, target, err);

            match options.fallback_url.as_deref() {
                Some(fallback) if budget > 0 => {
                    budget -= 1;
                    let delay = self.config.retry_delay * (1u32 << (attempt - 1).min(5));
                    debug!("Trying fallback {} in {}ms", fallback, delay.as_millis());
                    sleep(delay).await;
                    target = fallback;
                }
                _ => return Err(err),
            }
        }
    }

    fn last_resort(
        &self,
        url: &str,
        options: &DownloadOptions,
        err: PortalError,
    ) -> DownloadOutcome {
        let filename = Some(Self::resolve_filename(url, options.filename.as_deref()));
        let message = err.to_string();

        if !self.fallback.confirm_open(url, &message) {
            return DownloadOutcome::failed(filename, message);
        }

        match self.fallback.open(url) {
            Ok(()) => {
                info!("Opened {} externally after failed download", url);
                DownloadOutcome {
                    success: false,
                    filename,
                    size: None,
                    error: Some(message),
                    opened_externally: true,
                }
            }
            Err(e) => DownloadOutcome::failed(
                filename,
                format!("{}; opening externally also failed: {}", message, e),
            ),
        }
    }

    fn update_task(&self, id: u64, apply: impl FnOnce(&mut DownloadTask)) {
        if let Some(active) = self.active.lock().unwrap().get_mut(&id) {
            apply(&mut active.task);
        }
    }

    fn current_filename(&self, id: u64) -> Option<String> {
        self.active
            .lock()
            .unwrap()
            .get(&id)
            .map(|a| a.task.resolved_filename.clone())
    }

    /// Move the task out of the active set with its terminal status.
    fn finish(&self, id: u64, outcome: &DownloadOutcome) {
        let Some(ActiveDownload { mut task, .. }) = self.active.lock().unwrap().remove(&id) else {
            return;
        };

        if outcome.success {
            task.progress_percent = 100;
        }
        task.status = if outcome.success {
            DownloadStatus::Succeeded
        } else if outcome.opened_externally {
            DownloadStatus::OpenedExternally
        } else {
            DownloadStatus::Failed
        };
        task.error_message = outcome.error.clone();

        let mut recent = self.recent.lock().unwrap();
        if recent.len() == RECENT_LIMIT {
            recent.pop_front();
        }
        recent.push_back(task);
    }

    fn partial_path(&self, filename: &str) -> PathBuf {
        PathBuf::from(format!("{}.part", self.output_dir.join(filename).display()))
    }

    /// Probe, then stream the body to `<name>.part` and rename on completion.
    /// Without a declared size, progress is estimated in fixed steps.
    async fn fetch_streamed(
        &self,
        id: u64,
        url: &str,
        filename: &str,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> PortalResult<DownloadOutcome> {
        self.update_task(id, |task| task.status = DownloadStatus::Probing);
        let probed_size = self.check_accessible(url).await?;

        let output_path = self.output_dir.join(filename);
        let partial_path = self.partial_path(filename);

        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PortalError::Http(response.status().as_u16()));
        }

        let total_bytes = content_length(response.headers()).or(probed_size);
        self.update_task(id, |task| {
            task.status = DownloadStatus::Downloading;
            task.progress_percent = 0;
        });

        let mut file = fs::File::create(&partial_path).await?;
        let mut tracker = ProgressTracker::new(total_bytes, self.config.simulated_step);
        let mut ticker = interval(self.config.simulated_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut downloaded = 0u64;
        loop {
            tokio::select! {
                chunk = response.chunk() => {
                    let Some(chunk) = chunk? else { break };
                    file.write_all(&chunk).await?;
                    downloaded += chunk.len() as u64;
                    if let Some(p) = tracker.on_bytes(downloaded) {
                        on_progress(p);
                    }
                }
                _ = ticker.tick(), if tracker.total.is_none() => {
                    if let Some(p) = tracker.on_tick() {
                        on_progress(p);
                    }
                }
            }
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = tracker.total {
            if downloaded != expected {
                let _ = fs::remove_file(&partial_path).await;
                return Err(PortalError::Io(format!(
                    "File size mismatch for {}: expected {} bytes, got {} bytes",
                    filename, expected, downloaded
                )));
            }
        }

        fs::rename(&partial_path, &output_path).await?;
        if let Some(p) = tracker.finish() {
            on_progress(p);
        }

        Ok(DownloadOutcome::succeeded(filename.to_string(), downloaded))
    }

    /// Fetch the whole body into memory with measured progress, then save it.
    async fn fetch_blob(
        &self,
        id: u64,
        url: &str,
        filename: &str,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> PortalResult<DownloadOutcome> {
        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PortalError::Http(response.status().as_u16()));
        }

        let total_bytes = content_length(response.headers());
        self.update_task(id, |task| {
            task.status = DownloadStatus::Downloading;
            task.progress_percent = 0;
        });
        let mut tracker = ProgressTracker::new(total_bytes, self.config.simulated_step);
        let capacity = total_bytes.unwrap_or(0).min(64 << 20) as usize;
        let mut buffer: Vec<u8> = Vec::with_capacity(capacity);

        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);
            if let Some(p) = tracker.on_bytes(buffer.len() as u64) {
                on_progress(p);
            }
        }

        if let Some(expected) = tracker.total {
            if buffer.len() as u64 != expected {
                return Err(PortalError::Io(format!(
                    "File size mismatch for {}: expected {} bytes, got {} bytes",
                    filename,
                    expected,
                    buffer.len()
                )));
            }
        }

        fs::write(self.output_dir.join(filename), &buffer).await?;
        if let Some(p) = tracker.finish() {
            on_progress(p);
        }

        Ok(DownloadOutcome::succeeded(filename.to_string(), buffer.len() as u64))
    }

    /// Download one at a time, in order, pausing between items. A failed item
    /// does not stop the batch.
    pub async fn download_multiple<F>(
        &self,
        requests: &[DownloadRequest],
        on_batch_progress: F,
    ) -> BatchDownloadResult
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let total = requests.len();
        let mut result = BatchDownloadResult::default();

        for (idx, request) in requests.iter().enumerate() {
            if idx > 0 {
                sleep(self.config.batch_delay).await;
            }

            let outcome = self.download_file(&request.url, &request.options, |_| {}).await;
            result.outcomes.push(outcome);
            on_batch_progress(idx + 1, total);
        }

        info!(
            "Done: {} success, {} failed",
            result.succeeded(),
            result.failed()
        );
        result
    }
}

impl Clone for Downloader {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            output_dir: self.output_dir.clone(),
            config: self.config.clone(),
            fallback: Arc::clone(&self.fallback),
            active: Arc::clone(&self.active),
            recent: Arc::clone(&self.recent),
            next_id: Arc::clone(&self.next_id),
        }
    }
}
