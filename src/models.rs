use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::time::Instant;

/// One line of a batch link file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEntry {
    pub file_name: String,
    pub url: String,
}

/// In-memory view of backend reachability.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// Whether the last check is newer than `window`.
    pub fn is_fresh(&self, window: std::time::Duration) -> bool {
        self.last_check.is_some_and(|t| t.elapsed() < window)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { error: String },
    /// Automatic reconnection stopped; needs an external trigger.
    GaveUp { failures: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Probing,
    Downloading,
    Succeeded,
    Failed,
    OpenedExternally,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub url: String,
    pub resolved_filename: String,
    pub status: DownloadStatus,
    pub progress_percent: u8,
    pub error_message: Option<String>,
}

impl DownloadTask {
    pub fn new(url: String, resolved_filename: String) -> Self {
        Self {
            url,
            resolved_filename,
            status: DownloadStatus::Pending,
            progress_percent: 0,
            error_message: None,
        }
    }
}

/// A progress update. `estimated` is set when the transfer size is unknown
/// and the percentage comes from a fixed-step timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub estimated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub error: Option<String>,
    pub opened_externally: bool,
}

impl DownloadOutcome {
    pub fn succeeded(filename: String, size: u64) -> Self {
        Self {
            success: true,
            filename: Some(filename),
            size: Some(size),
            ..Default::default()
        }
    }

    pub fn failed(filename: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            filename,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDownloadResult {
    pub outcomes: Vec<DownloadOutcome>,
}

impl BatchDownloadResult {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }
}

/// A row type stored in a backend table.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;

    fn id(&self) -> Option<i64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl Record for NewsArticle {
    const TABLE: &'static str = "news";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

/// A downloadable document (plans, maps, reports).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub file_url: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub download_count: i64,
}

impl Record for ResourceDocument {
    const TABLE: &'static str = "resources";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub image_url: String,
    #[serde(default)]
    pub caption: Option<String>,
}

impl Record for GalleryImage {
    const TABLE: &'static str = "gallery";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub contact: Option<String>,
}

impl Record for ServiceEntry {
    const TABLE: &'static str = "services";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

/// Analytics row written after a confirmed download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub resource_id: String,
    pub title: String,
    pub downloaded_at: DateTime<Utc>,
}

impl Record for DownloadEvent {
    const TABLE: &'static str = "download_events";

    fn id(&self) -> Option<i64> {
        self.id
    }
}
