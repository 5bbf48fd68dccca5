//! Connection-resilient access to the disaster-risk portal's hosted backend,
//! plus a download manager with fallbacks, progress and cancellation.

pub mod backend;
pub mod config;
pub mod database;
pub mod downloader;
pub mod error;
pub mod models;
pub mod monitor;
pub mod tracker;

pub use backend::{Backend, Query, RestBackend};
pub use config::{DatabaseConfig, DownloadConfig, MonitorConfig, ServiceConfig};
pub use database::Database;
pub use downloader::{DownloadOptions, DownloadRequest, Downloader, ExternalFallback, NoFallback};
pub use error::{ErrorCategory, Notification, PortalError, PortalResult, report_error};
pub use monitor::ConnectionMonitor;
pub use tracker::{
    AnalyticsSink, DatabaseAnalytics, DownloadTracker, DownloadUiState, FileDownloader,
    LogAnalytics, ResourceRef,
};
