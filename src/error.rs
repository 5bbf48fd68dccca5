use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortalError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(u16),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Download cancelled")]
    Cancelled,
}

pub type PortalResult<T> = Result<T, PortalError>;

impl From<reqwest::Error> for PortalError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return PortalError::Network(format!("request timed out: {}", e));
        }
        if e.is_decode() {
            return PortalError::Decode(e.to_string());
        }
        if let Some(status) = e.status() {
            return PortalError::Http(status.as_u16());
        }
        PortalError::Network(e.to_string())
    }
}

impl From<std::io::Error> for PortalError {
    fn from(e: std::io::Error) -> Self {
        PortalError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(e: serde_json::Error) -> Self {
        PortalError::Decode(e.to_string())
    }
}

/// Coarse buckets surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NetworkError,
    ConfigError,
    AuthError,
    UnknownError,
}

impl ErrorCategory {
    /// Classify an opaque error string, as returned in backend error bodies.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("missing supabase")
            || lower.contains("not configured")
            || lower.contains("environment variable")
        {
            ErrorCategory::ConfigError
        } else if lower.contains("auth") || lower.contains("jwt") || lower.contains("permission") {
            ErrorCategory::AuthError
        } else if lower.contains("fetch")
            || lower.contains("network")
            || lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
        {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::UnknownError
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::NetworkError => "NETWORK_ERROR",
            ErrorCategory::ConfigError => "CONFIG_ERROR",
            ErrorCategory::AuthError => "AUTH_ERROR",
            ErrorCategory::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(s)
    }
}

impl PortalError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PortalError::Network(_) | PortalError::Timeout(_) => ErrorCategory::NetworkError,
            PortalError::Config(_) => ErrorCategory::ConfigError,
            PortalError::Auth(_) => ErrorCategory::AuthError,
            PortalError::Backend { status, message } => match status {
                401 | 403 => ErrorCategory::AuthError,
                _ => ErrorCategory::from_message(message),
            },
            PortalError::Http(_)
            | PortalError::Io(_)
            | PortalError::Decode(_)
            | PortalError::Cancelled => ErrorCategory::UnknownError,
        }
    }

    /// Whether a failed probe with this error should be retried later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PortalError::Config(_) | PortalError::Auth(_))
    }
}

/// A user-facing message for an error category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub category: ErrorCategory,
    pub title: &'static str,
    pub message: &'static str,
}

impl Notification {
    pub fn for_category(category: ErrorCategory) -> Self {
        let (title, message) = match category {
            ErrorCategory::NetworkError => (
                "Connection problem",
                "Unable to reach the server. Check your internet connection and try again.",
            ),
            ErrorCategory::ConfigError => (
                "Service not configured",
                "The service connection is not configured. The site is running in offline mode.",
            ),
            ErrorCategory::AuthError => (
                "Authentication failed",
                "Your session is not authorized for this action. Please sign in again.",
            ),
            ErrorCategory::UnknownError => (
                "Something went wrong",
                "An unexpected error occurred. Please try again later.",
            ),
        };
        Self {
            category,
            title,
            message,
        }
    }

    pub fn for_error(err: &PortalError) -> Self {
        Self::for_category(err.category())
    }
}

/// Log an error under its category and return the notification to show.
pub fn report_error(context: &str, err: &PortalError) -> Notification {
    let notification = Notification::for_error(err);
    match notification.category {
        ErrorCategory::NetworkError => {
            warn!(category = %notification.category, "{}: {}", context, err)
        }
        _ => error!(category = %notification.category, "{}: {}", context, err),
    }
    notification
}
