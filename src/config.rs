use crate::error::{PortalError, PortalResult};
use reqwest::Url;
use std::time::Duration;

/// Fragments that only ever appear in sample `.env` files.
const PLACEHOLDER_MARKERS: &[&str] = &[
    "your-project",
    "your_project",
    "your_supabase_url",
    "your-supabase-url",
    "your-anon-key",
    "your_anon_key",
    "placeholder",
    "changeme",
];

/// Documentation hosts; subdomains count too.
const PLACEHOLDER_HOSTS: &[&str] = &["example.com", "example.org", "example.net"];

/// Whole values copied verbatim from a template.
const PLACEHOLDER_VALUES: &[&str] = &["example", "xxx", "todo"];

/// Connection settings for the hosted backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub url: String,
    pub anon_key: String,
}

impl ServiceConfig {
    /// Validate and build a service config. Missing or sample values are a
    /// `Config` error, which callers treat as offline mode.
    pub fn new(url: Option<&str>, anon_key: Option<&str>) -> PortalResult<Self> {
        let url = url.map(str::trim).unwrap_or_default();
        let anon_key = anon_key.map(str::trim).unwrap_or_default();

        if url.is_empty() || anon_key.is_empty() {
            return Err(PortalError::Config(
                "Missing Supabase environment variables (SUPABASE_URL, SUPABASE_ANON_KEY)".into(),
            ));
        }
        if Self::is_placeholder(url) || Self::is_placeholder(anon_key) {
            return Err(PortalError::Config(
                "Supabase environment variables still hold sample values".into(),
            ));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(PortalError::Config(format!(
                "Service URL must start with http:// or https://: {}",
                url
            )));
        }

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        })
    }

    pub fn is_placeholder(value: &str) -> bool {
        let lower = value.to_lowercase();
        if lower.starts_with('<') && lower.ends_with('>') {
            return true;
        }
        if PLACEHOLDER_VALUES.contains(&lower.as_str())
            || PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
        {
            return true;
        }

        Url::parse(&lower)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .is_some_and(|host| {
                PLACEHOLDER_HOSTS
                    .iter()
                    .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
            })
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.url, table)
    }

    pub fn storage_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.url,
            bucket,
            path.trim_start_matches('/')
        )
    }

    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.url,
            bucket,
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Small table read by the health probe.
    pub probe_table: String,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_retries: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_table: "news".to_string(),
            probe_timeout: Duration::from_secs(8),
            health_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// A connected state older than this is re-probed before use.
    pub freshness_window: Duration,
    pub reconnect_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(15),
            reconnect_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub proxy: Option<String>,
    /// Fallback attempts allowed after the primary URL fails.
    pub retries: u32,
    pub retry_delay: Duration,
    pub batch_delay: Duration,
    pub simulated_step: u8,
    pub simulated_tick: Duration,
    pub success_clear_after: Duration,
    pub error_clear_after: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            proxy: None,
            retries: 1,
            retry_delay: Duration::from_secs(1),
            batch_delay: Duration::from_millis(500),
            simulated_step: 20,
            simulated_tick: Duration::from_millis(200),
            success_clear_after: Duration::from_secs(3),
            error_clear_after: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_values_are_config_errors() {
        let err = ServiceConfig::new(None, Some("key")).unwrap_err();
        assert!(matches!(err, PortalError::Config(_)));
        assert!(err.to_string().contains("Missing Supabase"));
    }

    #[test]
    fn sample_values_force_offline_mode() {
        for (url, key) in [
            ("https://your-project.supabase.co", "abc123"),
            ("https://abcd.supabase.co", "your-anon-key"),
            ("<SUPABASE_URL>", "abc123"),
            ("https://example.com", "abc123"),
            ("https://api.example.org", "abc123"),
            ("https://abcd.supabase.co", "example"),
        ] {
            assert!(
                matches!(
                    ServiceConfig::new(Some(url), Some(key)),
                    Err(PortalError::Config(_))
                ),
                "{} / {} should be rejected",
                url,
                key
            );
        }
    }

    #[test]
    fn real_values_mentioning_example_are_accepted() {
        let cfg = ServiceConfig::new(
            Some("https://example-hazards.supabase.co"),
            Some("eyJexampleKey.payload.sig"),
        )
        .unwrap();
        assert_eq!(cfg.url, "https://example-hazards.supabase.co");
        assert!(!ServiceConfig::is_placeholder("https://counterexample.com"));
    }

    #[test]
    fn builds_endpoint_urls() {
        let cfg = ServiceConfig::new(Some("https://abcd.supabase.co/"), Some("k3y")).unwrap();
        assert_eq!(cfg.rest_url("news"), "https://abcd.supabase.co/rest/v1/news");
        assert_eq!(
            cfg.storage_url("gallery", "/2024/flood.jpg"),
            "https://abcd.supabase.co/storage/v1/object/gallery/2024/flood.jpg"
        );
        assert_eq!(
            cfg.public_object_url("gallery", "a.jpg"),
            "https://abcd.supabase.co/storage/v1/object/public/gallery/a.jpg"
        );
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(ServiceConfig::new(Some("ftp://abcd.supabase.co"), Some("k3y")).is_err());
    }
}
