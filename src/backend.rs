//! The hosted backend boundary: row storage over a PostgREST-style API and
//! object storage, both authenticated with the public service key.

use crate::config::ServiceConfig;
use crate::error::{PortalError, PortalResult};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Row filter, ordering and limit for a table request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    filters: Vec<(String, String)>,
    order: Option<(String, bool)>,
    limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push((column.to_string(), value.to_string()));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn filters(&self) -> &[(String, String)] {
        &self.filters
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(col, val)| (col.clone(), format!("eq.{}", val)))
            .collect();
        if let Some((col, asc)) = &self.order {
            let dir = if *asc { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{}", col, dir)));
        }
        if let Some(n) = self.limit {
            params.push(("limit".to_string(), n.to_string()));
        }
        params
    }
}

/// Operations the portal needs from the hosted service. Every call may fail
/// with an error carrying only a message; callers get it back unchanged.
pub trait Backend: Send + Sync + 'static {
    /// Minimal read used only to test reachability.
    fn probe(&self, table: &str) -> impl Future<Output = PortalResult<()>> + Send;

    fn select(&self, table: &str, query: &Query)
    -> impl Future<Output = PortalResult<Vec<Value>>> + Send;

    fn insert(&self, table: &str, row: Value) -> impl Future<Output = PortalResult<Value>> + Send;

    fn update(
        &self,
        table: &str,
        query: &Query,
        patch: Value,
    ) -> impl Future<Output = PortalResult<Vec<Value>>> + Send;

    fn delete(&self, table: &str, query: &Query) -> impl Future<Output = PortalResult<()>> + Send;

    /// Store an object and return its public URL.
    fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = PortalResult<String>> + Send;

    fn remove(&self, bucket: &str, paths: &[String])
    -> impl Future<Output = PortalResult<()>> + Send;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

pub struct RestBackend {
    client: Client,
    config: ServiceConfig,
}

impl RestBackend {
    pub fn new(config: ServiceConfig, timeout: Duration) -> PortalResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortalError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&self.config.anon_key)
    }

    async fn check(response: Response) -> PortalResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                if body.is_empty() {
                    status.to_string()
                } else {
                    body
                }
            });

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PortalError::Auth(message)),
            _ => Err(PortalError::Backend {
                status: status.as_u16(),
                message,
            }),
        }
    }
}

impl Backend for RestBackend {
    async fn probe(&self, table: &str) -> PortalResult<()> {
        let request = self
            .client
            .get(self.config.rest_url(table))
            .query(&[("select", "id"), ("limit", "1")]);
        let response = self.authed(request).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn select(&self, table: &str, query: &Query) -> PortalResult<Vec<Value>> {
        let request = self
            .client
            .get(self.config.rest_url(table))
            .query(&[("select", "*")])
            .query(&query.to_params());
        let response = Self::check(self.authed(request).send().await?).await?;
        let rows = response.json::<Vec<Value>>().await?;
        debug!("Selected {} rows from {}", rows.len(), table);
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> PortalResult<Value> {
        let request = self
            .client
            .post(self.config.rest_url(table))
            .header("Prefer", "return=representation")
            .json(&row);
        let response = Self::check(self.authed(request).send().await?).await?;
        let mut rows = response.json::<Vec<Value>>().await?;
        if rows.is_empty() {
            return Err(PortalError::Decode(format!(
                "Insert into {} returned no rows",
                table
            )));
        }
        Ok(rows.swap_remove(0))
    }

    async fn update(&self, table: &str, query: &Query, patch: Value) -> PortalResult<Vec<Value>> {
        let request = self
            .client
            .patch(self.config.rest_url(table))
            .query(&query.to_params())
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = Self::check(self.authed(request).send().await?).await?;
        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn delete(&self, table: &str, query: &Query) -> PortalResult<()> {
        let request = self
            .client
            .delete(self.config.rest_url(table))
            .query(&query.to_params());
        Self::check(self.authed(request).send().await?).await?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> PortalResult<String> {
        let request = self
            .client
            .post(self.config.storage_url(bucket, path))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes);
        Self::check(self.authed(request).send().await?).await?;
        Ok(self.config.public_object_url(bucket, path))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> PortalResult<()> {
        let url = format!("{}/storage/v1/object/{}", self.config.url, bucket);
        let request = self
            .client
            .delete(url)
            .json(&serde_json::json!({ "prefixes": paths }));
        Self::check(self.authed(request).send().await?).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.config.public_object_url(bucket, path)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;

    #[test]
    fn query_renders_postgrest_params() {
        let q = Query::new()
            .eq("category", "flood")
            .order("published_at", false)
            .limit(10);
        assert_eq!(
            q.to_params(),
            vec![
                ("category".to_string(), "eq.flood".to_string()),
                ("order".to_string(), "published_at.desc".to_string()),
                ("limit".to_string(), "10".to_string()),
            ]
        );
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve app");
        });
        format!("http://{}", addr)
    }

    fn backend(url: &str) -> RestBackend {
        let config = ServiceConfig::new(Some(url), Some("k3y")).expect("config");
        RestBackend::new(config, Duration::from_secs(5)).expect("backend")
    }

    #[tokio::test]
    async fn select_sends_key_and_decodes_rows() {
        let app = Router::new().route(
            "/rest/v1/news",
            get(|headers: HeaderMap| async move {
                let authed = headers.get("apikey").is_some_and(|v| v == "k3y")
                    && headers
                        .get("authorization")
                        .is_some_and(|v| v == "Bearer k3y");
                if authed {
                    (AxumStatus::OK, r#"[{"id":1,"title":"Flood drill","content":"..."}]"#)
                } else {
                    (AxumStatus::UNAUTHORIZED, r#"{"message":"Invalid API key"}"#)
                }
            }),
        );
        let url = spawn(app).await;

        let rows = backend(&url).select("news", &Query::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Flood drill");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let app = Router::new().route(
            "/rest/v1/news",
            get(|| async { (AxumStatus::UNAUTHORIZED, r#"{"message":"JWT expired"}"#) }),
        );
        let url = spawn(app).await;

        let err = backend(&url).probe("news").await.unwrap_err();
        assert_eq!(err, PortalError::Auth("JWT expired".into()));
    }

    #[tokio::test]
    async fn server_error_keeps_backend_message() {
        let app = Router::new().route(
            "/rest/v1/news",
            get(|| async {
                (
                    AxumStatus::INTERNAL_SERVER_ERROR,
                    r#"{"message":"relation \"news\" does not exist"}"#,
                )
            }),
        );
        let url = spawn(app).await;

        match backend(&url).select("news", &Query::new()).await {
            Err(PortalError::Backend { status, message }) => {
                assert_eq!(status, 500);
                assert!(message.contains("does not exist"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = backend(&format!("http://{}", addr))
            .probe("news")
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::NetworkError);
    }
}
