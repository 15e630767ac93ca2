//! HTTP client for Caddy's admin API.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::config::{CaddyConfig, ConfigBuilder};
use super::ControlPlane;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never got an HTTP answer (refused, timed out, reset).
    #[error("control plane unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    /// The API answered but rejected the request.
    #[error("control plane returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to encode configuration: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode configuration: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("control plane not ready after {attempts} attempts")]
    NotReady {
        attempts: u32,
        #[source]
        last: Option<Box<ClientError>>,
    },
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether the failure happened below HTTP.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

pub struct CaddyClient {
    http: Client,
    base_url: String,
    probe_interval: Duration,
}

impl CaddyClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        probe_interval: Duration,
    ) -> Result<Self, ClientError> {
        // The admin API is a local endpoint; never route it through a proxy.
        let http = Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(ClientError::Transport)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            probe_interval,
        })
    }

    fn config_url(&self) -> String {
        format!("{}/config/", self.base_url)
    }

    /// One readiness check: any answer below 400 counts as healthy.
    pub async fn health(&self) -> Result<(), ClientError> {
        let resp = self
            .http
            .get(self.config_url())
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(rejection(resp).await);
        }
        Ok(())
    }
}

async fn rejection(resp: reqwest::Response) -> ClientError {
    let status = resp.status();
    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => {
            debug!("Failed to read control plane response body ({}): {}", status, e);
            String::new()
        }
    };
    ClientError::Status { status, body }
}

#[async_trait]
impl ControlPlane for CaddyClient {
    async fn probe_ready(
        &self,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let mut last = None;
        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = self.health() => result,
            };

            match result {
                Ok(()) => {
                    info!("Caddy admin API is ready at {}", self.base_url);
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        "Waiting for Caddy admin API (attempt {}/{}): {}",
                        attempt, max_attempts, e
                    );
                    last = Some(Box::new(e));
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(self.probe_interval) => {}
                }
            }
        }

        Err(ClientError::NotReady {
            attempts: max_attempts,
            last,
        })
    }

    async fn apply_configuration(&self, config: &CaddyConfig) -> Result<(), ClientError> {
        let body = ConfigBuilder::serialize(config).map_err(ClientError::Encode)?;
        let url = self.config_url();
        debug!("Updating Caddy configuration at {}", url);

        let resp = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(ClientError::Transport)?;

        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        Ok(())
    }

    async fn fetch_configuration(&self) -> Result<Option<CaddyConfig>, ClientError> {
        let resp = self
            .http
            .get(self.config_url())
            .send()
            .await
            .map_err(ClientError::Transport)?;

        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }

        let bytes = resp.bytes().await.map_err(ClientError::Transport)?;
        serde_json::from_slice(&bytes).map_err(ClientError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        body::{Body, Bytes},
        extract::State,
        http::StatusCode as AxumStatus,
        routing::get,
        Router,
    };
    use tokio::net::TcpListener;

    use super::*;
    use crate::types::ProxyTarget;

    #[derive(Clone, Default)]
    struct Admin {
        applied: Arc<Mutex<Option<Bytes>>>,
        reject: bool,
    }

    async fn get_config(State(admin): State<Admin>) -> (AxumStatus, Vec<u8>) {
        match admin.applied.lock().unwrap().clone() {
            Some(body) => (AxumStatus::OK, body.to_vec()),
            None => (AxumStatus::OK, b"null".to_vec()),
        }
    }

    async fn post_config(State(admin): State<Admin>, body: Bytes) -> (AxumStatus, String) {
        if admin.reject {
            return (AxumStatus::BAD_REQUEST, "loading config: bad route".into());
        }
        *admin.applied.lock().unwrap() = Some(body);
        (AxumStatus::OK, String::new())
    }

    async fn serve(admin: Admin) -> String {
        let app = Router::new()
            .route("/config/", get(get_config).post(post_config))
            .with_state(admin);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Answers every request with a 500 whose body breaks off mid-stream.
    async fn serve_truncated() -> String {
        async fn truncated() -> (AxumStatus, Body) {
            let chunks = futures_util::stream::unfold(0u8, |step| async move {
                match step {
                    0 => Some((Ok(Bytes::from_static(b"partial")), 1)),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Some((Err(std::io::Error::other("connection reset")), 2))
                    }
                    _ => None,
                }
            });
            (AxumStatus::INTERNAL_SERVER_ERROR, Body::from_stream(chunks))
        }

        let app = Router::new().route("/config/", get(truncated).post(truncated));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// An address nothing listens on.
    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    fn client(url: &str) -> CaddyClient {
        CaddyClient::new(url, Duration::from_secs(2), Duration::from_millis(10)).unwrap()
    }

    fn sample() -> CaddyConfig {
        ConfigBuilder::new("localhost").build(&[ProxyTarget {
            domain: "web.localhost".into(),
            backend_address: "10.0.0.2".into(),
            backend_port: 8080,
            secure: true,
        }])
    }

    #[tokio::test]
    async fn apply_then_fetch() -> Result<(), ClientError> {
        let url = serve(Admin::default()).await;
        let client = client(&url);

        assert_eq!(client.fetch_configuration().await?, None);

        let config = sample();
        client.apply_configuration(&config).await?;
        assert_eq!(client.fetch_configuration().await?, Some(config));
        Ok(())
    }

    #[tokio::test]
    async fn rejection_carries_status_and_body() {
        let url = serve(Admin {
            reject: true,
            ..Default::default()
        })
        .await;

        let err = client(&url)
            .apply_configuration(&sample())
            .await
            .unwrap_err();
        match err {
            ClientError::Status { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("bad route"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreadable_rejection_body_keeps_status() {
        let url = serve_truncated().await;
        let client = client(&url);

        let err = client.apply_configuration(&sample()).await.unwrap_err();
        match err {
            ClientError::Status { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert!(body.is_empty(), "{body:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = client.health().await.unwrap_err();
        assert!(matches!(err, ClientError::Status { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn connection_refused_is_transport() {
        let err = client(&dead_url().await)
            .apply_configuration(&sample())
            .await
            .unwrap_err();
        assert!(err.is_transport(), "{err:?}");
    }

    #[tokio::test]
    async fn ready_against_live_api() {
        let url = serve(Admin::default()).await;
        client(&url)
            .probe_ready(3, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn readiness_gives_up_after_budget() {
        let err = client(&dead_url().await)
            .probe_ready(3, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ClientError::NotReady { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.is_some_and(|e| e.is_transport()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn readiness_honours_cancellation() {
        let slow =
            CaddyClient::new(dead_url().await, Duration::from_secs(2), Duration::from_secs(60))
                .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = slow.probe_ready(10, &cancel).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }
}
