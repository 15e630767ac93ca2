use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod config;

pub use client::{CaddyClient, ClientError};
pub use config::{CaddyConfig, ConfigBuilder};

/// The reverse proxy's administrative API.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Probe the API up to `max_attempts` times, pausing between attempts.
    async fn probe_ready(
        &self,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>;

    /// Replace the proxy's whole configuration with `config`.
    async fn apply_configuration(&self, config: &CaddyConfig) -> Result<(), ClientError>;

    /// Currently applied configuration, `None` if the proxy has none.
    async fn fetch_configuration(&self) -> Result<Option<CaddyConfig>, ClientError>;
}
