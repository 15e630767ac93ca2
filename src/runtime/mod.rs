use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{ContainerRecord, RunningContainer, RuntimeEvent};

pub mod docker;
pub use docker::DockerRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("cannot connect to container runtime: {0}")]
    Connect(String),
    #[error("container runtime request failed: {0}")]
    Api(String),
    #[error("container runtime event stream closed")]
    Closed,
}

/// Source of container metadata and lifecycle events.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers currently in the running state.
    async fn list_running(&self) -> Result<Vec<RunningContainer>, RuntimeError>;

    /// Full metadata for one container.
    async fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError>;

    /// Start streaming lifecycle events. The stream ends once `cancel`
    /// fires; events for one container arrive in the order they happened.
    /// After an outage the stream yields [`RuntimeEvent::Reconnected`] so
    /// the consumer can re-read the inventory.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RuntimeEvent>, RuntimeError>;
}
