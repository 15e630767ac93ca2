//! Synchronization engine.
//!
//! The [`Manager`] owns the target state, turns container lifecycle events
//! into state changes and pushes the regenerated Caddy configuration
//! whenever its serialized form changes.
//!
//! Only the event-processing path writes the target state. Readers get
//! snapshot copies and never hold the lock for longer than the copy.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::caddy::{ClientError, ConfigBuilder, ControlPlane};
use crate::discovery::Discovery;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{
    ContainerEvent, ContainerRecord, EventAction, ProxyTarget, RunningContainer, RuntimeEvent,
    TargetState,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("control plane never became ready: {0}")]
    NotReady(#[source] ClientError),
    #[error("inventory sync failed: {0}")]
    Inventory(#[source] RuntimeError),
    #[error("cannot subscribe to container events: {0}")]
    Subscribe(#[source] RuntimeError),
    #[error("container event stream closed unexpectedly")]
    EventStreamClosed,
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("configuration push failed: {0}")]
    Push(#[source] ClientError),
}

/// Lifecycle of [`Manager::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagerState {
    Starting,
    SyncingInventory,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagerState::Starting => "starting",
            ManagerState::SyncingInventory => "syncing-inventory",
            ManagerState::Running => "running",
            ManagerState::Stopping => "stopping",
            ManagerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What a configuration push attempt ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Applied,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Readiness checks before startup is abandoned.
    pub ready_retries: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self { ready_retries: 30 }
    }
}

/// One running container as shown to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerOverview {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub project: Option<String>,
    pub service: Option<String>,
    pub targets: Vec<ProxyTarget>,
}

pub struct Manager {
    runtime: Arc<dyn ContainerRuntime>,
    control: Arc<dyn ControlPlane>,
    discovery: Discovery,
    builder: ConfigBuilder,
    settings: ManagerSettings,
    targets: RwLock<TargetState>,
    /// Digest of the last configuration the control plane accepted. The
    /// lock is held across a push so pushes never overlap.
    last_applied: Mutex<Option<String>>,
    state: watch::Sender<ManagerState>,
}

impl Manager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        control: Arc<dyn ControlPlane>,
        discovery: Discovery,
        builder: ConfigBuilder,
        settings: ManagerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ManagerState::Starting);
        Self {
            runtime,
            control,
            discovery,
            builder,
            settings,
            targets: RwLock::new(BTreeMap::new()),
            last_applied: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ManagerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Manager state {} -> {}", prev, next);
        }
    }

    /// Run until `cancel` fires. Returns an error only when startup cannot
    /// complete or the event source goes away.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ManagerError> {
        let result = self.run_inner(&cancel).await;
        self.transition(ManagerState::Stopped);
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), ManagerError> {
        self.transition(ManagerState::Starting);
        info!("Waiting for Caddy to be ready...");
        match self
            .control
            .probe_ready(self.settings.ready_retries, cancel)
            .await
        {
            Ok(()) => {}
            Err(ClientError::Cancelled) => {
                self.transition(ManagerState::Stopping);
                return Ok(());
            }
            Err(e) => return Err(ManagerError::NotReady(e)),
        }

        self.transition(ManagerState::SyncingInventory);
        // Subscribe before listing so nothing that happens during the
        // inventory read is missed; those events queue up meanwhile.
        let mut events = tokio::select! {
            _ = cancel.cancelled() => {
                self.transition(ManagerState::Stopping);
                return Ok(());
            }
            result = self.runtime.subscribe(cancel.child_token()) => {
                result.map_err(ManagerError::Subscribe)?
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                self.transition(ManagerState::Stopping);
                return Ok(());
            }
            result = self.sync_inventory() => result?,
        }

        self.transition(ManagerState::Running);
        info!("DevProxy manager started, monitoring Docker containers...");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            let Some(event) = event else {
                if cancel.is_cancelled() {
                    break;
                }
                return Err(ManagerError::EventStreamClosed);
            };

            let step = async {
                match event {
                    RuntimeEvent::Lifecycle(event) => self.handle_event(event).await,
                    RuntimeEvent::Reconnected => self.resync().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = step => {
                    if let Err(e) = result {
                        error!("Failed to update Caddy config: {}", e);
                    }
                }
            }
        }

        self.transition(ManagerState::Stopping);
        info!("DevProxy manager stopping...");
        events.close();
        Ok(())
    }

    /// Rebuild the target state from every running container and push the
    /// result. The push is attempted even if nothing changed; a failed push
    /// is logged and left for the next event to retry.
    pub async fn sync_inventory(&self) -> Result<(), ManagerError> {
        self.rebuild_state().await?;

        // No baseline yet, so always push.
        self.last_applied.lock().await.take();
        if let Err(e) = self.push_if_changed().await {
            error!("Initial configuration push failed: {}", e);
        }
        Ok(())
    }

    /// Re-read the inventory after the event stream came back, dropping
    /// containers that stopped and picking up ones that started meanwhile.
    pub async fn resync(&self) -> Result<PushOutcome, ManagerError> {
        info!("Container event stream reconnected, re-syncing containers");
        self.rebuild_state().await?;
        self.push_if_changed().await
    }

    async fn rebuild_state(&self) -> Result<(), ManagerError> {
        let containers = self
            .runtime
            .list_running()
            .await
            .map_err(ManagerError::Inventory)?;
        info!("Syncing existing containers (count: {})", containers.len());

        let mut fresh = TargetState::new();
        for container in &containers {
            let record = match self.runtime.inspect(&container.id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to inspect container {}: {}", container.name, e);
                    continue;
                }
            };
            let targets = self.discovery.extract(&record);
            if targets.is_empty() {
                continue;
            }
            log_targets("Added", &record, &targets);
            fresh.insert(self.discovery.container_key(&record).to_string(), targets);
        }

        *self.targets.write().await = fresh;
        Ok(())
    }

    /// Apply one lifecycle event and push the configuration if it changed.
    /// The state change stands even when the push fails.
    pub async fn handle_event(&self, event: ContainerEvent) -> Result<PushOutcome, ManagerError> {
        match event.action {
            EventAction::Started => self.upsert(&event.container).await,
            EventAction::Stopped | EventAction::Died => self.remove(&event.container).await,
            EventAction::Other(ref verb) => {
                debug!("Ignoring {} event for {}", verb, event.container.name);
                return Ok(PushOutcome::Unchanged);
            }
        }
        self.push_if_changed().await
    }

    async fn upsert(&self, container: &ContainerRecord) {
        let key = self.discovery.container_key(container).to_string();
        let targets = self.discovery.extract(container);

        if targets.is_empty() {
            // A restart that no longer qualifies drops any older entry.
            if self.targets.write().await.remove(&key).is_some() {
                info!(
                    "Container {} no longer yields proxy targets",
                    container.name
                );
            }
            return;
        }

        log_targets("Added", container, &targets);
        self.targets.write().await.insert(key, targets);
    }

    async fn remove(&self, container: &ContainerRecord) {
        let key = self.discovery.container_key(container);
        let removed = self.targets.write().await.remove(key);
        if let Some(targets) = removed {
            log_targets("Removed", container, &targets);
        }
    }

    /// Regenerate the configuration from the current state and push it if
    /// it differs from the last one the control plane accepted.
    pub async fn push_if_changed(&self) -> Result<PushOutcome, ManagerError> {
        let mut last_applied = self.last_applied.lock().await;

        let targets = self.targets().await;
        let config = self.builder.build(&targets);
        let digest = hex::encode(Sha256::digest(ConfigBuilder::serialize(&config)?));

        if last_applied.as_deref() == Some(digest.as_str()) {
            debug!("Caddy configuration unchanged, skipping push");
            return Ok(PushOutcome::Unchanged);
        }

        if let Err(e) = self.control.apply_configuration(&config).await {
            if e.is_transport() {
                warn!("Caddy admin API unreachable: {}", e);
            } else {
                warn!("Caddy rejected configuration: {}", e);
            }
            return Err(ManagerError::Push(e));
        }

        *last_applied = Some(digest);
        info!(
            "Updated Caddy configuration (proxy_targets: {})",
            targets.len()
        );
        Ok(PushOutcome::Applied)
    }

    /// Point-in-time copy of the target state.
    pub async fn snapshot(&self) -> TargetState {
        self.targets.read().await.clone()
    }

    /// Every active target, ordered by container id.
    pub async fn targets(&self) -> Vec<ProxyTarget> {
        self.targets
            .read()
            .await
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn list_running(&self) -> Result<Vec<RunningContainer>, RuntimeError> {
        self.runtime.list_running().await
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        self.runtime.inspect(id).await
    }

    pub fn extract_targets(&self, record: &ContainerRecord) -> Vec<ProxyTarget> {
        self.discovery.extract(record)
    }

    /// Running containers that would be proxied, with the targets derived
    /// from their live metadata.
    pub async fn container_overview(&self) -> Result<Vec<ContainerOverview>, RuntimeError> {
        let mut overview = Vec::new();
        for container in self.runtime.list_running().await? {
            let record = match self.runtime.inspect(&container.id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to inspect container {}: {}", container.name, e);
                    continue;
                }
            };
            let targets = self.discovery.extract(&record);
            if targets.is_empty() {
                continue;
            }
            overview.push(ContainerOverview {
                id: record.short_id().to_string(),
                project: record.compose_project().map(str::to_string),
                service: record.compose_service().map(str::to_string),
                name: record.name,
                image: record.image,
                status: record.status,
                targets,
            });
        }
        Ok(overview)
    }
}

fn log_targets(verb: &str, container: &ContainerRecord, targets: &[ProxyTarget]) {
    for target in targets {
        info!(
            "{} proxy target {} -> {} (container: {})",
            verb,
            target.domain,
            target.dial(),
            container.name
        );
    }
}
