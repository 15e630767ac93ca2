use super::{ContainerRuntime, RuntimeError};
use crate::types::{
    short_id, ContainerEvent, ContainerRecord, EventAction, RunningContainer, RuntimeEvent,
};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Seconds bollard waits on a single daemon request.
const DOCKER_TIMEOUT_SECS: u64 = 120;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct DockerRuntime {
    docker: Docker,
    event_buffer: usize,
}

impl DockerRuntime {
    /// Connect to the daemon at `docker_host` (`unix://` or `tcp://`), or
    /// use bollard's local defaults, which honour `DOCKER_HOST`.
    pub fn connect(docker_host: Option<&str>, event_buffer: usize) -> Result<Self, RuntimeError> {
        let docker = match docker_host {
            Some(host) => connect_to_host(host)?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| RuntimeError::Connect(e.to_string()))?,
        };
        Ok(Self {
            docker,
            event_buffer: event_buffer.max(1),
        })
    }

    fn event_options() -> EventsOptions<String> {
        EventsOptions::<String> {
            filters: [
                ("type", ["container"].as_slice()),
                ("event", ["start", "stop", "die"].as_slice()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect(),
            ..Default::default()
        }
    }

    /// Forward daemon events into `tx` until cancelled or the receiver is
    /// dropped, reconnecting when the daemon's stream breaks.
    async fn pump_events(
        docker: Docker,
        tx: mpsc::Sender<RuntimeEvent>,
        cancel: CancellationToken,
    ) {
        let mut reconnected = false;
        loop {
            let stream = docker.events(Some(Self::event_options()));
            tokio::pin!(stream);
            info!("Listening for Docker events...");

            // Events from the outage are lost; let the consumer re-scan.
            if reconnected && !Self::forward(&tx, &cancel, RuntimeEvent::Reconnected).await {
                return;
            }
            reconnected = true;

            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Docker event subscription cancelled");
                        return;
                    }
                    msg = stream.next() => msg,
                };

                match msg {
                    Some(Ok(message)) => {
                        let Some(event) = Self::resolve_event(&docker, message).await else {
                            continue;
                        };
                        if !Self::forward(&tx, &cancel, RuntimeEvent::Lifecycle(event)).await {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in Docker event stream: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            warn!(
                "Docker event stream ended. Reconnecting in {}s...",
                RECONNECT_DELAY.as_secs()
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Send `event` unless cancelled. Returns `false` once the subscription
    /// should end.
    async fn forward(
        tx: &mpsc::Sender<RuntimeEvent>,
        cancel: &CancellationToken,
        event: RuntimeEvent,
    ) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = tx.send(event) => {
                if sent.is_err() {
                    debug!("Event receiver dropped, closing Docker subscription");
                }
                sent.is_ok()
            }
        }
    }

    /// Turn a raw daemon event into a [`ContainerEvent`] carrying the
    /// container's current metadata.
    async fn resolve_event(docker: &Docker, message: EventMessage) -> Option<ContainerEvent> {
        let actor = message.actor?;
        let id = actor.id.filter(|id| !id.is_empty())?;
        let action = EventAction::from_verb(message.action.as_deref().unwrap_or_default());
        let name = actor
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get("name").cloned())
            .unwrap_or_default();

        let container = match docker.inspect_container(&id, None).await {
            Ok(detail) => record_from_inspect(detail),
            // A stopped container may already be gone; its id is all the
            // manager needs to drop it.
            Err(e) if action != EventAction::Started => {
                debug!("Inspect failed for {} {}: {}", action, short_id(&id), e);
                ContainerRecord {
                    id,
                    name,
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(
                    "Failed to inspect started container {} ({}): {}",
                    name,
                    short_id(&id),
                    e
                );
                return None;
            }
        };

        info!(
            "Container event: {} for {} ({})",
            action,
            container.name,
            container.short_id()
        );
        Some(ContainerEvent { action, container })
    }
}

fn connect_to_host(host: &str) -> Result<Docker, RuntimeError> {
    let result = if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    } else {
        return Err(RuntimeError::Connect(format!(
            "invalid docker host '{}', expected unix:// or tcp://",
            host
        )));
    };
    result.map_err(|e| RuntimeError::Connect(format!("{}: {}", host, e)))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<RunningContainer>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;

        Ok(containers.into_iter().filter_map(running_from_summary).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        self.docker
            .inspect_container(id, None)
            .await
            .map(record_from_inspect)
            .map_err(|e| RuntimeError::Api(format!("inspect {}: {}", id, e)))
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RuntimeEvent>, RuntimeError> {
        // Fail early if the daemon is not there at all.
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::channel(self.event_buffer);
        tokio::spawn(Self::pump_events(self.docker.clone(), tx, cancel));
        Ok(rx)
    }
}

fn trim_name(name: &str) -> String {
    name.trim_start_matches('/').to_string()
}

fn running_from_summary(summary: ContainerSummary) -> Option<RunningContainer> {
    let id = summary.id.filter(|id| !id.is_empty())?;
    let name = summary
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| trim_name(n))
        .unwrap_or_else(|| short_id(&id).to_string());
    Some(RunningContainer {
        id,
        name,
        image: summary.image.unwrap_or_default(),
        status: summary.status.unwrap_or_default(),
    })
}

/// Flatten the daemon's inspect response into a [`ContainerRecord`].
pub fn record_from_inspect(detail: ContainerInspectResponse) -> ContainerRecord {
    let (running, status) = detail
        .state
        .map(|state| {
            (
                state.running.unwrap_or(false),
                state.status.map(|s| s.to_string()).unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    let mut record = ContainerRecord {
        id: detail.id.unwrap_or_default(),
        name: detail.name.as_deref().map(trim_name).unwrap_or_default(),
        running,
        status,
        ..Default::default()
    };

    if let Some(config) = detail.config {
        record.image = config.image.unwrap_or_default();
        record.labels = config.labels.unwrap_or_default().into_iter().collect();
        record.env = config.env.unwrap_or_default();
        record.exposed_ports = config
            .exposed_ports
            .map(|ports| ports.into_keys().collect())
            .unwrap_or_default();
        record.exposed_ports.sort();
    }

    if let Some(settings) = detail.network_settings {
        record.default_ip = settings.ip_address.filter(|ip| !ip.is_empty());
        record.networks = settings
            .networks
            .unwrap_or_else(HashMap::new)
            .into_iter()
            .map(|(name, endpoint)| {
                let ip = endpoint
                    .ip_address
                    .filter(|ip| !ip.is_empty())
                    .or_else(|| endpoint.global_ipv6_address.filter(|ip| !ip.is_empty()))
                    .unwrap_or_default();
                (name, ip)
            })
            .collect();
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState, EndpointSettings, NetworkSettings};

    fn inspect_response() -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("4f1c2a9d8e7b6a5f4e3d2c1b".into()),
            name: Some("/blog-web-1".into()),
            state: Some(ContainerState {
                running: Some(true),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: Some("node:20".into()),
                labels: Some(HashMap::from([
                    ("com.docker.compose.project".to_string(), "blog".to_string()),
                    ("com.docker.compose.service".to_string(), "web".to_string()),
                ])),
                env: Some(vec!["NODE_ENV=development".into()]),
                exposed_ports: Some(HashMap::from([("3000/tcp".to_string(), HashMap::new())])),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ip_address: Some(String::new()),
                networks: Some(HashMap::from([(
                    "blog_default".to_string(),
                    EndpointSettings {
                        ip_address: Some("172.18.0.5".into()),
                        ..Default::default()
                    },
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn inspect_response_is_flattened() {
        let record = record_from_inspect(inspect_response());

        assert_eq!(record.name, "blog-web-1");
        assert_eq!(record.short_id(), "4f1c2a9d8e7b");
        assert!(record.running);
        assert_eq!(record.image, "node:20");
        assert_eq!(record.compose_project(), Some("blog"));
        assert_eq!(record.compose_service(), Some("web"));
        assert_eq!(record.exposed_ports, vec!["3000/tcp"]);
        assert_eq!(record.networks["blog_default"], "172.18.0.5");
        assert_eq!(record.default_ip, None);
    }

    #[test]
    fn empty_inspect_response_is_not_running() {
        let record = record_from_inspect(ContainerInspectResponse::default());
        assert!(!record.running);
        assert!(record.networks.is_empty());
    }

    #[test]
    fn summary_needs_an_id() {
        assert!(running_from_summary(ContainerSummary::default()).is_none());

        let summary = ContainerSummary {
            id: Some("abcdef0123456789".into()),
            names: Some(vec!["/redis".into()]),
            image: Some("redis:7".into()),
            status: Some("Up 2 minutes".into()),
            ..Default::default()
        };
        let running = running_from_summary(summary).unwrap();
        assert_eq!(running.name, "redis");
        assert_eq!(running.status, "Up 2 minutes");
    }

    #[test]
    fn event_filters_cover_lifecycle_verbs() {
        let opts = DockerRuntime::event_options();
        assert_eq!(opts.filters["type"], vec!["container"]);
        assert_eq!(opts.filters["event"], vec!["start", "stop", "die"]);
    }

    #[test]
    fn rejects_unknown_host_scheme() {
        assert!(matches!(
            connect_to_host("ftp://docker"),
            Err(RuntimeError::Connect(_))
        ));
    }
}
