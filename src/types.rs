//! Data structures shared by the discovery, configuration and manager
//! subsystems.
//!
//! Maps are kept as [`BTreeMap`]s so that everything derived from a
//! container record (addresses, routes, serialized configuration) is
//! stable from one run to the next.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// A single routable mapping from a host name to a container endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    /// Fully-qualified host name the proxy accepts.
    pub domain: String,
    /// IP or host name of the container's network endpoint.
    pub backend_address: String,
    pub backend_port: u16,
    /// The proxy terminates TLS for this route.
    pub secure: bool,
}

impl ProxyTarget {
    /// Upstream address in `host:port` form, bracketing IPv6 literals.
    pub fn dial(&self) -> String {
        if self.backend_address.contains(':') {
            format!("[{}]:{}", self.backend_address, self.backend_port)
        } else {
            format!("{}:{}", self.backend_address, self.backend_port)
        }
    }
}

/// Everything the engine needs to know about one container, as reported
/// by the runtime's inspect call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Display name without the runtime's leading `/`.
    pub name: String,
    pub image: String,
    pub status: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    /// Exposed ports as reported by the runtime, e.g. `3000/tcp`.
    pub exposed_ports: Vec<String>,
    /// Network name to assigned IP. Empty strings mean "attached, no IP".
    pub networks: BTreeMap<String, String>,
    /// Top-level IP on the default network, when the runtime reports one.
    pub default_ip: Option<String>,
}

impl ContainerRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn compose_project(&self) -> Option<&str> {
        self.label(COMPOSE_PROJECT_LABEL)
    }

    pub fn compose_service(&self) -> Option<&str> {
        self.label(COMPOSE_SERVICE_LABEL)
    }

    /// The 12 character id prefix used in logs.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// One entry of the runtime's cheap "list running containers" call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

/// Lifecycle transition reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Started,
    Stopped,
    Died,
    Other(String),
}

impl EventAction {
    /// Map a runtime action verb (`start`, `stop`, `die`, ...) to an action.
    pub fn from_verb(verb: &str) -> Self {
        match verb {
            "start" => EventAction::Started,
            "stop" => EventAction::Stopped,
            "die" => EventAction::Died,
            other => EventAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAction::Started => f.write_str("start"),
            EventAction::Stopped => f.write_str("stop"),
            EventAction::Died => f.write_str("die"),
            EventAction::Other(verb) => f.write_str(verb),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub action: EventAction,
    pub container: ContainerRecord,
}

/// What a runtime subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    Lifecycle(ContainerEvent),
    /// The runtime's event stream was re-established; anything that
    /// happened while it was down was not delivered.
    Reconnected,
}

/// Container id to the targets that container currently contributes.
pub type TargetState = BTreeMap<String, Vec<ProxyTarget>>;
