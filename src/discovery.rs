//! Target extraction.
//!
//! Turns one [`ContainerRecord`] into the proxy targets it should
//! contribute. Nothing here performs I/O or fails: a container whose
//! address or port cannot be resolved simply yields no targets.

use log::debug;

use crate::types::{ContainerRecord, ProxyTarget};

pub const ENABLED_LABEL: &str = "devproxy.enabled";
pub const DOMAIN_LABEL: &str = "devproxy.domain";
pub const PORT_LABEL: &str = "devproxy.port";
pub const PORT_ENV: &str = "DEVPROXY_PORT";

/// Name prefixes of the proxy's own infrastructure containers.
const RESERVED_PREFIXES: &[&str] = &["devproxy", "caddy"];

/// Name of the runtime's default network.
const DEFAULT_NETWORK: &str = "bridge";

/// Used when nothing declares a port. Only the head is ever returned; the
/// list is a guess at common web ports and no listening check is made.
const COMMON_WEB_PORTS: &[u16] = &[80, 8080, 3000, 8000, 5000];

#[derive(Debug, Clone)]
pub struct Discovery {
    domain_suffix: String,
}

impl Discovery {
    pub fn new(domain_suffix: impl Into<String>) -> Self {
        Self {
            domain_suffix: domain_suffix.into(),
        }
    }

    /// Identity under which a container's targets are stored.
    pub fn container_key<'a>(&self, container: &'a ContainerRecord) -> &'a str {
        &container.id
    }

    /// Derive the proxy targets for `container`. An empty result means
    /// "skip", never an error.
    pub fn extract(&self, container: &ContainerRecord) -> Vec<ProxyTarget> {
        if !should_proxy(container) {
            return Vec::new();
        }

        let Some(address) = backend_address(container) else {
            debug!("No address for container {}, skipping", container.name);
            return Vec::new();
        };
        let Some(port) = backend_port(container) else {
            debug!("No port for container {}, skipping", container.name);
            return Vec::new();
        };

        vec![ProxyTarget {
            domain: self.domain(container),
            backend_address: address,
            backend_port: port,
            secure: true,
        }]
    }

    fn domain(&self, container: &ContainerRecord) -> String {
        if let Some(domain) = container.label(DOMAIN_LABEL) {
            return domain.to_string();
        }

        if let (Some(project), Some(service)) =
            (container.compose_project(), container.compose_service())
        {
            return format!("{}.{}.{}", service, project, self.domain_suffix);
        }

        format!("{}.{}", container.name, self.domain_suffix)
    }
}

fn should_proxy(container: &ContainerRecord) -> bool {
    if !container.running {
        return false;
    }

    if container
        .label(ENABLED_LABEL)
        .is_some_and(|v| v.eq_ignore_ascii_case("false"))
    {
        return false;
    }

    // An explicit domain opts in even the reserved names.
    if container.label(DOMAIN_LABEL).is_some() {
        return true;
    }

    !RESERVED_PREFIXES
        .iter()
        .any(|prefix| container.name.starts_with(prefix))
}

fn backend_address(container: &ContainerRecord) -> Option<String> {
    let custom = container
        .networks
        .iter()
        .find(|(name, ip)| name.as_str() != DEFAULT_NETWORK && !ip.is_empty())
        .map(|(_, ip)| ip);

    custom
        .or_else(|| {
            container
                .networks
                .get(DEFAULT_NETWORK)
                .filter(|ip| !ip.is_empty())
        })
        .or_else(|| container.default_ip.as_ref().filter(|ip| !ip.is_empty()))
        .cloned()
}

fn backend_port(container: &ContainerRecord) -> Option<u16> {
    if let Some(port) = container.label(PORT_LABEL).and_then(parse_port) {
        return Some(port);
    }

    let env_port = container
        .env
        .iter()
        .filter_map(|entry| entry.strip_prefix(PORT_ENV)?.strip_prefix('='))
        .find_map(parse_port);
    if env_port.is_some() {
        return env_port;
    }

    let exposed = container
        .exposed_ports
        .iter()
        .filter_map(|spec| parse_port(spec.split('/').next().unwrap_or(spec.as_str())))
        .min();
    if exposed.is_some() {
        return exposed;
    }

    COMMON_WEB_PORTS.first().copied()
}

fn parse_port(value: &str) -> Option<u16> {
    value.trim().parse::<u16>().ok().filter(|port| *port != 0)
}
