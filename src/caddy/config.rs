//! Caddy configuration document and the builder that produces it.
//!
//! The builder is a pure function of the target set. Routes are ordered by
//! domain and every map is a [`BTreeMap`], so an unchanged target set
//! always serializes to the same bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ProxyTarget;

/// Key of the single HTTP server in the generated document.
pub const SERVER_NAME: &str = "devproxy";

const LISTEN_ADDRS: &[&str] = &[":80", ":443"];
const REMOTE_HOST: &str = "{http.request.remote_host}";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaddyConfig {
    #[serde(default)]
    pub apps: CaddyApps,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaddyApps {
    #[serde(default)]
    pub http: HttpApp,
    #[serde(default)]
    pub tls: TlsApp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpApp {
    #[serde(default)]
    pub servers: BTreeMap<String, Server>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub r#match: Vec<Match>,
    #[serde(default)]
    pub handle: Vec<Handler>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default)]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    pub handler: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub dial: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOps>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderOps {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsApp {
    #[serde(default)]
    pub automation: TlsAutomation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsAutomation {
    #[serde(default)]
    pub policies: Vec<TlsPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsPolicy {
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub issuers: Vec<Issuer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Issuer {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

impl CaddyConfig {
    /// Every host matched by the generated server's routes.
    pub fn domains(&self) -> Vec<&str> {
        self.apps
            .http
            .servers
            .get(SERVER_NAME)
            .into_iter()
            .flat_map(|server| &server.routes)
            .flat_map(|route| &route.r#match)
            .flat_map(|m| m.host.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    domain_suffix: String,
}

impl ConfigBuilder {
    pub fn new(domain_suffix: impl Into<String>) -> Self {
        Self {
            domain_suffix: domain_suffix.into(),
        }
    }

    /// Build the full document for `targets`. When several targets share a
    /// domain the first one is routed and the rest are shadowed.
    pub fn build(&self, targets: &[ProxyTarget]) -> CaddyConfig {
        let mut by_domain: BTreeMap<&str, &ProxyTarget> = BTreeMap::new();
        for target in targets {
            by_domain.entry(target.domain.as_str()).or_insert(target);
        }

        let routes = by_domain
            .into_iter()
            .map(|(domain, target)| route(domain, target))
            .collect();

        let server = Server {
            listen: LISTEN_ADDRS.iter().map(|s| s.to_string()).collect(),
            routes,
        };

        CaddyConfig {
            apps: CaddyApps {
                http: HttpApp {
                    servers: BTreeMap::from([(SERVER_NAME.to_string(), server)]),
                },
                tls: TlsApp {
                    automation: TlsAutomation {
                        policies: vec![TlsPolicy {
                            subjects: vec![format!("*.{}", self.domain_suffix)],
                            issuers: vec![Issuer {
                                module: "internal".into(),
                                ca: Some("local".into()),
                            }],
                        }],
                    },
                },
            },
        }
    }

    /// Serialize a document the way it is sent to and compared against
    /// the control plane.
    pub fn serialize(config: &CaddyConfig) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(config)
    }
}

fn route(domain: &str, target: &ProxyTarget) -> Route {
    let set = BTreeMap::from([
        ("Host".to_string(), vec![domain.to_string()]),
        ("X-Forwarded-For".to_string(), vec![REMOTE_HOST.to_string()]),
        ("X-Forwarded-Proto".to_string(), vec!["https".to_string()]),
        ("X-Real-IP".to_string(), vec![REMOTE_HOST.to_string()]),
    ]);

    Route {
        r#match: vec![Match {
            host: vec![domain.to_string()],
        }],
        handle: vec![Handler {
            handler: "reverse_proxy".into(),
            upstreams: vec![Upstream {
                dial: target.dial(),
            }],
            headers: Some(Headers {
                request: Some(HeaderOps { set }),
            }),
        }],
        terminal: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(domain: &str, addr: &str, port: u16) -> ProxyTarget {
        ProxyTarget {
            domain: domain.into(),
            backend_address: addr.into(),
            backend_port: port,
            secure: true,
        }
    }

    #[test]
    fn document_shape() {
        let config = ConfigBuilder::new("localhost").build(&[target(
            "web.blog.localhost",
            "172.18.0.5",
            3000,
        )]);
        let value = serde_json::to_value(&config).unwrap();

        assert_eq!(
            value,
            json!({
                "apps": {
                    "http": {
                        "servers": {
                            "devproxy": {
                                "listen": [":80", ":443"],
                                "routes": [{
                                    "match": [{"host": ["web.blog.localhost"]}],
                                    "handle": [{
                                        "handler": "reverse_proxy",
                                        "upstreams": [{"dial": "172.18.0.5:3000"}],
                                        "headers": {"request": {"set": {
                                            "Host": ["web.blog.localhost"],
                                            "X-Forwarded-For": ["{http.request.remote_host}"],
                                            "X-Forwarded-Proto": ["https"],
                                            "X-Real-IP": ["{http.request.remote_host}"]
                                        }}}
                                    }],
                                    "terminal": true
                                }]
                            }
                        }
                    },
                    "tls": {
                        "automation": {
                            "policies": [{
                                "subjects": ["*.localhost"],
                                "issuers": [{"module": "internal", "ca": "local"}]
                            }]
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn output_is_stable_across_builds_and_input_order() {
        let builder = ConfigBuilder::new("localhost");
        let a = target("a.localhost", "10.0.0.1", 80);
        let b = target("b.localhost", "10.0.0.2", 8080);
        let c = target("c.localhost", "10.0.0.3", 3000);

        let first = ConfigBuilder::serialize(&builder.build(&[a.clone(), b.clone(), c.clone()]))
            .unwrap();
        let again = ConfigBuilder::serialize(&builder.build(&[a.clone(), b.clone(), c.clone()]))
            .unwrap();
        let shuffled = ConfigBuilder::serialize(&builder.build(&[c, a, b])).unwrap();

        assert_eq!(first, again);
        assert_eq!(first, shuffled);
    }

    #[test]
    fn first_target_wins_per_domain() {
        let config = ConfigBuilder::new("localhost").build(&[
            target("web.localhost", "10.0.0.1", 80),
            target("web.localhost", "10.0.0.2", 81),
        ]);
        let server = &config.apps.http.servers[SERVER_NAME];
        assert_eq!(server.routes.len(), 1);
        assert_eq!(server.routes[0].handle[0].upstreams[0].dial, "10.0.0.1:80");
    }

    #[test]
    fn empty_target_set_still_has_listener_and_tls() {
        let config = ConfigBuilder::new("test").build(&[]);
        assert!(config.domains().is_empty());
        assert_eq!(
            config.apps.http.servers[SERVER_NAME].listen,
            vec![":80", ":443"]
        );
        assert_eq!(config.apps.tls.automation.policies[0].subjects, vec!["*.test"]);
    }

    #[test]
    fn parses_back_what_it_writes() {
        let config =
            ConfigBuilder::new("localhost").build(&[target("web.localhost", "fd00::1", 80)]);
        let bytes = ConfigBuilder::serialize(&config).unwrap();
        let parsed: CaddyConfig = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.domains(), vec!["web.localhost"]);
    }
}
