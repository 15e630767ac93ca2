use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub log_level: String,
    pub caddy_admin_url: String,
    pub domain_suffix: String,
    pub ready_retries: u32,
    pub probe_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub event_buffer: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            caddy_admin_url: "http://localhost:2019".into(),
            domain_suffix: "localhost".into(),
            ready_retries: 30,
            probe_interval_ms: 1000,
            request_timeout_secs: 10,
            event_buffer: 10,
            docker_host: None,
        }
    }
}

impl Config {
    /// Layered sources, later ones winning: defaults, `devproxy.toml`,
    /// `devproxy.json`, `DEVPROXY_*` variables, then the bare
    /// `CADDY_ADMIN_URL` variable.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("devproxy.toml"))
            .merge(Json::file("devproxy.json"))
            .merge(Env::prefixed("DEVPROXY_"))
            .merge(Env::raw().only(&["CADDY_ADMIN_URL"]))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.domain_suffix.trim_matches('.').is_empty() {
            anyhow::bail!("domain_suffix must not be empty");
        }
        if config.ready_retries == 0 {
            anyhow::bail!("ready_retries must be at least 1");
        }
        if config.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }

        Ok(Config {
            domain_suffix: config.domain_suffix.trim_matches('.').to_string(),
            ..config
        })
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
