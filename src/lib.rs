//! Keeps a Caddy reverse proxy's routes in step with the containers
//! running on a Docker host.
//!
//! Containers are discovered through the [`runtime`] boundary, turned into
//! [`types::ProxyTarget`]s by [`discovery`], assembled into a full Caddy
//! document by [`caddy::ConfigBuilder`] and applied through the admin API
//! by the [`manager::Manager`].

pub mod caddy;
pub mod config;
pub mod discovery;
pub mod manager;
pub mod runtime;
pub mod types;
