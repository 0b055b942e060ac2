//! In-memory indexes driven by cluster watches: the endpoint store, the
//! connector controller, the community controller, and the edge-node agent
//! controller, plus the peer-assembly helpers that project the store into
//! per-participant tunnel configurations.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod community;
mod configmap;
pub mod connector;
pub mod edge;
mod netconf;
mod store;

pub use self::{
    netconf::{agent_conf, connector_conf},
    store::{SharedStore, Store},
};

/// Key under which the tunnel configuration lives in its ConfigMap.
pub const CONNECTOR_CONFIG_FILE: &str = "tunnels.yaml";
