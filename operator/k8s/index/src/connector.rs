//! Tracks non-edge nodes, aggregates them into the connector endpoint, and
//! periodically republishes the connector's tunnel configuration.

use crate::{configmap, connector_conf, SharedStore, CONNECTOR_CONFIG_FILE};
use ahash::AHashSet;
use anyhow::{Context, Result};
use fabedge_operator_core::{Endpoint, EndpointType};
use fabedge_operator_k8s_api::{self as k8s, node, Api, ConfigMap, ListParams, ResourceExt};
use kubert::lease::Claim;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{debug, warn};

const INIT_TIMEOUT: time::Duration = time::Duration::from_secs(5);

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Clone, Debug)]
pub struct Config {
    pub id: String,
    pub name: String,
    pub public_addresses: Vec<String>,
    pub provided_subnets: Vec<String>,
    pub collect_pod_cidrs: bool,
    pub namespace: String,
    pub config_name: String,
    pub interval: time::Duration,
}

/// Minimal projection of a cluster node.
#[derive(Clone, Debug, PartialEq, Eq)]
struct NodeInfo {
    ip: String,
    pod_cidrs: Vec<String>,
}

pub struct Index {
    config: Config,

    // Keyed by node name; iteration order determines subnet ordering in the
    // rebuilt endpoint, so it must be stable.
    nodes: BTreeMap<String, NodeInfo>,
    endpoint: Endpoint,
}

// === impl Index ===

impl Index {
    pub fn shared(config: Config) -> SharedIndex {
        let mut index = Self {
            config,
            nodes: BTreeMap::new(),
            endpoint: Endpoint::default(),
        };
        index.rebuild();
        Arc::new(RwLock::new(index))
    }

    /// Thread-safe snapshot of the connector endpoint.
    pub fn connector_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Seeds the node cache with an explicit List so the first published
    /// config is never missing nodes. Bounded; failure aborts startup.
    pub async fn initialize(index: &SharedIndex, client: k8s::Client) -> Result<()> {
        let api = Api::<k8s::Node>::all(client);
        let nodes = time::timeout(INIT_TIMEOUT, api.list(&ListParams::default()))
            .await
            .context("timed out listing nodes")?
            .context("failed to list nodes")?;

        let mut index = index.write();
        for node in nodes.items {
            if node::is_edge_node(&node) {
                continue;
            }
            index.add_node(node);
        }
        index.rebuild();
        Ok(())
    }

    /// Caches the node's IP and pod CIDRs. A node without either is skipped,
    /// not removed; a later update may fill them in.
    fn add_node(&mut self, node: k8s::Node) -> bool {
        let name = node.name_unchecked();

        let Some(ip) = node::internal_ip(&node) else {
            debug!(%name, "node has no internal IP; skipping");
            return false;
        };
        let mut pod_cidrs = node::pod_cidrs(&node);
        if pod_cidrs.is_empty() {
            debug!(%name, "node has no pod CIDRs; skipping");
            return false;
        }
        // The provided-subnets list is authoritative instead.
        if !self.config.collect_pod_cidrs {
            pod_cidrs.clear();
        }

        let info = NodeInfo { ip, pod_cidrs };
        match self.nodes.get(&name) {
            Some(prev) if *prev == info => false,
            _ => {
                self.nodes.insert(name, info);
                true
            }
        }
    }

    fn remove_node(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    /// The connector endpoint is a pure function of the node cache and the
    /// static config: provided subnets first, then pod CIDRs by node name.
    fn rebuild(&mut self) {
        let mut subnets = self.config.provided_subnets.clone();
        let mut node_subnets = Vec::with_capacity(self.nodes.len());
        for info in self.nodes.values() {
            subnets.extend(info.pod_cidrs.iter().cloned());
            node_subnets.push(info.ip.clone());
        }

        self.endpoint = Endpoint {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            public_addresses: self.config.public_addresses.clone(),
            subnets,
            node_subnets,
            kind: EndpointType::Connector,
        };
    }
}

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();

        if node.metadata.deletion_timestamp.is_some() {
            if self.remove_node(&name) {
                debug!(%name, "node is terminating; removed from connector");
                self.rebuild();
            }
            return;
        }
        // The watch is label-filtered, but a relabeled node arrives here as
        // an update rather than a delete.
        if node::is_edge_node(&node) {
            if self.remove_node(&name) {
                self.rebuild();
            }
            return;
        }

        if self.add_node(node) {
            debug!(%name, "node changed; rebuilding connector endpoint");
            self.rebuild();
        }
    }

    fn delete(&mut self, name: String) {
        if self.remove_node(&name) {
            debug!(%name, "node deleted; rebuilding connector endpoint");
        }
        self.rebuild();
    }

    fn reset(&mut self, nodes: Vec<k8s::Node>, _deleted: AHashSet<String>) {
        self.nodes.clear();
        for node in nodes {
            if node.metadata.deletion_timestamp.is_some() || node::is_edge_node(&node) {
                continue;
            }
            self.add_node(node);
        }
        self.rebuild();
    }
}

/// Republishes the connector's tunnel configuration every interval (and once
/// immediately). Failures are logged and retried on the next tick, giving
/// eventual consistency with staleness bounded by the interval.
pub async fn sync_connector_config(
    index: SharedIndex,
    store: SharedStore,
    client: k8s::Client,
    claims: watch::Receiver<Arc<Claim>>,
    claimant: String,
) {
    let (interval, namespace, name) = {
        let index = index.read();
        (
            index.config.interval,
            index.config.namespace.clone(),
            index.config.config_name.clone(),
        )
    };
    let api = Api::<ConfigMap>::namespaced(client, &namespace);

    let mut ticker = time::interval(interval);
    loop {
        ticker.tick().await;

        if !claims.borrow().is_current_for(&claimant) {
            debug!("not the lease holder; skipping publication");
            continue;
        }

        // A stuck API call must not block the next tick.
        match time::timeout(interval, update_config_map_if_needed(&index, &store, &api, &name)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, %name, "failed to publish connector config"),
            Err(_) => warn!(%name, "publishing connector config timed out"),
        }
    }
}

async fn update_config_map_if_needed(
    index: &SharedIndex,
    store: &SharedStore,
    api: &Api<ConfigMap>,
    name: &str,
) -> Result<()> {
    let conf = {
        let index = index.read();
        connector_conf(&index.endpoint, store)
    };
    let desired = conf.to_yaml().context("failed to serialize tunnel config")?;
    configmap::apply(api, name, CONNECTOR_CONFIG_FILE, desired).await
}
