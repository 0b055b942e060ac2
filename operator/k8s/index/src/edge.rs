//! Maintains the per-edge-node artifacts: the agent's tunnel-config
//! ConfigMap and the agent pod pinned to the node.
//!
//! The watch-driven index only records which edge nodes exist and forwards
//! their names to the controller task, which owns the Kubernetes client and
//! performs the writes. A periodic resync re-applies every known node so a
//! lost update is repaired within one period.

use crate::{agent_conf, configmap, connector, SharedStore, CONNECTOR_CONFIG_FILE};
use ahash::AHashSet;
use anyhow::Result;
use fabedge_operator_core::AgentArgumentMap;
use fabedge_operator_k8s_api::{
    self as k8s, node, Api, ConfigMap, ConfigMapVolumeSource, Container, DeleteParams, Pod,
    PodSpec, PostParams, ResourceExt, Toleration, Volume, VolumeMount,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    time,
};
use tracing::{debug, info, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Clone, Debug)]
pub struct Config {
    pub namespace: String,
    pub agent_image: String,
    pub agent_args: AgentArgumentMap,
    pub resync: time::Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    Ensure(String),
    Remove(String),
}

pub struct Index {
    updates: UnboundedSender<Update>,
}

// === impl Index ===

impl Index {
    pub fn shared(updates: UnboundedSender<Update>) -> SharedIndex {
        Arc::new(RwLock::new(Self { updates }))
    }

    fn send(&self, update: Update) {
        if self.updates.send(update).is_err() {
            warn!("agent controller has stopped; dropping update");
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        if !node::is_edge_node(&node) {
            return;
        }
        let name = node.name_unchecked();
        if node.metadata.deletion_timestamp.is_some() {
            self.send(Update::Remove(name));
        } else {
            self.send(Update::Ensure(name));
        }
    }

    fn delete(&mut self, name: String) {
        self.send(Update::Remove(name));
    }

    fn reset(&mut self, nodes: Vec<k8s::Node>, deleted: AHashSet<String>) {
        for node in nodes {
            self.apply(node);
        }
        for name in deleted {
            self.send(Update::Remove(name));
        }
    }
}

pub struct Controller {
    client: k8s::Client,
    store: SharedStore,
    connector: connector::SharedIndex,
    config: Config,
    updates: UnboundedReceiver<Update>,
    nodes: AHashSet<String>,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: k8s::Client,
        store: SharedStore,
        connector: connector::SharedIndex,
        config: Config,
        updates: UnboundedReceiver<Update>,
    ) -> Self {
        Self {
            client,
            store,
            connector,
            config,
            updates,
            nodes: AHashSet::new(),
        }
    }

    pub async fn run(mut self) {
        let mut resync = time::interval(self.config.resync);
        loop {
            tokio::select! {
                update = self.updates.recv() => match update {
                    Some(Update::Ensure(name)) => {
                        self.nodes.insert(name.clone());
                        if let Err(error) = self.ensure(&name).await {
                            warn!(node = %name, %error, "failed to reconcile agent");
                        }
                    }
                    Some(Update::Remove(name)) => {
                        self.nodes.remove(&name);
                        if let Err(error) = self.cleanup(&name).await {
                            warn!(node = %name, %error, "failed to clean up agent");
                        }
                    }
                    None => return,
                },
                _ = resync.tick() => {
                    for name in self.nodes.clone() {
                        if let Err(error) = self.ensure(&name).await {
                            warn!(node = %name, %error, "failed to resync agent");
                        }
                    }
                }
            }
        }
    }

    async fn ensure(&self, node: &str) -> Result<()> {
        // Until the agent has published its endpoint there is nothing to
        // render; the next resync after registration picks the node up.
        let Some(endpoint) = self.store.get(node) else {
            debug!(%node, "no endpoint registered for node; skipping");
            return Ok(());
        };
        let connector = self.connector.read().connector_endpoint();
        let conf = agent_conf(&endpoint, &connector, &self.store);

        let api = Api::<ConfigMap>::namespaced(self.client.clone(), &self.config.namespace);
        configmap::apply(
            &api,
            &agent_config_map_name(node),
            CONNECTOR_CONFIG_FILE,
            conf.to_yaml()?,
        )
        .await?;

        self.ensure_pod(node).await
    }

    async fn ensure_pod(&self, node: &str) -> Result<()> {
        let api = Api::<Pod>::namespaced(self.client.clone(), &self.config.namespace);
        let name = agent_pod_name(node);
        let desired_args = self.config.agent_args.argument_array();

        match api.get(&name).await {
            Ok(pod) => {
                let current_args = pod
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.containers.first())
                    .and_then(|container| container.args.clone())
                    .unwrap_or_default();
                // Pods are immutable where it matters; drifted arguments mean
                // delete now, recreate on the next pass.
                if current_args != desired_args {
                    info!(pod = %name, "agent arguments drifted; deleting pod");
                    api.delete(&name, &DeleteParams::default()).await?;
                }
            }
            Err(k8s::Error::Api(resp)) if resp.code == 404 => {
                let pod = agent_pod(node, &self.config);
                api.create(&PostParams::default(), &pod).await?;
                info!(pod = %name, "created agent pod");
            }
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    async fn cleanup(&self, node: &str) -> Result<()> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), &self.config.namespace);
        delete_ignoring_absent(&pods, &agent_pod_name(node)).await?;

        let config_maps = Api::<ConfigMap>::namespaced(self.client.clone(), &self.config.namespace);
        delete_ignoring_absent(&config_maps, &agent_config_map_name(node)).await?;

        info!(%node, "removed agent artifacts");
        Ok(())
    }
}

async fn delete_ignoring_absent<T>(api: &Api<T>, name: &str) -> Result<()>
where
    T: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(k8s::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(error) => Err(error.into()),
    }
}

pub fn agent_config_map_name(node: &str) -> String {
    format!("fabedge-agent-config-{node}")
}

pub fn agent_pod_name(node: &str) -> String {
    format!("fabedge-agent-{node}")
}

/// The agent pod runs on the host network of its node and mounts the
/// rendered tunnel config. Its arguments come from the operator's
/// `AGENT_ARG_`-prefixed environment.
pub fn agent_pod(node: &str, config: &Config) -> Pod {
    Pod {
        metadata: k8s::ObjectMeta {
            name: Some(agent_pod_name(node)),
            namespace: Some(config.namespace.clone()),
            labels: Some([("app".to_string(), "fabedge-agent".to_string())].into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            host_network: Some(true),
            restart_policy: Some("Always".to_string()),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "agent".to_string(),
                image: Some(config.agent_image.clone()),
                args: Some(config.agent_args.argument_array()),
                volume_mounts: Some(vec![VolumeMount {
                    name: "netconf".to_string(),
                    mount_path: "/etc/fabedge".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "netconf".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(agent_config_map_name(node)),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut agent_args = AgentArgumentMap::new();
        agent_args.set("enable-proxy", "false");
        agent_args.set("enable-ipam", "true");
        agent_args.set("log-level", "3");
        Config {
            namespace: "fabedge".to_string(),
            agent_image: "fabedge/agent:latest".to_string(),
            agent_args,
            resync: time::Duration::from_secs(60),
        }
    }

    #[test]
    fn agent_pod_is_pinned_to_its_node_with_rendered_args() {
        let pod = agent_pod("edge1", &config());
        assert_eq!(pod.metadata.name.as_deref(), Some("fabedge-agent-edge1"));

        let spec = pod.spec.expect("pod must have a spec");
        assert_eq!(spec.node_name.as_deref(), Some("edge1"));
        assert_eq!(spec.host_network, Some(true));

        let container = &spec.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap(),
            &["--enable-ipam=true", "--enable-proxy=false", "--v=3"],
        );

        let volume = &spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.config_map.as_ref().unwrap().name.as_deref(),
            Some("fabedge-agent-config-edge1"),
        );
    }

    #[test]
    fn index_forwards_edge_nodes_only() {
        use fabedge_operator_k8s_api::{node::EDGE_NODE_LABEL, ObjectMeta};
        use kubert::index::IndexClusterResource;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let index = Index::shared(tx);

        let mk = |name: &str, edge: bool| k8s::Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: edge.then(|| [(EDGE_NODE_LABEL.to_string(), String::new())].into()),
                ..Default::default()
            },
            ..Default::default()
        };

        index.write().apply(mk("edge1", true));
        index.write().apply(mk("master", false));
        index.write().delete("edge2".to_string());

        assert_eq!(rx.try_recv().ok(), Some(Update::Ensure("edge1".to_string())));
        assert_eq!(rx.try_recv().ok(), Some(Update::Remove("edge2".to_string())));
        assert!(rx.try_recv().is_err());
    }
}
