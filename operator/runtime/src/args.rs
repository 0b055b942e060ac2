use crate::{apiserver::ApiServer, cert::CertManager, lease, token::TokenStore};
use anyhow::{bail, Result};
use clap::Parser;
use fabedge_operator_core::{parse_host_or_subnet, AgentArgumentMap};
use fabedge_operator_k8s_api::{self as k8s, node};
use fabedge_operator_k8s_index::{community, connector, edge, Store};
use kube::runtime::watcher;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "fabedge-operator",
    about = "Publishes tunnel topology and bootstrap certificates for the edge overlay"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "fabedge=info,warn",
        env = "FABEDGE_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace holding the operator's artifacts.
    #[clap(long, default_value = "fabedge", env = "FABEDGE_NAMESPACE")]
    namespace: String,

    #[clap(long, default_value = "cloud-connector")]
    connector_name: String,

    /// IPsec identity of the connector; defaults to the connector name.
    #[clap(long)]
    connector_id: Option<String>,

    /// Comma-separated addresses edge nodes can reach the connector at.
    #[clap(long)]
    connector_public_addresses: Addresses,

    /// Comma-separated CIDRs always carried by the connector.
    #[clap(long, default_value = "")]
    provided_subnets: Subnets,

    /// Collect pod CIDRs from non-edge nodes into the connector endpoint.
    #[clap(long, action = clap::ArgAction::Set, default_value_t = true)]
    collect_pod_cidrs: bool,

    #[clap(long, default_value = "connector-config")]
    connector_config_name: String,

    /// Seconds between tunnel-config publications.
    #[clap(long, default_value = "300")]
    sync_interval: u64,

    /// Seconds between agent resync passes.
    #[clap(long, default_value = "60")]
    agent_resync: u64,

    #[clap(long, default_value = "fabedge/agent:latest")]
    agent_image: String,

    #[clap(long, default_value = "0.0.0.0:3030")]
    api_server_addr: SocketAddr,

    #[clap(long, default_value = "fabedge-ca")]
    ca_secret_name: String,

    /// File holding single-use bootstrap tokens, one per line.
    #[clap(long)]
    token_file: Option<PathBuf>,

    /// Days signed certificates remain valid.
    #[clap(long, default_value = "365")]
    cert_validity_days: i64,
}

// === impl Args ===

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            connector_name,
            connector_id,
            connector_public_addresses: Addresses(public_addresses),
            provided_subnets: Subnets(provided_subnets),
            collect_pod_cidrs,
            connector_config_name,
            sync_interval,
            agent_resync,
            agent_image,
            api_server_addr,
            ca_secret_name,
            token_file,
            cert_validity_days,
        } = self;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .build()
            .await?;

        let store = Store::shared();

        let validity = time::Duration::days(cert_validity_days);
        let cert_manager = Arc::new(
            CertManager::load_or_create(runtime.client(), &namespace, &ca_secret_name, validity)
                .await?,
        );
        let tokens = Arc::new(match token_file {
            Some(path) => TokenStore::from_file(&path)?,
            None => TokenStore::default(),
        });
        if tokens.is_empty() {
            warn!("no bootstrap tokens configured; certificate signing is disabled");
        }

        // Seed the connector's node cache with an explicit List before the
        // watch registers so the first published config is complete.
        let connector_index = connector::Index::shared(connector::Config {
            id: connector_id.unwrap_or_else(|| connector_name.clone()),
            name: connector_name,
            public_addresses,
            provided_subnets,
            collect_pod_cidrs,
            namespace: namespace.clone(),
            config_name: connector_config_name,
            interval: Duration::from_secs(sync_interval),
        });
        connector::Index::initialize(&connector_index, runtime.client()).await?;

        let non_edge_nodes = runtime.watch_all::<k8s::Node>(
            watcher::Config::default().labels(&format!("!{}", node::EDGE_NODE_LABEL)),
        );
        tokio::spawn(
            kubert::index::cluster(connector_index.clone(), non_edge_nodes)
                .instrument(info_span!("nodes")),
        );

        let communities = runtime.watch_all::<k8s::Community>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(community::Index::shared(store.clone()), communities)
                .instrument(info_span!("communities")),
        );

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let edge_nodes = runtime
            .watch_all::<k8s::Node>(watcher::Config::default().labels(node::EDGE_NODE_LABEL));
        tokio::spawn(
            kubert::index::cluster(edge::Index::shared(updates_tx), edge_nodes)
                .instrument(info_span!("edge-nodes")),
        );

        let hostname =
            std::env::var("HOSTNAME").unwrap_or_else(|_| "fabedge-operator".to_string());
        let claims = lease::init(runtime.client(), &namespace, &hostname).await?;

        tokio::spawn(
            connector::sync_connector_config(
                connector_index.clone(),
                store.clone(),
                runtime.client(),
                claims,
                hostname,
            )
            .instrument(info_span!("connector-config")),
        );

        let agent_controller = edge::Controller::new(
            runtime.client(),
            store.clone(),
            connector_index,
            edge::Config {
                namespace: namespace.clone(),
                agent_image,
                agent_args: AgentArgumentMap::from_env(),
                resync: Duration::from_secs(agent_resync),
            },
            updates_rx,
        );
        tokio::spawn(agent_controller.run().instrument(info_span!("agents")));

        let api_server = ApiServer::new(
            api_server_addr,
            vec![
                "fabedge-operator".to_string(),
                format!("fabedge-operator.{namespace}"),
                "localhost".to_string(),
            ],
            cert_manager,
            tokens,
            store,
        );
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if let Err(error) = api_server.run(shutdown).await {
                    error!(%error, "certificate API server failed");
                }
            }
            .instrument(info_span!("apiserver")),
        );

        // Block on the shutdown signal; background tasks drain cooperatively.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Addresses(Vec<String>);

impl std::str::FromStr for Addresses {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

#[derive(Clone, Debug, Default)]
struct Subnets(Vec<String>);

impl std::str::FromStr for Subnets {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut subnets = Vec::new();
        for piece in s.split(',').map(str::trim).filter(|piece| !piece.is_empty()) {
            if parse_host_or_subnet(piece).is_none() {
                bail!("invalid subnet {piece:?}");
            }
            subnets.push(piece.to_string());
        }
        Ok(Self(subnets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnets_parse_comma_separated_cidrs() {
        let Subnets(subnets) = "10.233.0.0/16, 192.168.1.1".parse().unwrap();
        assert_eq!(subnets, vec!["10.233.0.0/16", "192.168.1.1"]);

        let Subnets(empty) = "".parse().unwrap();
        assert_eq!(empty, Vec::<String>::new());

        assert!("10.233.0.0/16,bogus".parse::<Subnets>().is_err());
    }
}
