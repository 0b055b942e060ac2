//! Connector-side data plane: reads the tunnel-config artifact rendered by
//! the operator and atomically replaces the host packet-filter rules that
//! carry overlay traffic, once per sync period.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use fabedge_iptables::{Iptables, CHAIN_FABEDGE_NAT_OUTGOING, TABLE_NAT};
use fabedge_operator_core::{parse_host_or_subnet, NetworkConf};
use ipnet::IpNet;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[clap(
    name = "fabedge-connector",
    about = "Maintains connector-side packet-filter rules for the edge overlay"
)]
struct Args {
    #[clap(
        long,
        env = "FABEDGE_CONNECTOR_LOG",
        default_value = "fabedge=info,warn"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Tunnel configuration file rendered by the operator.
    #[clap(long, default_value = "/etc/fabedge/tunnels.yaml")]
    tunnels_config: PathBuf,

    /// Seconds between rule syncs.
    #[clap(long, default_value = "60")]
    sync_period: u64,

    /// Address set holding all IPv4 peer CIDRs.
    #[clap(long, default_value = "FABEDGE-PEER-CIDR")]
    peer_ipset: String,

    /// Address set holding all IPv6 peer CIDRs.
    #[clap(long, default_value = "FABEDGE-PEER-CIDR6")]
    peer_ipset6: String,

    /// Masquerade overlay traffic leaving through this node.
    #[clap(long, action = clap::ArgAction::Set, default_value_t = true)]
    masq_outgoing: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        tunnels_config,
        sync_period,
        peer_ipset,
        peer_ipset6,
        masq_outgoing,
    } = Args::parse();

    log_format.try_init(log_level)?;

    let (shutdown, _handle) = kubert::shutdown::sigint_or_sigterm()?;
    info!(
        config = %tunnels_config.display(),
        period = sync_period,
        "maintaining connector packet-filter rules"
    );

    let sync_loop = async {
        let mut ticker = tokio::time::interval(Duration::from_secs(sync_period));
        loop {
            ticker.tick().await;
            if let Err(error) =
                sync_rules(&tunnels_config, &peer_ipset, &peer_ipset6, masq_outgoing).await
            {
                warn!(%error, "failed to replace rules; retrying on the next period");
            }
        }
    };

    tokio::select! {
        _ = sync_loop => unreachable!("the sync loop never returns"),
        _ = shutdown.signaled() => info!("received shutdown signal"),
    }
    Ok(())
}

async fn sync_rules(
    config: &Path,
    peer_ipset: &str,
    peer_ipset6: &str,
    masq_outgoing: bool,
) -> Result<()> {
    let contents = tokio::fs::read_to_string(config)
        .await
        .with_context(|| format!("failed to read {}", config.display()))?;
    let conf = NetworkConf::from_yaml(&contents).context("failed to parse tunnel config")?;
    let (v4_subnets, v6_subnets) = partition_subnets(&conf.tunnel_endpoint.subnets);

    let mut ipv4 = Iptables::ipv4();
    build_rules(&mut ipv4, &v4_subnets, peer_ipset, masq_outgoing);
    ipv4.replace_rules().await?;

    let mut ipv6 = Iptables::ipv6();
    build_rules(&mut ipv6, &v6_subnets, peer_ipset6, masq_outgoing);
    ipv6.replace_rules().await?;

    Ok(())
}

/// One complete ruleset per address family; applied wholesale so a failed
/// replace never leaves a partial state.
fn build_rules(ipt: &mut Iptables, local_subnets: &[String], peer_ipset: &str, masq: bool) {
    ipt.clear_all_rules();

    ipt.allow_ipsec();

    ipt.maintain_forward_rules_for_ipset(&[peer_ipset.to_string()]);
    ipt.maintain_forward_rules_for_subnets(local_subnets);

    ipt.prepare_post_routing_chain();
    ipt.add_post_routing_rule_for_kubernetes();
    ipt.add_post_routing_rules_for_ipset(peer_ipset);

    if masq {
        ipt.create_chain(TABLE_NAT, CHAIN_FABEDGE_NAT_OUTGOING);
        ipt.maintain_nat_outgoing_rules_for_subnets(local_subnets, peer_ipset);
    }
}

fn partition_subnets(subnets: &[String]) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for subnet in subnets {
        match parse_host_or_subnet(subnet) {
            Some(IpNet::V4(_)) => v4.push(subnet.clone()),
            Some(IpNet::V6(_)) => v6.push(subnet.clone()),
            None => warn!(%subnet, "ignoring unparseable subnet"),
        }
    }
    (v4, v6)
}
