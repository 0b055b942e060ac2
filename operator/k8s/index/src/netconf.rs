//! Projects the endpoint store into per-participant tunnel configurations.
//! Peers are always sorted by name so the publication loop's byte-equality
//! checks are meaningful.

use crate::Store;
use fabedge_operator_core::{Endpoint, NetworkConf};
use tracing::warn;

/// The connector tunnels to every endpoint in the store except itself.
pub fn connector_conf(connector: &Endpoint, store: &Store) -> NetworkConf {
    let peers = finalize_peers(connector, store.all_endpoints());
    NetworkConf {
        tunnel_endpoint: connector.clone(),
        peers,
    }
}

/// An agent tunnels to the connector plus the members of its communities.
pub fn agent_conf(agent: &Endpoint, connector: &Endpoint, store: &Store) -> NetworkConf {
    let mut peers = vec![connector.clone()];
    peers.extend(store.community_peers(&agent.name));
    let peers = finalize_peers(agent, peers);
    NetworkConf {
        tunnel_endpoint: agent.clone(),
        peers,
    }
}

/// Sorts by name, drops the participant itself, and collapses duplicate
/// names (an invariant violation worth surfacing, not propagating).
fn finalize_peers(local: &Endpoint, mut peers: Vec<Endpoint>) -> Vec<Endpoint> {
    peers.retain(|peer| {
        if peer.name == local.name {
            warn!(name = %local.name, "dropping self-referential peer");
            return false;
        }
        true
    });
    peers.sort_by(|a, b| a.name.cmp(&b.name));
    peers.dedup_by(|b, a| {
        if a.name == b.name {
            if a.id != b.id {
                warn!(name = %a.name, "dropping duplicate peer name with conflicting identity");
            }
            true
        } else {
            false
        }
    });
    peers
}
