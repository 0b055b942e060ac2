use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use fabedge_operator_core::{subnets_overlap, Endpoint};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

pub type SharedStore = Arc<Store>;

/// The authoritative in-memory set of tunnel endpoints, plus the
/// by-community membership index. Mutation is reconcile-driven and
/// infrequent, so a single lock per store suffices.
#[derive(Debug, Default)]
pub struct Store {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: HashMap<String, Endpoint>,
    communities: HashMap<String, HashSet<String>>,
}

// === impl Store ===

impl Store {
    pub fn shared() -> SharedStore {
        Arc::new(Self::default())
    }

    /// Inserts or replaces by name. Collisions between distinct identities
    /// are last-writer-wins; overlapping subnets are legal. Both are
    /// surfaced at warn level.
    pub fn save(&self, endpoint: Endpoint) {
        let mut inner = self.inner.write();

        for (name, other) in inner.endpoints.iter() {
            if *name == endpoint.name {
                continue;
            }
            if let Some((subnet, other_subnet)) = subnets_overlap(&endpoint.subnets, &other.subnets)
            {
                warn!(
                    endpoint = %endpoint.name,
                    %subnet,
                    other = %name,
                    %other_subnet,
                    "endpoint subnets overlap",
                );
            }
        }

        if let Some(prev) = inner.endpoints.insert(endpoint.name.clone(), endpoint.clone()) {
            if prev.id != endpoint.id {
                warn!(
                    name = %endpoint.name,
                    old_id = %prev.id,
                    new_id = %endpoint.id,
                    "endpoint name reused by a different identity; keeping the latest write",
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.inner.read().endpoints.get(name).cloned()
    }

    /// Snapshot read; order follows the argument order, missing names are
    /// silently skipped.
    pub fn get_endpoints<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<Endpoint> {
        let inner = self.inner.read();
        names
            .into_iter()
            .filter_map(|name| inner.endpoints.get(name).cloned())
            .collect()
    }

    pub fn delete(&self, name: &str) {
        self.inner.write().endpoints.remove(name);
    }

    pub fn all_endpoint_names(&self) -> HashSet<String> {
        self.inner.read().endpoints.keys().cloned().collect()
    }

    pub fn all_endpoints(&self) -> Vec<Endpoint> {
        self.inner.read().endpoints.values().cloned().collect()
    }

    pub fn save_community(&self, name: impl Into<String>, members: HashSet<String>) {
        self.inner.write().communities.insert(name.into(), members);
    }

    pub fn delete_community(&self, name: &str) {
        self.inner.write().communities.remove(name);
    }

    /// All endpoints whose name appears in the named community, sorted by
    /// name for stable output.
    pub fn community_endpoints(&self, community: &str) -> Vec<Endpoint> {
        let inner = self.inner.read();
        let Some(members) = inner.communities.get(community) else {
            return Vec::new();
        };
        let mut endpoints = members
            .iter()
            .filter_map(|name| inner.endpoints.get(name).cloned())
            .collect::<Vec<_>>();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    /// All endpoints sharing at least one community with `name`, excluding
    /// the endpoint itself, sorted by name.
    pub fn community_peers(&self, name: &str) -> Vec<Endpoint> {
        let inner = self.inner.read();
        let mut peer_names = inner
            .communities
            .values()
            .filter(|members| members.contains(name))
            .flatten()
            .filter(|member| member.as_str() != name)
            .collect::<HashSet<_>>()
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        peer_names.sort();

        peer_names
            .into_iter()
            .filter_map(|peer| inner.endpoints.get(&peer).cloned())
            .collect()
    }
}
