//! Mirrors Community resources into the store's by-community index.

use crate::SharedStore;
use ahash::AHashSet;
use fabedge_operator_k8s_api::{Community, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    store: SharedStore,
}

// === impl Index ===

impl Index {
    pub fn shared(store: SharedStore) -> SharedIndex {
        Arc::new(RwLock::new(Self { store }))
    }
}

impl kubert::index::IndexClusterResource<Community> for Index {
    fn apply(&mut self, community: Community) {
        let name = community.name_unchecked();
        let members = community
            .spec
            .members
            .into_iter()
            .collect::<AHashSet<String>>();
        debug!(%name, members = members.len(), "updating community");
        self.store.save_community(name, members);
    }

    fn delete(&mut self, name: String) {
        debug!(%name, "deleting community");
        self.store.delete_community(&name);
    }

    fn reset(&mut self, communities: Vec<Community>, deleted: AHashSet<String>) {
        for community in communities {
            self.apply(community);
        }
        for name in deleted {
            self.delete(name);
        }
    }
}
