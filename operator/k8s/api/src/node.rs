//! Projections of orchestrator nodes into the bits the operator cares about.

use crate::{Node, ResourceExt};

/// Nodes carrying this label run at the edge and are served by an agent; all
/// other nodes aggregate into the connector endpoint.
pub const EDGE_NODE_LABEL: &str = "node-role.kubernetes.io/edge";

pub fn is_edge_node(node: &Node) -> bool {
    node.labels().contains_key(EDGE_NODE_LABEL)
}

/// The node's primary address, taken from its InternalIP.
pub fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .map(|addr| addr.address.clone())
}

/// Pod CIDRs assigned to the node. Falls back to the singular `podCIDR`
/// field when the plural list is unset.
pub fn pod_cidrs(node: &Node) -> Vec<String> {
    let Some(spec) = node.spec.as_ref() else {
        return Vec::new();
    };
    match spec.pod_cidrs.as_ref() {
        Some(cidrs) if !cidrs.is_empty() => cidrs.clone(),
        _ => spec.pod_cidr.clone().into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeAddress, NodeSpec, NodeStatus, ObjectMeta};

    fn mk_node(name: &str, ip: Option<&str>, pod_cidrs: &[&str], edge: bool) -> Node {
        let labels = edge
            .then(|| [(EDGE_NODE_LABEL.to_string(), String::new())].into())
            .unwrap_or_default();
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            spec: Some(NodeSpec {
                pod_cidrs: Some(pod_cidrs.iter().map(|c| c.to_string()).collect()),
                ..NodeSpec::default()
            }),
            status: ip.map(|ip| NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        address: format!("{name}.example.com"),
                        type_: "Hostname".to_string(),
                    },
                    NodeAddress {
                        address: ip.to_string(),
                        type_: "InternalIP".to_string(),
                    },
                ]),
                ..NodeStatus::default()
            }),
        }
    }

    #[test]
    fn edge_label_marks_edge_nodes() {
        assert!(is_edge_node(&mk_node("edge1", None, &[], true)));
        assert!(!is_edge_node(&mk_node("master", None, &[], false)));
    }

    #[test]
    fn internal_ip_skips_other_address_types() {
        let node = mk_node("n1", Some("10.0.0.1"), &[], false);
        assert_eq!(internal_ip(&node).as_deref(), Some("10.0.0.1"));
        assert_eq!(internal_ip(&mk_node("n2", None, &[], false)), None);
    }

    #[test]
    fn pod_cidrs_prefers_the_plural_field() {
        let node = mk_node("n1", None, &["10.244.1.0/24", "fd00:1::/64"], false);
        assert_eq!(pod_cidrs(&node), vec!["10.244.1.0/24", "fd00:1::/64"]);

        let mut node = mk_node("n2", None, &[], false);
        node.spec.as_mut().unwrap().pod_cidr = Some("10.244.2.0/24".to_string());
        assert_eq!(pod_cidrs(&node), vec!["10.244.2.0/24"]);
    }
}
