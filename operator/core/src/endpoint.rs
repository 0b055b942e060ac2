use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// A named, addressable participant in the overlay.
///
/// The `id` is used as the IPsec peer identity; `name` is the human label and
/// the store key. `subnets` holds the CIDRs whose traffic is carried into the
/// endpoint, while `node_subnets` holds the host addresses used for
/// forwarding and SNAT policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Reachable host addresses (IP or DNS name) for IKE, in preference order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_subnets: Vec<String>,

    #[serde(rename = "type", default)]
    pub kind: EndpointType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointType {
    Connector,
    #[default]
    EdgeNode,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEndpoint {
    #[error("endpoint id must not be empty")]
    EmptyId,

    #[error("endpoint name must not be empty")]
    EmptyName,

    #[error("endpoint {name} carries an unparseable subnet {subnet:?}")]
    BadSubnet { name: String, subnet: String },

    #[error("endpoint {name} carries an unparseable node subnet {subnet:?}")]
    BadNodeSubnet { name: String, subnet: String },
}

// === impl Endpoint ===

impl Endpoint {
    pub fn validate(&self) -> Result<(), InvalidEndpoint> {
        if self.id.is_empty() {
            return Err(InvalidEndpoint::EmptyId);
        }
        if self.name.is_empty() {
            return Err(InvalidEndpoint::EmptyName);
        }
        for subnet in &self.subnets {
            if parse_host_or_subnet(subnet).is_none() {
                return Err(InvalidEndpoint::BadSubnet {
                    name: self.name.clone(),
                    subnet: subnet.clone(),
                });
            }
        }
        for subnet in &self.node_subnets {
            if parse_host_or_subnet(subnet).is_none() {
                return Err(InvalidEndpoint::BadNodeSubnet {
                    name: self.name.clone(),
                    subnet: subnet.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Parses a CIDR, falling back to treating a bare address as a host network.
pub fn parse_host_or_subnet(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    s.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Returns the first overlapping pair between two subnet lists, if any.
/// Overlap between distinct endpoints is legal but worth surfacing.
pub fn subnets_overlap(left: &[String], right: &[String]) -> Option<(String, String)> {
    for l in left {
        let Some(lnet) = parse_host_or_subnet(l) else {
            continue;
        };
        for r in right {
            let Some(rnet) = parse_host_or_subnet(r) else {
                continue;
            };
            if lnet.contains(&rnet) || rnet.contains(&lnet) {
                return Some((l.clone(), r.clone()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, subnets: &[&str]) -> Endpoint {
        Endpoint {
            id: format!("{name}-id"),
            name: name.to_string(),
            public_addresses: vec!["10.20.8.4".to_string()],
            subnets: subnets.iter().map(|s| s.to_string()).collect(),
            node_subnets: vec!["10.20.8.4".to_string()],
            kind: EndpointType::EdgeNode,
        }
    }

    #[test]
    fn validate_accepts_cidrs_and_bare_addresses() {
        let ep = endpoint("edge1", &["10.244.1.0/24", "2001:db8::/64"]);
        assert_eq!(ep.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_empty_identity() {
        let mut ep = endpoint("edge1", &[]);
        ep.id.clear();
        assert_eq!(ep.validate(), Err(InvalidEndpoint::EmptyId));

        let mut ep = endpoint("edge1", &[]);
        ep.name.clear();
        assert_eq!(ep.validate(), Err(InvalidEndpoint::EmptyName));
    }

    #[test]
    fn validate_rejects_garbage_subnets() {
        let ep = endpoint("edge1", &["not-a-cidr"]);
        assert!(matches!(
            ep.validate(),
            Err(InvalidEndpoint::BadSubnet { .. })
        ));
    }

    #[test]
    fn overlap_is_detected_in_either_direction() {
        let a = vec!["10.244.0.0/16".to_string()];
        let b = vec!["10.244.7.0/24".to_string()];
        assert!(subnets_overlap(&a, &b).is_some());
        assert!(subnets_overlap(&b, &a).is_some());

        let c = vec!["192.168.0.0/24".to_string()];
        assert_eq!(subnets_overlap(&a, &c), None);
    }
}
