use crate::Endpoint;
use serde::{Deserialize, Serialize};

/// The per-participant view written to the tunnel-config artifact: the local
/// endpoint plus the remote endpoints it should tunnel to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConf {
    pub tunnel_endpoint: Endpoint,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<Endpoint>,
}

// === impl NetworkConf ===

impl NetworkConf {
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }

    /// A participant must never be listed as its own peer.
    pub fn contains_self_peer(&self) -> bool {
        self.peers
            .iter()
            .any(|p| p.name == self.tunnel_endpoint.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EndpointType;

    fn conf() -> NetworkConf {
        NetworkConf {
            tunnel_endpoint: Endpoint {
                id: "connector-id".to_string(),
                name: "connector".to_string(),
                public_addresses: vec!["connector.fabedge.io".to_string()],
                subnets: vec!["10.233.0.0/16".to_string()],
                node_subnets: vec!["10.20.8.10".to_string(), "10.20.8.11".to_string()],
                kind: EndpointType::Connector,
            },
            peers: vec![Endpoint {
                id: "edge1-id".to_string(),
                name: "edge1".to_string(),
                public_addresses: vec!["60.10.10.1".to_string()],
                subnets: vec!["10.233.64.0/24".to_string()],
                node_subnets: vec!["60.10.10.1".to_string()],
                kind: EndpointType::EdgeNode,
            }],
        }
    }

    #[test]
    fn yaml_round_trip_preserves_every_field() {
        let conf = conf();
        let yaml = conf.to_yaml().unwrap();
        assert_eq!(NetworkConf::from_yaml(&yaml).unwrap(), conf);
    }

    #[test]
    fn yaml_uses_the_wire_field_names() {
        let yaml = conf().to_yaml().unwrap();
        assert!(yaml.contains("tunnelEndpoint:"));
        assert!(yaml.contains("publicAddresses:"));
        assert!(yaml.contains("nodeSubnets:"));
        assert!(yaml.contains("type: Connector"));
    }

    #[test]
    fn self_peer_is_flagged() {
        let mut conf = conf();
        assert!(!conf.contains_self_peer());
        conf.peers.push(conf.tunnel_endpoint.clone());
        assert!(conf.contains_self_peer());
    }
}
