use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named set of endpoints that should see each other as peers. Without a
/// community, an edge endpoint only ever tunnels to the connector.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "fabedge.io", version = "v1alpha1", kind = "Community")]
#[serde(rename_all = "camelCase")]
pub struct CommunitySpec {
    /// Endpoint names granted edge-to-edge reachability among themselves.
    #[serde(default)]
    pub members: Vec<String>,
}
