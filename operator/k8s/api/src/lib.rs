#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod community;
pub mod node;

pub use self::community::{Community, CommunitySpec};
pub use k8s_openapi::{
    api::core::v1::{
        ConfigMap, ConfigMapVolumeSource, Container, EnvVar, Node, NodeAddress, NodeSpec,
        NodeStatus, Pod, PodSpec, Secret, Toleration, Volume, VolumeMount,
    },
    ByteString,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    error::ErrorResponse,
    Client, Error,
};
