//! Core types shared by the operator, the bootstrap client, and the connector
//! daemon. This crate is deliberately free of Kubernetes dependencies.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod agent_args;
mod endpoint;
mod netconf;
pub mod protocol;

pub use self::{
    agent_args::AgentArgumentMap,
    endpoint::{parse_host_or_subnet, subnets_overlap, Endpoint, EndpointType, InvalidEndpoint},
    netconf::NetworkConf,
};
