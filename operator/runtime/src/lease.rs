use anyhow::Result;
use fabedge_operator_k8s_api::{self as k8s, Api, PostParams};
use k8s_openapi::api::coordination::v1 as coordv1;
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_NAME: &str = "fabedge-operator-write";
const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Creates the write lease if needed and spawns the claim task. Config
/// publication is gated on holding the claim.
pub async fn init(
    client: k8s::Client,
    namespace: &str,
    claimant: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    let api = Api::<coordv1::Lease>::namespaced(client, namespace);

    let lease = coordv1::Lease {
        metadata: k8s::ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: None,
    };
    match api.create(&PostParams::default(), &lease).await {
        Ok(_) => tracing::info!(name = %LEASE_NAME, "created Lease"),
        Err(k8s::Error::Api(error)) if error.code == 409 => {
            tracing::debug!(name = %LEASE_NAME, "Lease already exists");
        }
        Err(error) => return Err(error.into()),
    }

    let manager = LeaseManager::init(api, LEASE_NAME).await?;
    let params = ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = manager.spawn(claimant.to_string(), params).await?;
    Ok(claims)
}
