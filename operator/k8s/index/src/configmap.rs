//! Create/skip/update logic for published config artifacts. Writes happen
//! only when the stored payload differs byte-wise from the desired one.

use anyhow::{Context, Result};
use fabedge_operator_k8s_api::{self as k8s, Api, ConfigMap, PostParams};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Create,
    Update,
}

/// Decides whether the artifact needs a write. `None` as the outer value
/// means the ConfigMap does not exist at all; `Some(None)` means it exists
/// without the config key.
fn plan(existing: Option<Option<&str>>, desired: &str) -> Option<Action> {
    match existing {
        None => Some(Action::Create),
        Some(Some(current)) if current == desired => None,
        Some(_) => Some(Action::Update),
    }
}

pub(crate) async fn apply(
    api: &Api<ConfigMap>,
    name: &str,
    key: &str,
    desired: String,
) -> Result<()> {
    let existing = match api.get(name).await {
        Ok(cm) => Some(cm),
        Err(k8s::Error::Api(resp)) if resp.code == 404 => None,
        Err(error) => return Err(error).with_context(|| format!("failed to get configmap {name}")),
    };
    let current = existing
        .as_ref()
        .map(|cm| cm.data.as_ref().and_then(|data| data.get(key)));

    match plan(current.map(|artifact| artifact.map(String::as_str)), &desired) {
        None => debug!(%name, "config unchanged; skipping"),
        Some(Action::Create) => {
            let cm = ConfigMap {
                metadata: k8s::ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                data: Some([(key.to_string(), desired)].into()),
                ..Default::default()
            };
            api.create(&PostParams::default(), &cm)
                .await
                .with_context(|| format!("failed to create configmap {name}"))?;
            info!(%name, "created config");
        }
        Some(Action::Update) => {
            let mut cm = existing.expect("an update implies an existing artifact");
            cm.data
                .get_or_insert_with(Default::default)
                .insert(key.to_string(), desired);
            api.replace(name, &PostParams::default(), &cm)
                .await
                .with_context(|| format!("failed to update configmap {name}"))?;
            info!(%name, "updated config");
        }
    }
    Ok(())
}
