use std::fmt::Debug;

use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::Result;

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Merge patch replacing the finalizer list, guarded by the observed resource version
fn finalizers_patch<K: Resource>(obj: &K, finalizers: Vec<String>) -> Value {
    json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    })
}

fn with_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Option<Value> {
    if has_finalizer(obj, finalizer) {
        return None;
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    Some(finalizers_patch(obj, finalizers))
}

fn without_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Option<Value> {
    if !has_finalizer(obj, finalizer) {
        return None;
    }
    let finalizers = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    Some(finalizers_patch(obj, finalizers))
}

/// Returns true when a write was issued
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(patch) = with_finalizer(obj, finalizer) else {
        return Ok(false);
    };
    debug!("Adding finalizer {} to {}", finalizer, obj.name_any());
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Returns true when a write was issued
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(patch) = without_finalizer(obj, finalizer) else {
        return Ok(false);
    };
    debug!("Removing finalizer {} from {}", finalizer, obj.name_any());
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn object(finalizers: &[&str]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cd".into()),
                resource_version: Some("42".into()),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn adding_keeps_existing_and_pins_version() {
        let patch = with_finalizer(&object(&["other"]), "mine").unwrap();
        assert_eq!(
            patch,
            json!({"metadata": {"resourceVersion": "42", "finalizers": ["other", "mine"]}})
        );
        assert!(with_finalizer(&object(&["mine"]), "mine").is_none());
    }

    #[test]
    fn removing_only_drops_ours() {
        let patch = without_finalizer(&object(&["other", "mine"]), "mine").unwrap();
        assert_eq!(
            patch,
            json!({"metadata": {"resourceVersion": "42", "finalizers": ["other"]}})
        );
        assert!(without_finalizer(&object(&["other"]), "mine").is_none());
    }
}
