use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label naming the cluster-set a cluster, deployment or pool belongs to
pub const CLUSTER_SET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";

pub const DEPLOY_MODE_ANNOTATION: &str = "import.open-cluster-management.io/klusterlet-deploy-mode";
pub const HOSTING_CLUSTER_ANNOTATION: &str = "import.open-cluster-management.io/hosting-cluster-name";
pub const DEPLOY_MODE_HOSTED: &str = "Hosted";

pub const GLOBAL_CLUSTER_SET: &str = "global";
pub const DEFAULT_CLUSTER_SET: &str = "default";

pub const SELECTOR_TYPE_EXCLUSIVE: &str = "ExclusiveClusterSetLabel";
pub const SELECTOR_TYPE_LABEL_SELECTOR: &str = "LabelSelector";

/// A cluster registered with the hub
/// API: cluster.open-cluster-management.io/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster"
)]
#[kube(status = "ManagedClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(default)]
    pub hub_accepts_client: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ManagedClusterStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Node resources reported by the agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocatable: Option<BTreeMap<String, serde_json::Value>>,
}

impl ManagedCluster {
    pub fn cluster_set(&self) -> Option<&str> {
        self.labels()
            .get(CLUSTER_SET_LABEL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The hosting cluster, when the klusterlet runs in hosted mode somewhere else
    pub fn hosting_cluster(&self) -> Option<&str> {
        let annotations = self.annotations();
        if annotations.get(DEPLOY_MODE_ANNOTATION).map(String::as_str) != Some(DEPLOY_MODE_HOSTED)
        {
            return None;
        }
        annotations
            .get(HOSTING_CLUSTER_ANNOTATION)
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }
}

/// A named grouping of managed clusters
/// API: cluster.open-cluster-management.io/v1beta2
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1beta2",
    kind = "ManagedClusterSet"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<ManagedClusterSelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSelector {
    /// ExclusiveClusterSetLabel (the default) or LabelSelector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

impl ManagedClusterSetSpec {
    /// The spec of the single label-selector based set that selects every cluster
    pub fn global() -> Self {
        Self {
            cluster_selector: Some(ManagedClusterSelector {
                selector_type: Some(SELECTOR_TYPE_LABEL_SELECTOR.into()),
                label_selector: Some(LabelSelector::default()),
            }),
        }
    }

    pub fn selector_type(&self) -> &str {
        self.cluster_selector
            .as_ref()
            .and_then(|s| s.selector_type.as_deref())
            .unwrap_or(SELECTOR_TYPE_EXCLUSIVE)
    }

    /// The label selector when this set selects clusters by label
    pub fn label_selector(&self) -> Option<&LabelSelector> {
        if self.selector_type() != SELECTOR_TYPE_LABEL_SELECTOR {
            return None;
        }
        self.cluster_selector
            .as_ref()
            .and_then(|s| s.label_selector.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn cluster(annotations: &[(&str, &str)]) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("c".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn hosting_cluster_requires_hosted_mode() {
        assert_eq!(
            cluster(&[
                (DEPLOY_MODE_ANNOTATION, "Hosted"),
                (HOSTING_CLUSTER_ANNOTATION, "local")
            ])
            .hosting_cluster(),
            Some("local")
        );
        assert_eq!(
            cluster(&[
                (DEPLOY_MODE_ANNOTATION, "Default"),
                (HOSTING_CLUSTER_ANNOTATION, "local")
            ])
            .hosting_cluster(),
            None
        );
        assert_eq!(
            cluster(&[(DEPLOY_MODE_ANNOTATION, "Hosted"), (HOSTING_CLUSTER_ANNOTATION, "")])
                .hosting_cluster(),
            None
        );
    }

    #[test]
    fn selector_type_defaults_to_exclusive() {
        assert_eq!(
            ManagedClusterSetSpec::default().selector_type(),
            SELECTOR_TYPE_EXCLUSIVE
        );
        assert!(ManagedClusterSetSpec::default().label_selector().is_none());
        assert!(ManagedClusterSetSpec::global().label_selector().is_some());
    }

    #[test]
    fn global_spec_deserializes_from_api_shape() {
        let spec: ManagedClusterSetSpec = serde_json::from_value(serde_json::json!({
            "clusterSelector": {"selectorType": "LabelSelector", "labelSelector": {}}
        }))
        .unwrap();
        assert_eq!(spec, ManagedClusterSetSpec::global());
    }
}
