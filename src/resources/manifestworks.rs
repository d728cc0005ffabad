use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Names the managed cluster a work delivers agent objects for, which is not the work's
/// namespace when the agent is hosted elsewhere
pub const WORK_CLUSTER_LABEL: &str = "addon.open-cluster-management.io/managed-cluster-name";

/// A set of manifests delivered to the cluster whose namespace the work lives in
/// API: work.open-cluster-management.io/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "work.open-cluster-management.io",
    version = "v1",
    kind = "ManifestWork",
    namespaced
)]
#[kube(status = "ManifestWorkStatus")]
pub struct ManifestWorkSpec {
    #[serde(default)]
    pub workload: ManifestsTemplate,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ManifestsTemplate {
    #[serde(default)]
    pub manifests: Vec<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ManifestWorkStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}
