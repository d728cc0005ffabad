use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const HIVE_API_VERSION: &str = "hive.openshift.io/v1";
pub const SYNC_SET_KIND: &str = "SyncSet";

pub const APPLY_MODE_SYNC: &str = "Sync";
pub const APPLY_MODE_UPSERT: &str = "Upsert";

pub const SYNC_RESULT_SUCCESS: &str = "Success";
pub const SYNC_RESULT_FAILURE: &str = "Failure";

/// The record of a cluster's install or import
/// API: hive.openshift.io/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "ClusterDeployment",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub base_domain: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_pool_ref: Option<ClusterPoolReference>,

    #[serde(default)]
    pub installed: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPoolReference {
    pub namespace: String,
    pub pool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
}

impl ClusterPoolReference {
    pub fn is_claimed(&self) -> bool {
        self.claim_name.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// A pool of pre-provisioned clusters that can be claimed
/// API: hive.openshift.io/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "ClusterPool",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPoolSpec {
    #[serde(default)]
    pub size: i32,

    #[serde(default)]
    pub base_domain: String,
}

/// Resources and patches applied by hive to the clusters of the referenced deployments
/// API: hive.openshift.io/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "hive.openshift.io",
    version = "v1",
    kind = "SyncSet",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SyncSetSpec {
    #[serde(default)]
    pub resources: Vec<serde_json::Value>,

    #[serde(default)]
    pub patches: Vec<SyncObjectPatch>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_apply_mode: Option<String>,

    #[serde(default)]
    pub secret_mappings: Vec<SecretMapping>,

    #[serde(default)]
    pub cluster_deployment_refs: Vec<LocalObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncObjectPatch {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub patch: String,
    #[serde(default)]
    pub patch_type: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretMapping {
    pub source_ref: SecretReference,
    pub target_ref: SecretReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Observed state of every sync-set applied to the cluster of one deployment
/// API: hiveinternal.openshift.io/v1alpha1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "hiveinternal.openshift.io",
    version = "v1alpha1",
    kind = "ClusterSync",
    namespaced
)]
#[kube(status = "ClusterSyncStatus")]
pub struct ClusterSyncSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSyncStatus {
    #[serde(default)]
    pub sync_sets: Vec<SyncStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub name: String,
    #[serde(default)]
    pub observed_generation: i64,
    /// Success or Failure
    #[serde(default)]
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}
