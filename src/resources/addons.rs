use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The built-in agent addon installed on every cluster
pub const WORK_MANAGER_ADDON: &str = "work-manager";

/// Addons whose records get the hosting cluster annotation in hosted mode
pub const KNOWN_ADDONS: &[&str] = &[WORK_MANAGER_ADDON];

pub const DEFAULT_INSTALL_NAMESPACE: &str = "open-cluster-management-agent-addon";

pub const ADDON_HOSTING_CLUSTER_ANNOTATION: &str =
    "addon.open-cluster-management.io/hosting-cluster-name";
pub const ENABLE_HOSTED_ADDONS_ANNOTATION: &str =
    "addon.open-cluster-management.io/enable-hosted-mode-addons";
pub const DISABLE_AUTO_INSTALL_ANNOTATION: &str =
    "addon.open-cluster-management.io/disable-automatic-installation";

pub const HOSTING_CLUSTER_VALIDITY: &str = "HostingClusterValidity";
pub const HOSTING_CLUSTER_VALID: &str = "Valid";
pub const HOSTING_CLUSTER_INVALID: &str = "Invalid";

/// An addon installed on one managed cluster, lives in the cluster namespace
/// API: addon.open-cluster-management.io/v1alpha1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ManagedClusterAddOn",
    namespaced
)]
#[kube(status = "ManagedClusterAddOnStatus")]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ManagedClusterAddOnStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// Namespace the agent of a hosted cluster runs in on its hosting cluster
pub fn hosted_install_namespace(cluster: &str) -> String {
    format!("klusterlet-{cluster}")
}
