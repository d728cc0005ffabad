use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub static BARE_METAL_ASSET_FINALIZER: &str = "baremetalasset.inventory.open-cluster-management.io";

pub const ROLE_LABEL: &str = "metal3.io/role";
pub const CLUSTER_DEPLOYMENT_NAME_LABEL: &str = "metal3.io/cluster-deployment-name";
pub const CLUSTER_DEPLOYMENT_NAMESPACE_LABEL: &str = "metal3.io/cluster-deployment-namespace";

/// Inventory record of a physical machine that will be configured into a cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "inventory.open-cluster-management.io",
    version = "v1alpha1",
    kind = "BareMetalAsset",
    namespaced
)]
#[kube(status = "BareMetalAssetStatus")]
#[kube(shortname = "bma")]
#[kube(
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterDeployment.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalAssetSpec {
    /// How to reach the baseboard management controller
    #[serde(default)]
    pub bmc: BmcDetails,

    /// The hardware profile of the host, eg `unknown`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hardware_profile: String,

    /// MAC address of the NIC the host boots from
    #[serde(default, rename = "bootMACAddress", skip_serializing_if = "String::is_empty")]
    pub boot_mac_address: String,

    /// `worker` or `master`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,

    /// The ClusterDeployment this host is meant for
    #[serde(default)]
    pub cluster_deployment: ClusterDeploymentRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BmcDetails {
    #[serde(default)]
    pub address: String,

    /// Name of a Secret in the asset namespace holding the BMC username and password
    #[serde(default)]
    pub credentials_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterDeploymentRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl ClusterDeploymentRef {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalAssetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AssetCondition>,

    /// Secrets and sync-sets this asset is tied to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_objects: Vec<ObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssetCondition {
    /// CredentialsFound, ClusterDeploymentFound, AssetSyncStarted or AssetSyncCompleted
    pub r#type: String,

    /// True, False or Unknown
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl BareMetalAsset {
    /// The label set the asset and its sync-set carry, mirrored from the spec
    pub fn desired_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                CLUSTER_DEPLOYMENT_NAME_LABEL.to_string(),
                self.spec.cluster_deployment.name.clone(),
            ),
            (
                CLUSTER_DEPLOYMENT_NAMESPACE_LABEL.to_string(),
                self.spec.cluster_deployment.namespace.clone(),
            ),
            (ROLE_LABEL.to_string(), self.spec.role.clone()),
        ])
    }

    pub fn conditions(&self) -> &[AssetCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn related_objects(&self) -> &[ObjectReference] {
        self.status
            .as_ref()
            .map(|s| s.related_objects.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_uses_wire_names() {
        let bma: BareMetalAssetSpec = serde_json::from_value(serde_json::json!({
            "bmc": {"address": "ipmi://192.168.122.1:6233", "credentialsName": "my-secret"},
            "bootMACAddress": "00:1B:44:11:3A:B7",
            "hardwareProfile": "hardwareProfile",
            "role": "worker",
            "clusterDeployment": {"name": "mycluster", "namespace": "bar"}
        }))
        .unwrap();
        assert_eq!(bma.bmc.credentials_name, "my-secret");
        assert_eq!(bma.boot_mac_address, "00:1B:44:11:3A:B7");
        assert_eq!(bma.cluster_deployment.namespace, "bar");
    }

    #[test]
    fn desired_labels_mirror_spec() {
        let bma = BareMetalAsset::new(
            "mycluster-worker-0",
            BareMetalAssetSpec {
                role: "worker".into(),
                cluster_deployment: ClusterDeploymentRef {
                    name: "mycluster".into(),
                    namespace: "bar".into(),
                },
                ..Default::default()
            },
        );
        let labels = bma.desired_labels();
        assert_eq!(labels[ROLE_LABEL], "worker");
        assert_eq!(labels[CLUSTER_DEPLOYMENT_NAME_LABEL], "mycluster");
        assert_eq!(labels[CLUSTER_DEPLOYMENT_NAMESPACE_LABEL], "bar");
    }
}
