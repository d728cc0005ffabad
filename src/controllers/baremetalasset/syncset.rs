use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::{json, Value};

use crate::resources::baremetalassets::BareMetalAsset;
use crate::resources::hive::{
    LocalObjectReference, SecretMapping, SecretReference, SyncObjectPatch, SyncSet, SyncSetSpec,
    APPLY_MODE_SYNC, APPLY_MODE_UPSERT,
};
use crate::Result;

/// Where the hosts and their credentials live on the provisioned cluster
pub const HOST_NAMESPACE: &str = "openshift-machine-api";
const METAL3_API_VERSION: &str = "metal3.io/v1alpha1";
const BARE_METAL_HOST_KIND: &str = "BareMetalHost";

/// The BareMetalHost the asset describes. `online` is only set while the host is still being
/// created, later syncs must not power it back on.
pub fn bare_metal_host(asset: &BareMetalAsset, online: bool) -> Value {
    let mut spec = json!({
        "bmc": {
            "address": asset.spec.bmc.address,
            "credentialsName": asset.spec.bmc.credentials_name,
        },
        "hardwareProfile": asset.spec.hardware_profile,
        "bootMACAddress": asset.spec.boot_mac_address,
    });
    if online {
        spec["online"] = Value::Bool(true);
    }
    json!({
        "apiVersion": METAL3_API_VERSION,
        "kind": BARE_METAL_HOST_KIND,
        "metadata": {
            "name": asset.name_any(),
            "namespace": HOST_NAMESPACE,
            "labels": asset.desired_labels(),
        },
        "spec": spec,
    })
}

/// The sync-set for the asset, either creating the host (apply mode) or, once hive reported it
/// as synced, only patching it so that removing the sync-set leaves the host in place.
pub fn desired_sync_set(asset: &BareMetalAsset, patch_mode: bool) -> Result<SyncSet> {
    let cd = &asset.spec.cluster_deployment;
    let credentials = &asset.spec.bmc.credentials_name;

    let (resources, patches, mode) = if patch_mode {
        let patch = SyncObjectPatch {
            api_version: METAL3_API_VERSION.to_string(),
            kind: BARE_METAL_HOST_KIND.to_string(),
            name: asset.name_any(),
            namespace: HOST_NAMESPACE.to_string(),
            patch: serde_json::to_string(&bare_metal_host(asset, false))?,
            patch_type: "merge".to_string(),
        };
        (vec![], vec![patch], APPLY_MODE_UPSERT)
    } else {
        (vec![bare_metal_host(asset, true)], vec![], APPLY_MODE_SYNC)
    };

    Ok(SyncSet {
        metadata: ObjectMeta {
            name: Some(asset.name_any()),
            namespace: Some(cd.namespace.clone()),
            labels: Some(asset.desired_labels()),
            ..Default::default()
        },
        spec: SyncSetSpec {
            resources,
            patches,
            resource_apply_mode: Some(mode.to_string()),
            secret_mappings: vec![SecretMapping {
                source_ref: SecretReference {
                    name: credentials.clone(),
                    namespace: asset.namespace().unwrap_or_default(),
                },
                target_ref: SecretReference {
                    name: credentials.clone(),
                    namespace: HOST_NAMESPACE.to_string(),
                },
            }],
            cluster_deployment_refs: vec![LocalObjectReference {
                name: cd.name.clone(),
            }],
        },
    })
}

/// The live sync-set with the desired spec and labels folded in, None when nothing differs
pub fn updated_sync_set(found: &SyncSet, desired: &SyncSet) -> Option<SyncSet> {
    let mut labels = found.labels().clone();
    for (k, v) in desired.labels() {
        labels.insert(k.clone(), v.clone());
    }
    if found.spec == desired.spec && &labels == found.labels() {
        return None;
    }
    let mut updated = found.clone();
    updated.metadata.labels = Some(labels);
    updated.spec = desired.spec.clone();
    Some(updated)
}

/// What a pass has to write for the sync-set of an asset
#[derive(Debug)]
pub enum SyncSetWrite {
    Create(SyncSet),
    Replace(SyncSet),
    Keep,
}

/// Decide the write from the live sync-set and whether hive reported it as synced. A sync-set
/// already in patch mode stays there.
pub fn plan_sync_set(
    asset: &BareMetalAsset,
    found: Option<&SyncSet>,
    completed: bool,
) -> Result<SyncSetWrite> {
    let patch_mode = completed || found.is_some_and(|s| s.spec.resources.is_empty());
    let desired = desired_sync_set(asset, patch_mode)?;
    Ok(match found {
        None => SyncSetWrite::Create(desired),
        Some(found) => match updated_sync_set(found, &desired) {
            Some(updated) => SyncSetWrite::Replace(updated),
            None => SyncSetWrite::Keep,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::baremetalassets::{
        BareMetalAssetSpec, BmcDetails, ClusterDeploymentRef, CLUSTER_DEPLOYMENT_NAME_LABEL,
        CLUSTER_DEPLOYMENT_NAMESPACE_LABEL, ROLE_LABEL,
    };
    use crate::controllers::baremetalasset::status::observe_sync;
    use crate::resources::hive::{ClusterSync, ClusterSyncStatus, SyncStatus, SYNC_RESULT_SUCCESS};
    use assert_json_diff::assert_json_eq;

    fn reported(generation: i64) -> ClusterSync {
        let mut cs = ClusterSync::new("mycluster", Default::default());
        cs.status = Some(ClusterSyncStatus {
            sync_sets: vec![SyncStatus {
                name: "worker-0".into(),
                observed_generation: generation,
                result: SYNC_RESULT_SUCCESS.into(),
                failure_message: None,
            }],
            ..Default::default()
        });
        cs
    }

    fn asset() -> BareMetalAsset {
        let mut asset = BareMetalAsset::new(
            "worker-0",
            BareMetalAssetSpec {
                bmc: BmcDetails {
                    address: "ipmi://192.168.122.1:6233".into(),
                    credentials_name: "bmc-secret".into(),
                },
                hardware_profile: "dell".into(),
                boot_mac_address: "00:1B:44:11:3A:B7".into(),
                role: "worker".into(),
                cluster_deployment: ClusterDeploymentRef {
                    name: "mycluster".into(),
                    namespace: "mycluster".into(),
                },
            },
        );
        asset.metadata.namespace = Some("assets".into());
        asset
    }

    fn labels() -> Value {
        json!({
            CLUSTER_DEPLOYMENT_NAME_LABEL: "mycluster",
            CLUSTER_DEPLOYMENT_NAMESPACE_LABEL: "mycluster",
            ROLE_LABEL: "worker",
        })
    }

    #[test]
    fn apply_mode_creates_an_online_host() {
        let ss = desired_sync_set(&asset(), false).unwrap();
        assert_eq!(ss.metadata.namespace.as_deref(), Some("mycluster"));
        assert_eq!(ss.spec.resource_apply_mode.as_deref(), Some(APPLY_MODE_SYNC));
        assert!(ss.spec.patches.is_empty());
        assert_json_eq!(
            ss.spec.resources[0],
            json!({
                "apiVersion": "metal3.io/v1alpha1",
                "kind": "BareMetalHost",
                "metadata": {
                    "name": "worker-0",
                    "namespace": "openshift-machine-api",
                    "labels": labels(),
                },
                "spec": {
                    "bmc": {"address": "ipmi://192.168.122.1:6233", "credentialsName": "bmc-secret"},
                    "hardwareProfile": "dell",
                    "bootMACAddress": "00:1B:44:11:3A:B7",
                    "online": true,
                }
            })
        );
    }

    #[test]
    fn patch_mode_leaves_power_state_alone() {
        let ss = desired_sync_set(&asset(), true).unwrap();
        assert!(ss.spec.resources.is_empty());
        assert_eq!(ss.spec.resource_apply_mode.as_deref(), Some(APPLY_MODE_UPSERT));
        let patch = &ss.spec.patches[0];
        assert_eq!(patch.patch_type, "merge");
        assert_eq!(patch.namespace, HOST_NAMESPACE);
        let body: Value = serde_json::from_str(&patch.patch).unwrap();
        assert!(body["spec"].get("online").is_none());
        assert_eq!(body["spec"]["bootMACAddress"], "00:1B:44:11:3A:B7");
    }

    #[test]
    fn both_modes_map_the_credentials() {
        for patch_mode in [false, true] {
            let ss = desired_sync_set(&asset(), patch_mode).unwrap();
            assert_json_eq!(
                serde_json::to_value(&ss.spec.secret_mappings).unwrap(),
                json!([{
                    "sourceRef": {"name": "bmc-secret", "namespace": "assets"},
                    "targetRef": {"name": "bmc-secret", "namespace": "openshift-machine-api"},
                }])
            );
            assert_eq!(ss.spec.cluster_deployment_refs[0].name, "mycluster");
        }
    }

    #[test]
    fn second_pass_needs_no_update() {
        let desired = desired_sync_set(&asset(), false).unwrap();
        assert!(updated_sync_set(&desired, &desired).is_none());

        let mut found = desired.clone();
        found.labels_mut().insert("extra".into(), "kept".into());
        assert!(updated_sync_set(&found, &desired).is_none());

        let patch = desired_sync_set(&asset(), true).unwrap();
        let updated = updated_sync_set(&found, &patch).unwrap();
        assert_eq!(updated.labels()["extra"], "kept");
        assert_eq!(updated.spec, patch.spec);
    }

    #[test]
    fn missing_sync_set_is_created_in_apply_mode() {
        let SyncSetWrite::Create(created) = plan_sync_set(&asset(), None, false).unwrap() else {
            panic!("expected a create");
        };
        assert_eq!(created.spec.resource_apply_mode.as_deref(), Some(APPLY_MODE_SYNC));
        assert_eq!(created.spec.resources.len(), 1);
    }

    #[test]
    fn completed_sync_switches_to_patch_mode() {
        let mut live = desired_sync_set(&asset(), false).unwrap();
        live.metadata.generation = Some(1);
        let observation = observe_sync("worker-0", Some(&live), Some(&reported(1)));
        assert!(observation.completed);

        let SyncSetWrite::Replace(updated) =
            plan_sync_set(&asset(), Some(&live), observation.completed).unwrap()
        else {
            panic!("expected a replace");
        };
        assert!(updated.spec.resources.is_empty());
        assert_eq!(updated.spec.patches.len(), 1);
        assert_eq!(updated.spec.resource_apply_mode.as_deref(), Some(APPLY_MODE_UPSERT));
        assert_eq!(updated.metadata.generation, Some(1));
    }

    #[test]
    fn sync_set_in_patch_mode_is_not_rewritten() {
        let mut live = desired_sync_set(&asset(), true).unwrap();
        live.metadata.generation = Some(4);
        // hive has not caught up with the switch yet
        let observation = observe_sync("worker-0", Some(&live), Some(&reported(3)));
        assert!(!observation.completed);
        assert!(matches!(
            plan_sync_set(&asset(), Some(&live), observation.completed).unwrap(),
            SyncSetWrite::Keep
        ));
    }

    #[test]
    fn unapplied_generation_keeps_apply_mode() {
        let mut live = desired_sync_set(&asset(), false).unwrap();
        live.metadata.generation = Some(2);
        let observation = observe_sync("worker-0", Some(&live), Some(&reported(1)));
        assert!(!observation.completed);
        let reason = observation
            .conditions
            .iter()
            .map(|c| c.reason)
            .collect::<Vec<_>>();
        assert!(reason.contains(&"SyncSetNotApplied"));
        assert!(matches!(
            plan_sync_set(&asset(), Some(&live), observation.completed).unwrap(),
            SyncSetWrite::Keep
        ));
    }
}
