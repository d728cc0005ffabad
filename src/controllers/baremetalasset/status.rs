//! Condition bookkeeping and the evaluation of hive's sync report for an asset.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::resources::baremetalassets::AssetCondition;
use crate::resources::hive::{ClusterSync, SyncSet, SYNC_RESULT_SUCCESS};

pub const CREDENTIALS_FOUND: &str = "CredentialsFound";
pub const CLUSTER_DEPLOYMENT_FOUND: &str = "ClusterDeploymentFound";
pub const ASSET_SYNC_STARTED: &str = "AssetSyncStarted";
pub const ASSET_SYNC_COMPLETED: &str = "AssetSyncCompleted";

#[derive(Clone, Debug, PartialEq)]
pub struct ConditionUpdate {
    pub kind: &'static str,
    pub status: bool,
    pub reason: &'static str,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(kind: &'static str, status: bool, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            reason,
            message: message.into(),
        }
    }
}

fn status_str(status: bool) -> &'static str {
    if status {
        "True"
    } else {
        "False"
    }
}

/// Upsert by type. The transition time only moves when the status does.
pub fn set_condition(conditions: &mut Vec<AssetCondition>, update: ConditionUpdate, now: &Time) {
    let status = status_str(update.status);
    match conditions.iter_mut().find(|c| c.r#type == update.kind) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Some(now.clone());
            }
            existing.reason = Some(update.reason.to_string());
            existing.message = Some(update.message);
        }
        None => conditions.push(AssetCondition {
            r#type: update.kind.to_string(),
            status: status.to_string(),
            reason: Some(update.reason.to_string()),
            message: Some(update.message),
            last_transition_time: Some(now.clone()),
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<AssetCondition>, kind: &str) {
    conditions.retain(|c| c.r#type != kind);
}

fn same_object(a: &ObjectReference, b: &ObjectReference) -> bool {
    a.api_version == b.api_version && a.kind == b.kind && a.namespace == b.namespace && a.name == b.name
}

/// Reference without the fields that change on every write of the target
pub fn stable_reference(mut reference: ObjectReference) -> ObjectReference {
    reference.resource_version = None;
    reference.field_path = None;
    reference
}

pub fn set_related_object(related: &mut Vec<ObjectReference>, reference: ObjectReference) {
    let reference = stable_reference(reference);
    match related.iter_mut().find(|r| same_object(r, &reference)) {
        Some(existing) => *existing = reference,
        None => related.push(reference),
    }
}

pub fn remove_related_object(related: &mut Vec<ObjectReference>, reference: &ObjectReference) {
    related.retain(|r| !same_object(r, reference));
}

/// What the cluster sync says about the asset's sync-set
#[derive(Debug, Default, PartialEq)]
pub struct SyncObservation {
    pub conditions: Vec<ConditionUpdate>,
    /// Hive reported the current sync-set as applied
    pub completed: bool,
    /// The patch target is gone from the cluster, the sync-set must be recreated in full
    pub delete_sync_set: bool,
}

impl SyncObservation {
    fn incomplete(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            conditions: vec![ConditionUpdate::new(ASSET_SYNC_COMPLETED, false, reason, message)],
            ..Default::default()
        }
    }
}

pub fn observe_sync(
    asset_name: &str,
    sync_set: Option<&SyncSet>,
    cluster_sync: Option<&ClusterSync>,
) -> SyncObservation {
    let Some(sync_set) = sync_set else {
        return SyncObservation::incomplete("SyncStatusNotFound", format!("SyncSet {asset_name} was not found"));
    };
    let Some(cluster_sync) = cluster_sync else {
        return SyncObservation::incomplete(
            "SyncStatusNotFound",
            format!("No ClusterSync reports on SyncSet {asset_name}"),
        );
    };

    let entries: Vec<_> = cluster_sync
        .status
        .iter()
        .flat_map(|s| s.sync_sets.iter())
        .filter(|s| s.name == asset_name)
        .collect();
    let [status] = entries.as_slice() else {
        let mut observation = SyncObservation::incomplete(
            "UnexpectedResourceCount",
            format!("Expected one sync status for {asset_name}, found {}", entries.len()),
        );
        observation.conditions.insert(
            0,
            ConditionUpdate::new(ASSET_SYNC_STARTED, true, "SyncSetCreated", "SyncSet exists"),
        );
        return observation;
    };

    if status.observed_generation < sync_set.metadata.generation.unwrap_or_default() {
        return SyncObservation::incomplete("SyncSetNotApplied", "SyncSet has not been applied yet");
    }

    let resources = sync_set.spec.resources.len();
    let patches = sync_set.spec.patches.len();
    if resources != 1 && patches != 1 {
        return SyncObservation::incomplete(
            "UnexpectedResourceCount",
            format!("Expected one resource or one patch on SyncSet, found {resources} resources and {patches} patches"),
        );
    }

    if status.result == SYNC_RESULT_SUCCESS {
        return SyncObservation {
            conditions: vec![ConditionUpdate::new(
                ASSET_SYNC_COMPLETED,
                true,
                "SyncSetAppliedSuccessful",
                "Successfully applied SyncSet",
            )],
            completed: true,
            delete_sync_set: false,
        };
    }

    let failure = status.failure_message.as_deref().unwrap_or_default();
    let mut observation = SyncObservation::incomplete(
        "SyncSetAppliedFailed",
        format!("Failed to apply SyncSet: {failure}"),
    );
    observation.delete_sync_set = resources != 1 && failure.contains("not found");
    observation
}
