use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{metadata_watcher, watcher, Predicate, WatchStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource,
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use super::status::{
    observe_sync, remove_condition, remove_related_object, set_condition, set_related_object,
    ConditionUpdate, ASSET_SYNC_COMPLETED, ASSET_SYNC_STARTED, CLUSTER_DEPLOYMENT_FOUND,
    CREDENTIALS_FOUND,
};
use super::syncset::{desired_sync_set, plan_sync_set, updated_sync_set, SyncSetWrite};
use crate::backoff::{retry_on_conflict, ErrorBackoff};
use crate::controllers::{
    changed_predicate, ensure_deletion_change, object_key, report_failure, status_predicate_serde,
    Diagnostics, State, MANAGER,
};
use crate::finalizers::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use crate::rbac::delete_ignoring_not_found;
use crate::resources::baremetalassets::{
    BareMetalAsset, BareMetalAssetStatus, BARE_METAL_ASSET_FINALIZER,
    CLUSTER_DEPLOYMENT_NAMESPACE_LABEL, CLUSTER_DEPLOYMENT_NAME_LABEL,
};
use crate::resources::hive::{ClusterDeployment, ClusterSync, SyncSet, HIVE_API_VERSION, SYNC_SET_KIND};
use crate::{telemetry, Error, Metrics, Result};

// Context for our reconciler
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub backoff: ErrorBackoff,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, MANAGER.into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff: ErrorBackoff::default(),
        })
    }
}

/// One pass over an asset. Status is accumulated here and written once at the end.
struct AssetReconciler<'a> {
    ctx: &'a Context,
    asset: &'a BareMetalAsset,
    namespace: String,
    name: String,
    status: BareMetalAssetStatus,
    now: Time,
}

impl<'a> AssetReconciler<'a> {
    fn new(ctx: &'a Context, asset: &'a BareMetalAsset) -> Self {
        Self {
            ctx,
            asset,
            namespace: asset.namespace().unwrap_or_default(),
            name: asset.name_any(),
            status: asset.status.clone().unwrap_or_default(),
            now: Time(Utc::now()),
        }
    }

    fn condition(&mut self, update: ConditionUpdate) {
        set_condition(&mut self.status.conditions, update, &self.now);
    }

    fn assets(&self) -> Api<BareMetalAsset> {
        Api::namespaced(self.ctx.client.clone(), &self.namespace)
    }

    fn sync_sets(&self) -> Api<SyncSet> {
        Api::namespaced(
            self.ctx.client.clone(),
            &self.asset.spec.cluster_deployment.namespace,
        )
    }

    async fn run(&mut self) -> Result<()> {
        self.ensure_labels().await?;
        self.check_secret().await?;
        self.cleanup_old_sync_set().await?;
        self.check_cluster_deployment().await?;
        self.ensure_sync_set().await
    }

    async fn ensure_labels(&self) -> Result<()> {
        let desired = self.asset.desired_labels();
        let labels = self.asset.labels();
        if desired.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return Ok(());
        }
        debug!("Updating labels of BareMetalAsset {}", object_key(self.asset));
        let patch = json!({"metadata": {"labels": desired}});
        self.assets()
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn check_secret(&mut self) -> Result<()> {
        let secret_name = self.asset.spec.bmc.credentials_name.clone();
        let secrets: Api<Secret> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let Some(secret) = secrets.get_opt(&secret_name).await? else {
            self.condition(ConditionUpdate::new(
                CREDENTIALS_FOUND,
                false,
                "SecretNotFound",
                format!("Secret {}/{} was not found", self.namespace, secret_name),
            ));
            return Err(Error::AssetSecretNotFound {
                name: secret_name,
                namespace: self.namespace.clone(),
            });
        };

        set_related_object(&mut self.status.related_objects, secret.object_ref(&()));
        self.condition(ConditionUpdate::new(
            CREDENTIALS_FOUND,
            true,
            "SecretFound",
            format!("A secret with the name {} in namespace {} was found", secret_name, self.namespace),
        ));

        if secret.owner_references().is_empty() {
            if let Some(oref) = self.asset.controller_owner_ref(&()) {
                let patch = json!({
                    "metadata": {
                        "resourceVersion": secret.resource_version(),
                        "ownerReferences": [oref],
                    }
                });
                secrets
                    .patch(&secret_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
        }
        Ok(())
    }

    /// The cluster-deployment namespace moved, the sync-set left behind in the old one goes
    async fn cleanup_old_sync_set(&mut self) -> Result<()> {
        let target_namespace = &self.asset.spec.cluster_deployment.namespace;
        let Some(old) = self
            .status
            .related_objects
            .iter()
            .find(|r| {
                r.kind.as_deref() == Some(SYNC_SET_KIND)
                    && r.api_version.as_deref() == Some(HIVE_API_VERSION)
                    && r.name.as_deref() == Some(self.name.as_str())
                    && r.namespace.as_deref() != Some(target_namespace.as_str())
            })
            .cloned()
        else {
            return Ok(());
        };

        let old_namespace = old.namespace.clone().unwrap_or_default();
        info!("Cleaning up SyncSet {}/{} in the old namespace", old_namespace, self.name);
        let old_sync_sets: Api<SyncSet> = Api::namespaced(self.ctx.client.clone(), &old_namespace);
        delete_ignoring_not_found(&old_sync_sets, &self.name).await?;
        remove_related_object(&mut self.status.related_objects, &old);
        Ok(())
    }

    async fn check_cluster_deployment(&mut self) -> Result<()> {
        let cd = self.asset.spec.cluster_deployment.clone();
        if cd.is_empty() {
            self.condition(ConditionUpdate::new(
                CLUSTER_DEPLOYMENT_FOUND,
                false,
                "NoneSpecified",
                "No cluster deployment specified",
            ));
            remove_condition(&mut self.status.conditions, ASSET_SYNC_STARTED);
            remove_condition(&mut self.status.conditions, ASSET_SYNC_COMPLETED);
            return Err(Error::NoClusterDeployment);
        }

        let cds: Api<ClusterDeployment> = Api::namespaced(self.ctx.client.clone(), &cd.namespace);
        if cds.get_opt(&cd.name).await?.is_none() {
            self.condition(ConditionUpdate::new(
                CLUSTER_DEPLOYMENT_FOUND,
                false,
                "ClusterDeploymentNotFound",
                format!("ClusterDeployment {}/{} was not found", cd.namespace, cd.name),
            ));
            return Err(Error::ClusterDeploymentNotFound {
                name: cd.name,
                namespace: cd.namespace,
            });
        }
        self.condition(ConditionUpdate::new(
            CLUSTER_DEPLOYMENT_FOUND,
            true,
            "ClusterDeploymentFound",
            format!(
                "A ClusterDeployment with the name {} in namespace {} was found",
                cd.name, cd.namespace
            ),
        ));
        Ok(())
    }

    /// Whether hive has applied the current sync-set, recording the outcome in the conditions.
    /// Returns the live sync-set unless it had to be dropped.
    async fn observe(&mut self) -> Result<(Option<SyncSet>, bool)> {
        let cd = &self.asset.spec.cluster_deployment;
        let found = self.sync_sets().get_opt(&self.name).await?;
        let cluster_syncs: Api<ClusterSync> = Api::namespaced(self.ctx.client.clone(), &cd.namespace);
        let cluster_sync = cluster_syncs.get_opt(&cd.name).await?;

        let observation = observe_sync(&self.name, found.as_ref(), cluster_sync.as_ref());
        for update in observation.conditions {
            self.condition(update);
        }
        if observation.delete_sync_set {
            info!("Host of SyncSet {} is gone, recreating the SyncSet", object_key(self.asset));
            if let Err(e) = delete_ignoring_not_found(&self.sync_sets(), &self.name).await {
                warn!("Failed to delete SyncSet {}: {e}", self.name);
                return Ok((found, false));
            }
            return Ok((None, false));
        }
        Ok((found, observation.completed))
    }

    async fn ensure_sync_set(&mut self) -> Result<()> {
        let (found, completed) = self.observe().await?;
        let plan = plan_sync_set(self.asset, found.as_ref(), completed)?;
        let sync_sets = self.sync_sets();

        if let Some(found) = &found {
            set_related_object(&mut self.status.related_objects, found.object_ref(&()));
        }
        match plan {
            SyncSetWrite::Keep => Ok(()),
            SyncSetWrite::Create(desired) => {
                match sync_sets.create(&PostParams::default(), &desired).await {
                    Ok(created) => {
                        set_related_object(&mut self.status.related_objects, created.object_ref(&()));
                        self.condition(ConditionUpdate::new(
                            ASSET_SYNC_STARTED,
                            true,
                            "SyncSetCreated",
                            "SyncSet created successfully",
                        ));
                        Ok(())
                    }
                    Err(e) => {
                        self.condition(ConditionUpdate::new(
                            ASSET_SYNC_STARTED,
                            false,
                            "SyncSetCreationFailed",
                            "Failed to create SyncSet",
                        ));
                        Err(e.into())
                    }
                }
            }
            SyncSetWrite::Replace(updated) => {
                info!("Updating SyncSet {}", object_key(&updated));
                match sync_sets.replace(&self.name, &PostParams::default(), &updated).await {
                    Ok(_) => {
                        self.condition(ConditionUpdate::new(
                            ASSET_SYNC_STARTED,
                            true,
                            "SyncSetUpdated",
                            "SyncSet updated successfully",
                        ));
                        Ok(())
                    }
                    Err(e) => {
                        self.condition(ConditionUpdate::new(
                            ASSET_SYNC_STARTED,
                            false,
                            "SyncSetUpdateFailed",
                            "Failed to update SyncSet",
                        ));
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Deletion pass: move the host to patch-only form, wait for hive to confirm, then drop the
    /// sync-set. The finalizer goes once nothing is left.
    async fn cleanup(&mut self) -> Result<()> {
        if self.asset.spec.cluster_deployment.is_empty() {
            remove_finalizer(&self.assets(), self.asset, BARE_METAL_ASSET_FINALIZER).await?;
            return Ok(());
        }
        let sync_sets = self.sync_sets();
        let Some(found) = sync_sets.get_opt(&self.name).await? else {
            remove_finalizer(&self.assets(), self.asset, BARE_METAL_ASSET_FINALIZER).await?;
            return Ok(());
        };

        if !found.spec.resources.is_empty() {
            let desired = desired_sync_set(self.asset, true)?;
            if let Some(updated) = updated_sync_set(&found, &desired) {
                info!("Switching SyncSet {} to patch mode before deletion", object_key(&found));
                sync_sets.replace(&self.name, &PostParams::default(), &updated).await?;
            }
            return Ok(());
        }

        let (_, completed) = self.observe().await?;
        if completed {
            info!("Deleting SyncSet {}", object_key(&found));
            delete_ignoring_not_found(&sync_sets, &self.name).await?;
        }
        Ok(())
    }

    /// Persist the accumulated status, skipped when nothing changed
    async fn write_status(&self) -> Result<()> {
        if self.asset.status.as_ref() == Some(&self.status)
            || (self.asset.status.is_none() && self.status == BareMetalAssetStatus::default())
        {
            return Ok(());
        }
        let assets = self.assets();
        retry_on_conflict(&self.name, || async {
            let Some(mut latest) = assets.get_opt(&self.name).await? else {
                return Ok(());
            };
            if latest.status.as_ref() == Some(&self.status) {
                return Ok(());
            }
            latest.status = Some(self.status.clone());
            assets
                .replace_status(&self.name, &PostParams::default(), serde_json::to_vec(&latest)?)
                .await?;
            Ok(())
        })
        .await
    }
}

#[instrument(skip(ctx, asset), fields(trace_id))]
async fn reconcile(asset: Arc<BareMetalAsset>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<BareMetalAsset>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!("Reconciling BareMetalAsset \"{}\"", object_key(asset.as_ref()));
    match reconcile_asset(&asset, &ctx).await {
        Ok(action) => {
            ctx.backoff.reset(&object_key(asset.as_ref()));
            Ok(action)
        }
        Err(err) => {
            report_failure(&ctx.recorder, &ctx.metrics, asset.as_ref(), &err).await?;
            Err(err)
        }
    }
}

async fn reconcile_asset(asset: &BareMetalAsset, ctx: &Context) -> Result<Action> {
    let mut reconciler = AssetReconciler::new(ctx, asset);

    if is_deleting(asset) {
        if has_finalizer(asset, BARE_METAL_ASSET_FINALIZER) {
            reconciler.cleanup().await?;
        }
        return Ok(Action::await_change());
    }
    if add_finalizer(&reconciler.assets(), asset, BARE_METAL_ASSET_FINALIZER).await? {
        // the patch comes back as a new event
        return Ok(Action::await_change());
    }

    let result = reconciler.run().await;
    let written = reconciler.write_status().await;
    match result {
        Err(Error::NoClusterDeployment) => {
            info!("No ClusterDeployment specified for {}", object_key(asset));
        }
        Err(err) => {
            if let Err(e) = written {
                warn!("Failed to update status of {}: {e}", object_key(asset));
            }
            return Err(err);
        }
        Ok(()) => {}
    }
    written?;
    Ok(Action::await_change())
}

fn error_policy(asset: Arc<BareMetalAsset>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(asset.as_ref()), error)
}

fn assets_for_sync_set(store: &Store<BareMetalAsset>, sync_set: &SyncSet) -> Vec<ObjectRef<BareMetalAsset>> {
    let namespace = sync_set.namespace().unwrap_or_default();
    let name = sync_set.name_any();
    store
        .state()
        .iter()
        .filter(|a| {
            a.name_any() == name
                && a.labels().get(CLUSTER_DEPLOYMENT_NAMESPACE_LABEL) == Some(&namespace)
        })
        .map(|a| ObjectRef::from_obj(a.as_ref()))
        .collect()
}

fn assets_for_deployment(
    store: &Store<BareMetalAsset>,
    namespace: &str,
    name: &str,
    by_label: bool,
) -> Vec<ObjectRef<BareMetalAsset>> {
    store
        .state()
        .iter()
        .filter(|a| {
            if by_label {
                a.labels().get(CLUSTER_DEPLOYMENT_NAME_LABEL).map(String::as_str) == Some(name)
                    && a.labels().get(CLUSTER_DEPLOYMENT_NAMESPACE_LABEL).map(String::as_str)
                        == Some(namespace)
            } else {
                let cd = &a.spec.cluster_deployment;
                cd.name == name && cd.namespace == namespace
            }
        })
        .map(|a| ObjectRef::from_obj(a.as_ref()))
        .collect()
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let assets = Api::<BareMetalAsset>::all(client.clone());
    let sync_sets = Api::<SyncSet>::all(client.clone());
    let cluster_syncs = Api::<ClusterSync>::all(client.clone());
    let cds = Api::<ClusterDeployment>::all(client.clone());

    if let Err(e) = assets.list(&ListParams::default().limit(1)).await {
        error!("BareMetalAsset is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let sync_set_watcher = watcher(sync_sets, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    // hive reports progress in status only
    let cluster_sync_watcher = watcher(cluster_syncs, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let cd_watcher = metadata_watcher(cds, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let controller = Controller::new(assets, Config::default());
    let (by_sync_set, by_cluster_sync, by_cd) = (controller.store(), controller.store(), controller.store());

    controller
        .shutdown_on_signal()
        .watches_stream(sync_set_watcher, move |sync_set| {
            assets_for_sync_set(&by_sync_set, &sync_set)
        })
        .watches_stream(cluster_sync_watcher, move |cs| {
            let namespace = cs.namespace().unwrap_or_default();
            assets_for_deployment(&by_cluster_sync, &namespace, &cs.name_any(), false)
        })
        .watches_stream(cd_watcher, move |cd| {
            let namespace = cd.namespace().unwrap_or_default();
            assets_for_deployment(&by_cd, &namespace, &cd.name_any(), true)
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::baremetalassets::{BareMetalAssetSpec, ClusterDeploymentRef};
    use crate::resources::hive::SyncSetSpec;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;

    fn asset(name: &str, cd: &str, labelled: bool) -> BareMetalAsset {
        let mut asset = BareMetalAsset::new(
            name,
            BareMetalAssetSpec {
                cluster_deployment: ClusterDeploymentRef {
                    name: cd.into(),
                    namespace: cd.into(),
                },
                ..Default::default()
            },
        );
        asset.metadata.namespace = Some("assets".into());
        if labelled {
            asset.metadata.labels = Some(asset.desired_labels());
        }
        asset
    }

    fn store(assets: Vec<BareMetalAsset>) -> Store<BareMetalAsset> {
        let mut writer = Writer::default();
        for asset in assets {
            writer.apply_watcher_event(&Event::Apply(asset));
        }
        writer.as_reader()
    }

    fn names(refs: Vec<ObjectRef<BareMetalAsset>>) -> Vec<String> {
        let mut names: Vec<_> = refs.into_iter().map(|r| r.name).collect();
        names.sort();
        names
    }

    #[test]
    fn sync_sets_map_to_the_same_named_asset() {
        let mut elsewhere = asset("worker-0", "other", true);
        elsewhere.metadata.namespace = Some("other-assets".into());
        let store = store(vec![
            asset("worker-0", "mycluster", true),
            asset("worker-1", "mycluster", true),
            elsewhere,
        ]);
        let mut ss = SyncSet::new("worker-0", SyncSetSpec::default());
        ss.metadata.namespace = Some("mycluster".into());
        let refs = assets_for_sync_set(&store, &ss);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].namespace.as_deref(), Some("assets"));
    }

    #[test]
    fn deployments_map_by_label_and_syncs_by_spec() {
        let store = store(vec![
            asset("worker-0", "mycluster", true),
            asset("worker-1", "mycluster", false),
            asset("worker-2", "other", true),
        ]);
        assert_eq!(
            names(assets_for_deployment(&store, "mycluster", "mycluster", true)),
            vec!["worker-0"]
        );
        assert_eq!(
            names(assets_for_deployment(&store, "mycluster", "mycluster", false)),
            vec!["worker-0", "worker-1"]
        );
    }
}
