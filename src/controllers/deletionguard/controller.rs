use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::*;

use crate::backoff::ErrorBackoff;
use crate::controllers::{
    changed_predicate, ensure_deletion_change, object_key, report_failure, Diagnostics, State,
    MANAGER,
};
use crate::finalizers::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use crate::resources::baremetalassets::{
    BareMetalAsset, BARE_METAL_ASSET_FINALIZER, CLUSTER_DEPLOYMENT_NAMESPACE_LABEL,
    CLUSTER_DEPLOYMENT_NAME_LABEL,
};
use crate::resources::hive::ClusterDeployment;
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

/// Assets labelled for the deployment `namespace/name`
fn asset_selector(namespace: &str, name: &str) -> String {
    format!("{CLUSTER_DEPLOYMENT_NAME_LABEL}={name},{CLUSTER_DEPLOYMENT_NAMESPACE_LABEL}={namespace}")
}

/// Merge patch releasing an asset from its cluster-deployment, None when already released
fn detach_patch(asset: &BareMetalAsset) -> Option<Value> {
    let cd = &asset.spec.cluster_deployment;
    if cd.name.is_empty() && cd.namespace.is_empty() {
        return None;
    }
    Some(json!({
        "spec": {
            "clusterDeployment": {
                "name": "",
                "namespace": "",
            }
        }
    }))
}

#[instrument(skip(ctx, cd), fields(trace_id))]
async fn reconcile(cd: Arc<ClusterDeployment>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ClusterDeployment>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    match guard(&cd, &ctx).await {
        Ok(()) => {
            ctx.backoff.reset(&object_key(cd.as_ref()));
            Ok(Action::await_change())
        }
        Err(err) => {
            report_failure(&ctx.recorder, &ctx.metrics, cd.as_ref(), &err).await?;
            Err(err)
        }
    }
}

async fn guard(cd: &ClusterDeployment, ctx: &Context) -> Result<()> {
    let namespace = cd.namespace().unwrap_or_default();
    let name = cd.name_any();
    let cds: Api<ClusterDeployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let deleting = is_deleting(cd);
    if deleting && !has_finalizer(cd, BARE_METAL_ASSET_FINALIZER) {
        return Ok(());
    }

    let assets: Api<BareMetalAsset> = Api::all(ctx.client.clone());
    let labelled = assets
        .list(&ListParams::default().labels(&asset_selector(&namespace, &name)))
        .await?
        .items;

    if !deleting {
        if !labelled.is_empty() && add_finalizer(&cds, cd, BARE_METAL_ASSET_FINALIZER).await? {
            info!("Guarding ClusterDeployment {} for {} assets", object_key(cd), labelled.len());
        }
        return Ok(());
    }

    let mut errors = Vec::new();
    for asset in &labelled {
        let Some(patch) = detach_patch(asset) else {
            continue;
        };
        let api: Api<BareMetalAsset> =
            Api::namespaced(ctx.client.clone(), &asset.namespace().unwrap_or_default());
        info!("Releasing BareMetalAsset {} from {}", object_key(asset), object_key(cd));
        if let Err(e) = api
            .patch(&asset.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            errors.push(Error::KubeError(e));
        }
    }
    if !errors.is_empty() {
        return Err(Error::Aggregate(errors));
    }

    remove_finalizer(&cds, cd, BARE_METAL_ASSET_FINALIZER).await?;
    Ok(())
}

fn error_policy(cd: Arc<ClusterDeployment>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(cd.as_ref()), error)
}

fn deployment_of(asset: &BareMetalAsset) -> Option<ObjectRef<ClusterDeployment>> {
    let name = asset.labels().get(CLUSTER_DEPLOYMENT_NAME_LABEL)?;
    let namespace = asset.labels().get(CLUSTER_DEPLOYMENT_NAMESPACE_LABEL)?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }
    Some(ObjectRef::new(name).within(namespace))
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let cds = Api::<ClusterDeployment>::all(client.clone());
    let assets = Api::<BareMetalAsset>::all(client.clone());

    if let Err(e) = cds.list(&ListParams::default().limit(1)).await {
        error!("ClusterDeployment is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let asset_watcher = watcher(assets, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    Controller::new(cds, Config::default())
        .shutdown_on_signal()
        .watches_stream(asset_watcher, |asset| deployment_of(&asset))
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
