//! Records the hosting cluster on the addons of hosted clusters.
//!
//! Only ever adds the annotation. A value set by someone else is left alone, so users can point
//! an addon at a different host.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, WatchStreamExt};
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
use crate::resources::addons::{ManagedClusterAddOn, ADDON_HOSTING_CLUSTER_ANNOTATION, KNOWN_ADDONS};
use crate::resources::managedclusters::ManagedCluster;
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

/// Merge patch adding the hosting annotation, None when the key is already there
fn hosting_patch<K: ResourceExt>(addon: &K, hosting: &str) -> Option<Value> {
    if addon.annotations().contains_key(ADDON_HOSTING_CLUSTER_ANNOTATION) {
        return None;
    }
    Some(json!({
        "metadata": {
            "annotations": {
                ADDON_HOSTING_CLUSTER_ANNOTATION: hosting,
            }
        }
    }))
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedCluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    match annotate(&cluster, &ctx).await {
        Ok(()) => {
            ctx.backoff.reset(&object_key(cluster.as_ref()));
            Ok(Action::await_change())
        }
        Err(err) => {
            report_failure(&ctx.recorder, &ctx.metrics, cluster.as_ref(), &err).await?;
            Err(err)
        }
    }
}

async fn annotate(cluster: &ManagedCluster, ctx: &Context) -> Result<()> {
    let Some(hosting) = cluster.hosting_cluster() else {
        return Ok(());
    };
    let name = cluster.name_any();
    let addons: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), &name);

    let mut errors = Vec::new();
    for addon_name in KNOWN_ADDONS {
        let addon = match addons.get_metadata_opt(addon_name).await {
            Ok(Some(addon)) => addon,
            Ok(None) => continue,
            Err(e) => {
                errors.push(Error::KubeError(e));
                continue;
            }
        };
        let Some(patch) = hosting_patch(&addon, hosting) else {
            continue;
        };
        info!("Annotating addon {}/{} with hosting cluster {}", name, addon_name, hosting);
        if let Err(e) = addons
            .patch(addon_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            errors.push(Error::KubeError(e));
        }
    }
    if !errors.is_empty() {
        return Err(Error::Aggregate(errors));
    }
    Ok(())
}

fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(cluster.as_ref()), error)
}

fn cluster_of_addon<K: ResourceExt>(addon: &K) -> Option<ObjectRef<ManagedCluster>> {
    if !KNOWN_ADDONS.contains(&addon.name_any().as_str()) {
        return None;
    }
    addon.namespace().map(|ns| ObjectRef::new(&ns))
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let clusters = Api::<ManagedCluster>::all(client.clone());
    let addons = Api::<ManagedClusterAddOn>::all(client.clone());

    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("ManagedCluster is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let addon_watcher = metadata_watcher(addons, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    Controller::new(clusters, Config::default())
        .shutdown_on_signal()
        .watches_stream(addon_watcher, |addon| cluster_of_addon(&addon))
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
