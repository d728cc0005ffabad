use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
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
use crate::resources::hive::{ClusterDeployment, ClusterPool};
use crate::resources::managedclusters::{ManagedCluster, CLUSTER_SET_LABEL};
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

/// Where a deployment takes its cluster-set label from
#[derive(Debug, PartialEq)]
enum LabelSource<'a> {
    /// Claimed out of a pool, the paired managed cluster governs the label
    Claimed,
    Pool { namespace: &'a str, name: &'a str },
    Cluster { name: &'a str },
}

fn label_source(cd: &ClusterDeployment) -> LabelSource<'_> {
    match &cd.spec.cluster_pool_ref {
        Some(pool) if pool.is_claimed() => LabelSource::Claimed,
        Some(pool) => LabelSource::Pool {
            namespace: &pool.namespace,
            name: &pool.pool_name,
        },
        None => LabelSource::Cluster {
            name: cd.metadata.namespace.as_deref().unwrap_or_default(),
        },
    }
}

fn cluster_set_label<K: kube::Resource>(obj: &K) -> Option<&str> {
    obj.labels()
        .get(CLUSTER_SET_LABEL)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

/// Merge patch moving the deployment's label to `target`, None when it already matches
fn label_patch(cd: &ClusterDeployment, target: Option<&str>) -> Option<Value> {
    let current = cd.labels().get(CLUSTER_SET_LABEL).map(String::as_str);
    if current == target {
        return None;
    }
    Some(json!({
        "metadata": {
            "labels": {
                CLUSTER_SET_LABEL: target,
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

    match sync_label(&cd, &ctx).await {
        Ok(action) => {
            ctx.backoff.reset(&object_key(cd.as_ref()));
            Ok(action)
        }
        Err(err) => {
            report_failure(&ctx.recorder, &ctx.metrics, cd.as_ref(), &err).await?;
            Err(err)
        }
    }
}

async fn sync_label(cd: &ClusterDeployment, ctx: &Context) -> Result<Action> {
    if cd.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let target = match label_source(cd) {
        LabelSource::Claimed => {
            debug!("ClusterDeployment {} is claimed, skipping", object_key(cd));
            return Ok(Action::await_change());
        }
        LabelSource::Pool { namespace, name } => {
            let pools: Api<ClusterPool> = Api::namespaced(ctx.client.clone(), namespace);
            match pools.get_opt(name).await? {
                Some(pool) => cluster_set_label(&pool).map(str::to_string),
                None => return Ok(Action::await_change()),
            }
        }
        LabelSource::Cluster { name } => {
            let clusters: Api<ManagedCluster> = Api::all(ctx.client.clone());
            match clusters.get_opt(name).await? {
                Some(cluster) => cluster.cluster_set().map(str::to_string),
                None => return Ok(Action::await_change()),
            }
        }
    };

    if let Some(patch) = label_patch(cd, target.as_deref()) {
        info!(
            "Setting cluster-set label of ClusterDeployment {} to {:?}",
            object_key(cd),
            target
        );
        let cds: Api<ClusterDeployment> =
            Api::namespaced(ctx.client.clone(), &cd.namespace().unwrap_or_default());
        cds.patch(&cd.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(Action::await_change())
}

fn error_policy(cd: Arc<ClusterDeployment>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(cd.as_ref()), error)
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let cds = Api::<ClusterDeployment>::all(client.clone());
    let pools = Api::<ClusterPool>::all(client.clone());
    let clusters = Api::<ManagedCluster>::all(client.clone());

    if let Err(e) = cds.list(&ListParams::default().limit(1)).await {
        error!("ClusterDeployment is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let pool_watcher = watcher(pools, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let cluster_watcher = metadata_watcher(clusters, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let controller = Controller::new(cds, Config::default());
    let cd_store = controller.store();

    controller
        .shutdown_on_signal()
        .watches_stream(pool_watcher, move |pool| {
            let namespace = pool.namespace().unwrap_or_default();
            let name = pool.name_any();
            cd_store
                .state()
                .into_iter()
                .filter(|cd| {
                    label_source(cd)
                        == LabelSource::Pool {
                            namespace: &namespace,
                            name: &name,
                        }
                })
                .map(|cd| ObjectRef::from_obj(cd.as_ref()))
                .collect::<Vec<_>>()
        })
        .watches_stream(cluster_watcher, |cluster| {
            let name = cluster.name_any();
            Some(ObjectRef::<ClusterDeployment>::new(&name).within(&name))
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
