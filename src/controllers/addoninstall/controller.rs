use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use crate::backoff::ErrorBackoff;
use crate::controllers::{
    changed_predicate, ensure_deletion_change, object_key, report_failure, Diagnostics, Settings,
    State, MANAGER,
};
use crate::finalizers::is_deleting;
use crate::manifests::{agent_manifests, AgentManifestParams};
use crate::resources::addons::{
    hosted_install_namespace, ManagedClusterAddOn, ManagedClusterAddOnSpec,
    ADDON_HOSTING_CLUSTER_ANNOTATION, DISABLE_AUTO_INSTALL_ANNOTATION,
    ENABLE_HOSTED_ADDONS_ANNOTATION, HOSTING_CLUSTER_INVALID, HOSTING_CLUSTER_VALID,
    HOSTING_CLUSTER_VALIDITY, KNOWN_ADDONS, WORK_MANAGER_ADDON,
};
use crate::resources::managedclusters::ManagedCluster;
use crate::resources::manifestworks::{
    ManifestWork, ManifestWorkSpec, ManifestsTemplate, WORK_CLUSTER_LABEL,
};
use crate::{telemetry, Error, Metrics, Result};

const DEPLOY_WORK_NAME: &str = "addon-work-manager-deploy";

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
    pub settings: Arc<Settings>,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, MANAGER.into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff: ErrorBackoff::default(),
            settings: state.settings.clone(),
        })
    }
}

/// Where the agent of a cluster runs
#[derive(Clone, Copy, Debug, PartialEq)]
enum Placement<'a> {
    /// On the managed cluster itself
    InCluster,
    /// On another managed cluster of the hub
    Hosted { hosting: &'a str },
}

fn annotation_is_true(cluster: &ManagedCluster, key: &str) -> bool {
    cluster
        .annotations()
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn placement(cluster: &ManagedCluster) -> Placement<'_> {
    match cluster.hosting_cluster() {
        Some(hosting) if annotation_is_true(cluster, ENABLE_HOSTED_ADDONS_ANNOTATION) => {
            Placement::Hosted { hosting }
        }
        _ => Placement::InCluster,
    }
}

fn auto_install_disabled(cluster: &ManagedCluster) -> bool {
    annotation_is_true(cluster, DISABLE_AUTO_INSTALL_ANNOTATION)
}

/// The work-manager addon record created for a cluster that has none
fn desired_addon(cluster: &str, placement: &Placement, default_namespace: &str) -> ManagedClusterAddOn {
    let (install_namespace, annotations) = match placement {
        Placement::InCluster => (default_namespace.to_string(), None),
        Placement::Hosted { hosting } => (
            hosted_install_namespace(cluster),
            Some(BTreeMap::from([(
                ADDON_HOSTING_CLUSTER_ANNOTATION.to_string(),
                hosting.to_string(),
            )])),
        ),
    };
    let mut addon = ManagedClusterAddOn::new(
        WORK_MANAGER_ADDON,
        ManagedClusterAddOnSpec {
            install_namespace: Some(install_namespace),
        },
    );
    addon.metadata.namespace = Some(cluster.to_string());
    addon.metadata.annotations = annotations;
    addon
}

/// Namespace and name of the work carrying the agent objects of `cluster`
fn work_location(cluster: &str, placement: &Placement) -> (String, String) {
    match placement {
        Placement::InCluster => (cluster.to_string(), DEPLOY_WORK_NAME.to_string()),
        Placement::Hosted { hosting } => (
            hosting.to_string(),
            format!("{DEPLOY_WORK_NAME}-hosting-{cluster}"),
        ),
    }
}

fn manifest_work(
    cluster: &str,
    (namespace, name): &(String, String),
    manifests: Vec<serde_json::Value>,
) -> ManifestWork {
    ManifestWork {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([(
                WORK_CLUSTER_LABEL.to_string(),
                cluster.to_string(),
            )])),
            ..Default::default()
        },
        ..ManifestWork::new(
            name,
            ManifestWorkSpec {
                workload: ManifestsTemplate { manifests },
            },
        )
    }
}

/// Whether the live work is missing, carries other manifests or lacks one of our labels
fn work_needs_apply(existing: Option<&ManifestWork>, desired: &ManifestWork) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    existing.spec.workload.manifests != desired.spec.workload.manifests
        || desired
            .labels()
            .iter()
            .any(|(k, v)| existing.labels().get(k) != Some(v))
}

/// The addon conditions with HostingClusterValidity set, None when nothing changes
fn with_validity(
    conditions: &[Condition],
    hosting: &str,
    valid: bool,
    generation: Option<i64>,
    now: &Time,
) -> Option<Vec<Condition>> {
    let (status, reason, message) = if valid {
        (
            "True",
            HOSTING_CLUSTER_VALID,
            format!("hosting cluster {hosting} is a managed cluster of the hub"),
        )
    } else {
        (
            "False",
            HOSTING_CLUSTER_INVALID,
            format!("hosting cluster {hosting} is not a managed cluster of the hub"),
        )
    };
    let mut updated = conditions.to_vec();
    match updated.iter_mut().find(|c| c.type_ == HOSTING_CLUSTER_VALIDITY) {
        Some(existing) => {
            if existing.status == status && existing.reason == reason && existing.message == message
            {
                return None;
            }
            if existing.status != status {
                existing.last_transition_time = now.clone();
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message;
            existing.observed_generation = generation;
        }
        None => updated.push(Condition {
            type_: HOSTING_CLUSTER_VALIDITY.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message,
            observed_generation: generation,
            last_transition_time: now.clone(),
        }),
    }
    Some(updated)
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedCluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    match install(&cluster, &ctx).await {
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

async fn install(cluster: &ManagedCluster, ctx: &Context) -> Result<()> {
    if is_deleting(cluster) {
        return Ok(());
    }
    let name = cluster.name_any();
    if auto_install_disabled(cluster) {
        debug!("Automatic addon installation is disabled on {}", name);
        return Ok(());
    }
    let placement = placement(cluster);
    let addons: Api<ManagedClusterAddOn> = Api::namespaced(ctx.client.clone(), &name);
    let addon = match addons.get_opt(WORK_MANAGER_ADDON).await? {
        Some(addon) => addon,
        None => {
            info!("Creating {} addon for {:?} cluster {}", WORK_MANAGER_ADDON, placement, name);
            let desired = desired_addon(&name, &placement, &ctx.settings.addon_install_namespace);
            addons.create(&PostParams::default(), &desired).await?
        }
    };

    if let Placement::Hosted { hosting } = placement {
        let clusters: Api<ManagedCluster> = Api::all(ctx.client.clone());
        let valid = clusters.get_opt(hosting).await?.is_some();
        let conditions = addon
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();
        let now = Time(Utc::now());
        if let Some(conditions) = with_validity(conditions, hosting, valid, addon.metadata.generation, &now)
        {
            let patch = json!({ "status": { "conditions": conditions } });
            addons
                .patch_status(WORK_MANAGER_ADDON, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        if !valid {
            warn!("Hosting cluster {} of {} is not managed by the hub", hosting, name);
            return Ok(());
        }
    }

    let install_namespace = addon
        .spec
        .install_namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| ctx.settings.addon_install_namespace.clone());
    let manifests = agent_manifests(&AgentManifestParams {
        cluster_name: name.clone(),
        namespace: install_namespace,
        image: ctx.settings.agent_image.clone(),
        kubeconfig_secret: ctx.settings.agent_kubeconfig_secret.clone(),
    })?;
    let location = work_location(&name, &placement);
    let work = manifest_work(&name, &location, manifests);
    let works: Api<ManifestWork> = Api::namespaced(ctx.client.clone(), &location.0);
    let existing = works.get_opt(&location.1).await?;
    if !work_needs_apply(existing.as_ref(), &work) {
        return Ok(());
    }
    info!("Applying agent work {}/{} for cluster {}", location.0, location.1, name);
    works
        .patch(&location.1, &PatchParams::apply(MANAGER).force(), &Patch::Apply(&work))
        .await?;
    Ok(())
}

fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(cluster.as_ref()), error)
}

fn cluster_of_addon(addon: &ManagedClusterAddOn) -> Option<ObjectRef<ManagedCluster>> {
    if !KNOWN_ADDONS.contains(&addon.name_any().as_str()) {
        return None;
    }
    addon.namespace().map(|ns| ObjectRef::new(&ns))
}

fn cluster_of_work(work: &ManifestWork) -> Option<ObjectRef<ManagedCluster>> {
    work.labels()
        .get(WORK_CLUSTER_LABEL)
        .filter(|c| !c.is_empty())
        .map(|c| ObjectRef::new(c))
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let clusters = Api::<ManagedCluster>::all(client.clone());
    let addons = Api::<ManagedClusterAddOn>::all(client.clone());
    let works = Api::<ManifestWork>::all(client.clone());

    if let Err(e) = addons.list(&ListParams::default().limit(1)).await {
        error!("ManagedClusterAddOn is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    if let Err(e) = works.list(&ListParams::default().limit(1)).await {
        error!("ManifestWork is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let addon_watcher = watcher(addons, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let work_watcher = watcher(works, Config::default().labels(WORK_CLUSTER_LABEL))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    Controller::new(clusters, Config::default())
        .shutdown_on_signal()
        .watches_stream(addon_watcher, |addon| cluster_of_addon(&addon))
        .watches_stream(work_watcher, |work| cluster_of_work(&work))
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
