use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{metadata_watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
};
use tokio::sync::RwLock;
use tracing::*;

use crate::backoff::{retry_on_conflict, ErrorBackoff};
use crate::controllers::{
    changed_predicate, ensure_deletion_change, object_key, report_failure, Diagnostics, State,
    MANAGER,
};
use crate::rbac::{
    apply_cluster_role, cluster_role, cluster_role_name, cluster_role_rules,
    delete_ignoring_not_found, parse_cluster_role_name, Access, CLUSTER_ROLE_FINALIZER,
};
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

/// The admin and view roles every managed cluster gets
fn desired_roles(cluster: &str) -> Vec<ClusterRole> {
    Access::ALL
        .into_iter()
        .map(|access| {
            cluster_role(
                cluster_role_name(cluster, access),
                cluster_role_rules(cluster, access),
            )
        })
        .collect()
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedCluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let clusters: Api<ManagedCluster> = Api::all(ctx.client.clone());

    info!("Reconciling roles of ManagedCluster \"{}\"", cluster.name_any());
    match finalizer(&clusters, CLUSTER_ROLE_FINALIZER, cluster.clone(), |event| async {
        match event {
            Finalizer::Apply(cluster) => apply_roles(&ctx, &cluster.name_any()).await,
            Finalizer::Cleanup(cluster) => delete_roles(&ctx, &cluster.name_any()).await,
        }
    })
    .await
    {
        Ok(action) => {
            ctx.backoff.reset(&object_key(cluster.as_ref()));
            Ok(action)
        }
        Err(err) => {
            let err = Error::FinalizerError(Box::new(err));
            report_failure(&ctx.recorder, &ctx.metrics, cluster.as_ref(), &err).await?;
            Err(err)
        }
    }
}

async fn apply_roles(ctx: &Context, cluster: &str) -> Result<Action> {
    let roles: Api<ClusterRole> = Api::all(ctx.client.clone());
    for required in desired_roles(cluster) {
        let name = required.name_any();
        let changed = retry_on_conflict(&name, || apply_cluster_role(&roles, required.clone())).await?;
        if changed {
            debug!("Applied ClusterRole {}", name);
        }
    }
    Ok(Action::await_change())
}

// Finalizer cleanup, the derived roles go with the cluster
async fn delete_roles(ctx: &Context, cluster: &str) -> Result<Action> {
    let roles: Api<ClusterRole> = Api::all(ctx.client.clone());
    for access in Access::ALL {
        delete_ignoring_not_found(&roles, &cluster_role_name(cluster, access)).await?;
    }
    info!("Deleted roles of ManagedCluster \"{}\"", cluster);
    Ok(Action::await_change())
}

fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(cluster.as_ref()), error)
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let clusters = Api::<ManagedCluster>::all(client.clone());
    let roles = Api::<ClusterRole>::all(client.clone());

    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("ManagedCluster is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // a derived role deleted or edited by hand is put back
    let role_watcher = metadata_watcher(roles, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    Controller::new(clusters, Config::default())
        .shutdown_on_signal()
        .watches_stream(role_watcher, |role| -> Option<ObjectRef<ManagedCluster>> {
            let name = role.name_any();
            let (_, cluster) = parse_cluster_role_name(&name)?;
            Some(ObjectRef::new(cluster))
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cluster_gets_admin_and_view_roles() {
        let roles = desired_roles("cluster1");
        let names: Vec<_> = roles.iter().map(|r| r.name_any()).collect();
        assert_eq!(
            names,
            vec![
                "open-cluster-management:managedcluster:admin:cluster1",
                "open-cluster-management:managedcluster:view:cluster1",
            ]
        );
        let admin = roles[0].rules.as_ref().unwrap();
        assert_eq!(admin[0].verbs.len(), 7);
        assert_eq!(admin[0].resource_names, Some(vec!["cluster1".to_string()]));
        assert_eq!(CLUSTER_ROLE_FINALIZER, "open-cluster-management.io/managedclusterrole");
    }

    #[test]
    fn derived_roles_map_back_to_their_cluster() {
        for role in desired_roles("c2") {
            assert_eq!(
                parse_cluster_role_name(&role.name_any()).map(|(_, c)| c.to_string()),
                Some("c2".to_string())
            );
        }
    }
}
