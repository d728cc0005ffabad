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
    apply_cluster_role, cluster_role, cluster_set_role_name, cluster_set_role_rules,
    delete_ignoring_not_found, parse_cluster_set_role_name, Access, CLUSTER_SET_ROLE_FINALIZER,
};
use crate::resources::managedclusters::ManagedClusterSet;
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

/// The admin and view roles every cluster-set gets
fn desired_roles(cluster_set: &str) -> Vec<ClusterRole> {
    Access::ALL
        .into_iter()
        .map(|access| {
            cluster_role(
                cluster_set_role_name(cluster_set, access),
                cluster_set_role_rules(cluster_set, access),
            )
        })
        .collect()
}

#[instrument(skip(ctx, set), fields(trace_id))]
async fn reconcile(set: Arc<ManagedClusterSet>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedClusterSet>();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let sets: Api<ManagedClusterSet> = Api::all(ctx.client.clone());

    info!("Reconciling roles of ManagedClusterSet \"{}\"", set.name_any());
    match finalizer(&sets, CLUSTER_SET_ROLE_FINALIZER, set.clone(), |event| async {
        match event {
            Finalizer::Apply(set) => apply_roles(&ctx, &set.name_any()).await,
            Finalizer::Cleanup(set) => delete_roles(&ctx, &set.name_any()).await,
        }
    })
    .await
    {
        Ok(action) => {
            ctx.backoff.reset(&object_key(set.as_ref()));
            Ok(action)
        }
        Err(err) => {
            let err = Error::FinalizerError(Box::new(err));
            report_failure(&ctx.recorder, &ctx.metrics, set.as_ref(), &err).await?;
            Err(err)
        }
    }
}

async fn apply_roles(ctx: &Context, cluster_set: &str) -> Result<Action> {
    let roles: Api<ClusterRole> = Api::all(ctx.client.clone());
    for required in desired_roles(cluster_set) {
        let name = required.name_any();
        let changed = retry_on_conflict(&name, || apply_cluster_role(&roles, required.clone())).await?;
        if changed {
            debug!("Applied ClusterRole {}", name);
        }
    }
    Ok(Action::await_change())
}

async fn delete_roles(ctx: &Context, cluster_set: &str) -> Result<Action> {
    let roles: Api<ClusterRole> = Api::all(ctx.client.clone());
    for access in Access::ALL {
        delete_ignoring_not_found(&roles, &cluster_set_role_name(cluster_set, access)).await?;
    }
    info!("Deleted roles of ManagedClusterSet \"{}\"", cluster_set);
    Ok(Action::await_change())
}

fn error_policy(set: Arc<ManagedClusterSet>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(set.as_ref()), error)
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let sets = Api::<ManagedClusterSet>::all(client.clone());
    let roles = Api::<ClusterRole>::all(client.clone());

    if let Err(e) = sets.list(&ListParams::default().limit(1)).await {
        error!("ManagedClusterSet is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let role_watcher = metadata_watcher(roles, Config::default())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    Controller::new(sets, Config::default())
        .shutdown_on_signal()
        .watches_stream(role_watcher, |role| -> Option<ObjectRef<ManagedClusterSet>> {
            let name = role.name_any();
            let (_, set) = parse_cluster_set_role_name(&name)?;
            Some(ObjectRef::new(set))
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::clustersets_in_rules;
    use std::collections::BTreeSet;

    #[test]
    fn every_set_gets_admin_and_view_roles() {
        let roles = desired_roles("s1");
        let names: Vec<_> = roles.iter().map(|r| r.name_any()).collect();
        assert_eq!(
            names,
            vec![
                "open-cluster-management:managedclusterset:admin:s1",
                "open-cluster-management:managedclusterset:view:s1",
            ]
        );
        assert_eq!(roles[0].rules.as_ref().unwrap().len(), 3);
        assert_eq!(roles[1].rules.as_ref().unwrap().len(), 1);
        assert_eq!(
            CLUSTER_SET_ROLE_FINALIZER,
            "open-cluster-management.io/managedclustersetrole"
        );
    }

    #[test]
    fn generated_roles_feed_the_subject_index() {
        let roles = desired_roles("s1");
        let only_s1 = BTreeSet::from(["s1".to_string()]);
        assert_eq!(
            clustersets_in_rules(roles[0].rules.as_ref().unwrap(), Access::Admin),
            only_s1
        );
        assert_eq!(
            clustersets_in_rules(roles[1].rules.as_ref().unwrap(), Access::View),
            only_s1
        );
    }
}
