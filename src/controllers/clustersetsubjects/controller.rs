use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, Subject};
use kube::core::{Selector, SelectorExt};
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
};
use tokio::sync::RwLock;
use tracing::*;

use super::mutator;
use crate::backoff::{retry_on_conflict, ErrorBackoff};
use crate::cache::{SubjectCache, SubjectIndex};
use crate::controllers::{
    changed_predicate, ensure_deletion_change, object_key, report_failure, Diagnostics, State,
    MANAGER,
};
use crate::rbac::{
    apply_binding, cluster_binding_name, delete_ignoring_not_found, namespace_binding_name,
    parse_cluster_binding_name, required_cluster_role_binding, required_role_binding, Access,
};
use crate::resources::managedclusters::{ManagedCluster, ManagedClusterSet, CLUSTER_SET_LABEL};
use crate::{telemetry, Error, Metrics, Result};

/// Requeue while the subject index has not been built yet
const CACHE_NOT_READY_REQUEUE: Duration = Duration::from_secs(1);

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
    pub cache: SubjectCache,
    // Store for cluster sets, needed to resolve label selector membership
    pub set_store: Store<ManagedClusterSet>,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: State,
        set_store: Store<ManagedClusterSet>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, MANAGER.into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff: ErrorBackoff::default(),
            cache: state.subject_cache.clone(),
            set_store,
        })
    }
}

/// Every set the cluster belongs to: the one its label names, plus each label selector set
/// whose selector matches it
pub(super) fn member_sets<'a>(
    cluster: &ManagedCluster,
    sets: impl IntoIterator<Item = &'a ManagedClusterSet>,
) -> BTreeSet<String> {
    let mut members = BTreeSet::new();
    if let Some(set) = cluster.cluster_set() {
        members.insert(set.to_string());
    }
    for set in sets {
        if set.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(selector) = set.spec.label_selector() else {
            continue;
        };
        match Selector::try_from(selector.clone()) {
            Ok(selector) if selector.matches(cluster.labels()) => {
                members.insert(set.name_any());
            }
            Ok(_) => {}
            Err(e) => warn!("ManagedClusterSet {} has an invalid selector: {e}", set.name_any()),
        }
    }
    members
}

/// Subjects to bind per access level. A deleting cluster gets none.
pub(super) fn target_subjects<'a>(
    index: &SubjectIndex,
    cluster: &ManagedCluster,
    sets: impl IntoIterator<Item = &'a ManagedClusterSet>,
) -> [(Access, Vec<Subject>); 2] {
    let members = if cluster.metadata.deletion_timestamp.is_some() {
        BTreeSet::new()
    } else {
        member_sets(cluster, sets)
    };
    Access::ALL.map(|access| {
        (
            access,
            index.subjects_for_sets(access, members.iter().map(String::as_str)),
        )
    })
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
async fn reconcile(cluster: Arc<ManagedCluster>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    if !ctx.cache.is_ready() {
        debug!("Subject cache not ready, postponing {}", cluster.name_any());
        return Ok(Action::requeue(CACHE_NOT_READY_REQUEUE));
    }
    // selector membership is unknown until the sets are listed
    if ctx.set_store.wait_until_ready().await.is_err() {
        return Ok(Action::requeue(CACHE_NOT_READY_REQUEUE));
    }
    let _timer = ctx.metrics.count_and_measure::<ManagedCluster>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    match sync_bindings(&cluster, &ctx).await {
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

async fn sync_bindings(cluster: &ManagedCluster, ctx: &Context) -> Result<()> {
    let name = cluster.name_any();
    let index = ctx.cache.get_map();
    let sets = ctx.set_store.state();
    let targets = target_subjects(&index, cluster, sets.iter().map(|s| s.as_ref()));

    let crbs: Api<ClusterRoleBinding> = Api::all(ctx.client.clone());
    let rbs: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), &name);

    let mut errors = Vec::new();
    for (access, subjects) in targets {
        if subjects.is_empty() {
            if let Err(e) = delete_ignoring_not_found(&crbs, &cluster_binding_name(&name, access)).await {
                errors.push(e);
            }
            if let Err(e) = delete_ignoring_not_found(&rbs, &namespace_binding_name(access)).await {
                errors.push(e);
            }
            continue;
        }

        let required = required_cluster_role_binding(&name, access, subjects.clone());
        if let Err(e) = retry_on_conflict(&cluster_binding_name(&name, access), || {
            apply_binding(&crbs, required.clone())
        })
        .await
        {
            errors.push(e);
        }

        let required = required_role_binding(&name, access, subjects);
        match retry_on_conflict(&namespace_binding_name(access), || {
            apply_binding(&rbs, required.clone())
        })
        .await
        {
            // the cluster namespace shows up once the cluster is accepted
            Err(e) if e.is_not_found() => {
                debug!("Namespace {} does not exist yet, skipping RoleBinding", name)
            }
            Err(e) => errors.push(e),
            Ok(_) => {}
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Aggregate(errors)),
    }
}

fn error_policy(cluster: Arc<ManagedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.requeue(&object_key(cluster.as_ref()), error)
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let clusters = Api::<ManagedCluster>::all(client.clone());
    let sets = Api::<ManagedClusterSet>::all(client.clone());
    let crbs = Api::<ClusterRoleBinding>::all(client.clone());
    let rbs = Api::<RoleBinding>::all(client.clone());

    if let Err(e) = sets.list(&ListParams::default().limit(1)).await {
        error!("ManagedClusterSet is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // only the bindings this controller owns
    let owned = Config::default().labels(&format!("{CLUSTER_SET_LABEL}=true"));

    let (set_store, set_writer) = reflector::store();
    let set_reflector = reflector::reflector(set_writer, watcher(sets, Config::default()).default_backoff())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let crb_watcher = metadata_watcher(crbs, owned.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let rb_watcher = metadata_watcher(rbs, owned)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let (rebuilt_tx, rebuilt_rx) = mpsc::channel::<()>(1);

    let controller = Controller::new(clusters, Config::default());
    let cluster_store = controller.store();

    let controller = controller
        .shutdown_on_signal()
        .watches_stream(set_reflector, move |_set| {
            cluster_store
                .state()
                .iter()
                .map(|c| ObjectRef::from_obj(c.as_ref()))
                .collect::<Vec<_>>()
        })
        .watches_stream(crb_watcher, |crb| -> Option<ObjectRef<ManagedCluster>> {
            let name = crb.name_any();
            let (_, cluster) = parse_cluster_binding_name(&name)?;
            Some(ObjectRef::new(cluster))
        })
        .watches_stream(rb_watcher, |rb| -> Option<ObjectRef<ManagedCluster>> {
            let namespace = rb.namespace()?;
            let name = rb.name_any();
            Access::ALL
                .iter()
                .any(|access| namespace_binding_name(*access) == name)
                .then(|| ObjectRef::new(&namespace))
        })
        .reconcile_all_on(rebuilt_rx)
        .run(
            reconcile,
            error_policy,
            Context::new(client.clone(), metrics.clone(), state.clone(), set_store),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::join!(
        controller,
        mutator::run(client, state.subject_cache.clone(), metrics, rebuilt_tx),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{CLUSTER_API_GROUP, RBAC_API_GROUP};
    use crate::resources::managedclusters::{
        ManagedClusterSelector, ManagedClusterSetSpec, SELECTOR_TYPE_LABEL_SELECTOR,
    };
    use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule, RoleRef};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cluster(labels: &[(&str, &str)]) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("c1".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    fn selector_set(name: &str, match_labels: Option<&[(&str, &str)]>) -> ManagedClusterSet {
        let label_selector = LabelSelector {
            match_labels: match_labels.map(|l| {
                l.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>()
            }),
            match_expressions: None,
        };
        ManagedClusterSet::new(
            name,
            ManagedClusterSetSpec {
                cluster_selector: Some(ManagedClusterSelector {
                    selector_type: Some(SELECTOR_TYPE_LABEL_SELECTOR.into()),
                    label_selector: Some(label_selector),
                }),
            },
        )
    }

    fn user(name: &str) -> Subject {
        Subject {
            kind: "User".into(),
            api_group: Some(RBAC_API_GROUP.into()),
            name: name.into(),
            namespace: None,
        }
    }

    fn index() -> SubjectIndex {
        let role = |name: &str, verbs: &[&str], resource: &str, set: &str| ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: verbs.iter().map(|v| v.to_string()).collect(),
                api_groups: Some(vec![CLUSTER_API_GROUP.into()]),
                resources: Some(vec![resource.into()]),
                resource_names: Some(vec![set.into()]),
                non_resource_urls: None,
            }]),
            aggregation_rule: None,
        };
        let binding = |name: &str, role: &str, subject: &str| ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.into(),
                kind: "ClusterRole".into(),
                name: role.into(),
            },
            subjects: Some(vec![user(subject)]),
        };
        SubjectIndex::build(
            &[
                role("s1-admin", &["create"], "managedclustersets/bind", "s1"),
                role("s1-view", &["get"], "managedclustersets", "s1"),
                role("all-admin", &["create"], "managedclustersets/bind", "*"),
            ],
            &[
                binding("b1", "s1-admin", "alice"),
                binding("b2", "s1-view", "victor"),
                binding("b3", "all-admin", "root"),
            ],
        )
    }

    #[test]
    fn membership_from_label_and_selectors() {
        let c = cluster(&[(CLUSTER_SET_LABEL, "s1"), ("env", "prod")]);
        let sets = [
            selector_set("global", None),
            selector_set("prod", Some(&[("env", "prod")])),
            selector_set("dev", Some(&[("env", "dev")])),
            ManagedClusterSet::new("s2", ManagedClusterSetSpec::default()),
        ];
        assert_eq!(
            member_sets(&c, &sets),
            BTreeSet::from(["global".to_string(), "prod".to_string(), "s1".to_string()])
        );
    }

    #[test]
    fn deleting_sets_do_not_select() {
        let mut global = selector_set("global", None);
        global.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        assert!(member_sets(&cluster(&[]), [&global]).is_empty());
    }

    #[test]
    fn fan_out_per_access_level() {
        let index = index();
        let c = cluster(&[(CLUSTER_SET_LABEL, "s1")]);
        let [(admin, admins), (view, viewers)] = target_subjects(&index, &c, []);
        assert_eq!(admin, Access::Admin);
        assert_eq!(admins, vec![user("alice"), user("root")]);
        assert_eq!(view, Access::View);
        assert_eq!(viewers, vec![user("victor")]);
    }

    #[test]
    fn unlabelled_cluster_gets_nothing() {
        let index = index();
        let [(_, admins), (_, viewers)] = target_subjects(&index, &cluster(&[]), []);
        assert!(admins.is_empty());
        assert!(viewers.is_empty());
    }

    #[test]
    fn deleting_cluster_gets_nothing() {
        let index = index();
        let mut c = cluster(&[(CLUSTER_SET_LABEL, "s1")]);
        c.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        let [(_, admins), (_, viewers)] = target_subjects(&index, &c, []);
        assert!(admins.is_empty() && viewers.is_empty());
    }
}
