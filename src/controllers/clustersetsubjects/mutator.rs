//! Owner of the subject cache. Watches cluster-roles and cluster-role-bindings, rebuilds the
//! index in batches and tells the propagator when every cluster needs another look.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{stream, StreamExt};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding};
use kube::api::{Api, ListParams, ResourceExt};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::*;

use crate::cache::SubjectCache;
use crate::rbac::{
    delete_ignoring_not_found, namespace_binding_name, parse_cluster_binding_name, Access,
};
use crate::resources::managedclusters::{ManagedCluster, CLUSTER_SET_LABEL};
use crate::{Metrics, Result};

/// Changes arriving within one interval are folded into a single rebuild
const REBUILD_INTERVAL: Duration = Duration::from_millis(500);
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
enum Source {
    Roles,
    Bindings,
}

/// Readiness of both stores plus whether anything moved since the last rebuild
#[derive(Debug, Default)]
struct Tracker {
    roles_ready: bool,
    bindings_ready: bool,
    dirty: bool,
    notified: bool,
}

impl Tracker {
    fn observe(&mut self, source: Source, init_done: bool) {
        self.dirty = true;
        if init_done {
            match source {
                Source::Roles => self.roles_ready = true,
                Source::Bindings => self.bindings_ready = true,
            }
        }
    }

    /// Whether the batch tick should rebuild, clears the dirty flag when it does
    fn take_rebuild(&mut self) -> bool {
        if self.dirty && self.roles_ready && self.bindings_ready {
            self.dirty = false;
            return true;
        }
        false
    }

    /// Whether this rebuild result warrants waking the propagator
    fn should_notify(&mut self, changed: bool) -> bool {
        let first = !self.notified;
        self.notified = true;
        changed || first
    }
}

pub(super) async fn run(
    client: Client,
    cache: SubjectCache,
    metrics: Metrics,
    mut rebuilt: mpsc::Sender<()>,
) {
    let (role_store, role_writer) = reflector::store::<ClusterRole>();
    let (binding_store, binding_writer) = reflector::store::<ClusterRoleBinding>();

    let roles = reflector::reflector(
        role_writer,
        watcher(Api::<ClusterRole>::all(client.clone()), watcher::Config::default()).default_backoff(),
    )
    .map(|event| (Source::Roles, matches!(event, Ok(watcher::Event::InitDone))));
    let bindings = reflector::reflector(
        binding_writer,
        watcher(Api::<ClusterRoleBinding>::all(client.clone()), watcher::Config::default())
            .default_backoff(),
    )
    .map(|event| (Source::Bindings, matches!(event, Ok(watcher::Event::InitDone))));
    let changes = stream::select(roles, bindings);
    tokio::pin!(changes);

    let mut tracker = Tracker::default();
    let mut batch = tokio::time::interval(REBUILD_INTERVAL);
    let mut sweep = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.next() => match change {
                Some((source, init_done)) => tracker.observe(source, init_done),
                None => break,
            },
            _ = batch.tick() => {
                if !tracker.take_rebuild() {
                    continue;
                }
                let changed = rebuild(&cache, &role_store, &binding_store);
                if changed {
                    metrics.subject_cache_rebuilds.inc();
                    debug!("Subject index rebuilt, generation {}", cache.generation());
                }
                // a full channel already holds a pending trigger
                if tracker.should_notify(changed) && rebuilt.try_send(()).is_err() {
                    trace!("Propagation already pending");
                }
            },
            _ = sweep.tick() => {
                if !cache.is_ready() {
                    continue;
                }
                if let Err(e) = sweep_orphans(&client).await {
                    warn!("Failed to clean up orphaned cluster-set bindings: {e}");
                }
            },
        }
    }
    info!("Subject cache mutator stopped");
}

fn rebuild(
    cache: &SubjectCache,
    roles: &Store<ClusterRole>,
    bindings: &Store<ClusterRoleBinding>,
) -> bool {
    let roles = roles.state();
    let bindings = bindings.state();
    cache.rebuild(
        roles.iter().map(|r| r.as_ref()),
        bindings.iter().map(|b| b.as_ref()),
    )
}

/// Labelled cluster-role-bindings whose managed cluster is gone
fn orphaned_cluster_bindings<'a>(
    clusters: &BTreeSet<String>,
    names: impl IntoIterator<Item = &'a str>,
) -> Vec<&'a str> {
    names
        .into_iter()
        .filter(|name| {
            parse_cluster_binding_name(name).is_some_and(|(_, cluster)| !clusters.contains(cluster))
        })
        .collect()
}

/// Labelled role-bindings, as (namespace, name), left in a namespace with no managed cluster
fn orphaned_role_bindings<'a>(
    clusters: &BTreeSet<String>,
    bindings: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<(&'a str, &'a str)> {
    let owned: Vec<String> = Access::ALL.into_iter().map(namespace_binding_name).collect();
    bindings
        .into_iter()
        .filter(|(namespace, name)| {
            !clusters.contains(*namespace) && owned.iter().any(|o| o == name)
        })
        .collect()
}

async fn sweep_orphans(client: &Client) -> Result<()> {
    let owned = ListParams::default().labels(&format!("{CLUSTER_SET_LABEL}=true"));
    let clusters: BTreeSet<String> = Api::<ManagedCluster>::all(client.clone())
        .list_metadata(&ListParams::default())
        .await?
        .items
        .iter()
        .map(|c| c.name_any())
        .collect();

    let crbs = Api::<ClusterRoleBinding>::all(client.clone());
    let crb_names: Vec<String> = crbs
        .list_metadata(&owned)
        .await?
        .items
        .iter()
        .map(|b| b.name_any())
        .collect();
    for name in orphaned_cluster_bindings(&clusters, crb_names.iter().map(String::as_str)) {
        info!("Deleting orphaned ClusterRoleBinding {}", name);
        delete_ignoring_not_found(&crbs, name).await?;
    }

    let rb_keys: Vec<(String, String)> = Api::<RoleBinding>::all(client.clone())
        .list_metadata(&owned)
        .await?
        .items
        .iter()
        .map(|b| (b.namespace().unwrap_or_default(), b.name_any()))
        .collect();
    let keys = rb_keys.iter().map(|(ns, name)| (ns.as_str(), name.as_str()));
    for (namespace, name) in orphaned_role_bindings(&clusters, keys) {
        info!("Deleting orphaned RoleBinding {}/{}", namespace, name);
        let rbs: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
        delete_ignoring_not_found(&rbs, name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::cluster_binding_name;

    #[test]
    fn rebuild_waits_for_both_stores() {
        let mut tracker = Tracker::default();
        tracker.observe(Source::Roles, false);
        tracker.observe(Source::Roles, true);
        assert!(!tracker.take_rebuild());
        tracker.observe(Source::Bindings, true);
        assert!(tracker.take_rebuild());
        // nothing moved since
        assert!(!tracker.take_rebuild());
        tracker.observe(Source::Bindings, false);
        assert!(tracker.take_rebuild());
    }

    #[test]
    fn first_rebuild_always_notifies() {
        let mut tracker = Tracker::default();
        assert!(tracker.should_notify(false));
        assert!(!tracker.should_notify(false));
        assert!(tracker.should_notify(true));
    }

    #[test]
    fn bindings_of_deleted_clusters_are_orphans() {
        let clusters = BTreeSet::from(["c1".to_string()]);
        let live = cluster_binding_name("c1", Access::Admin);
        let gone = cluster_binding_name("c2", Access::View);
        let names = [live.as_str(), gone.as_str(), "unrelated"];
        assert_eq!(orphaned_cluster_bindings(&clusters, names), vec![gone.as_str()]);
    }

    #[test]
    fn role_bindings_outside_cluster_namespaces_are_orphans() {
        let clusters = BTreeSet::from(["c1".to_string()]);
        let admin = namespace_binding_name(Access::Admin);
        let view = namespace_binding_name(Access::View);
        let bindings = [
            ("c1", admin.as_str()),
            ("c2", view.as_str()),
            ("c2", "someone-elses"),
        ];
        assert_eq!(
            orphaned_role_bindings(&clusters, bindings),
            vec![("c2", view.as_str())]
        );
    }
}
