//! Validating admission for cluster-set membership changes and hosting-cluster deletion.
//!
//! Decisions read a snapshot of the admin subject index plus reflector stores of managed
//! clusters and cluster-deployments. The endpoint refuses everything until the subject index
//! has been built from the initial role and binding lists.

use actix_web::{post, web::Data, web::Json, HttpResponse, Responder};
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::*;

use crate::cache::{SubjectCache, SubjectIndex};
use crate::rbac::CLUSTER_API_GROUP;
use crate::resources::hive::ClusterDeployment;
use crate::resources::managedclusters::{
    ManagedCluster, ManagedClusterSetSpec, CLUSTER_SET_LABEL, DEFAULT_CLUSTER_SET,
    GLOBAL_CLUSTER_SET, SELECTOR_TYPE_EXCLUSIVE,
};

const HIVE_GROUP: &str = "hive.openshift.io";

/// The identity a request is evaluated for
#[derive(Clone, Copy, Debug)]
pub struct Requester<'a> {
    pub user: &'a str,
    pub groups: &'a [String],
}

fn authorize(index: &SubjectIndex, who: Requester<'_>, cluster_set: &str) -> Result<(), String> {
    if index.can_bind(who.user, who.groups, cluster_set) {
        return Ok(());
    }
    if cluster_set.is_empty() {
        Err(format!(
            "user {:?} cannot add or remove the cluster-set label without permission on every ManagedClusterSet",
            who.user
        ))
    } else {
        Err(format!(
            "user {:?} cannot add/remove a resource to/from ManagedClusterSet {:?}",
            who.user, cluster_set
        ))
    }
}

fn authorize_move(
    index: &SubjectIndex,
    who: Requester<'_>,
    old: &str,
    new: &str,
) -> Result<(), String> {
    authorize(index, who, old)?;
    authorize(index, who, new)
}

/// Create of a managed cluster, deployment or pool carrying `label` (empty when unlabelled)
pub fn review_labelled_create(
    index: &SubjectIndex,
    who: Requester<'_>,
    label: &str,
) -> Result<(), String> {
    if label.is_empty() {
        return Ok(());
    }
    authorize(index, who, label)
}

/// Cluster-set label change on a managed cluster. `claimed` is true when the same-named
/// cluster-deployment came out of a pool.
pub fn review_cluster_label_change(
    index: &SubjectIndex,
    who: Requester<'_>,
    old: &str,
    new: &str,
    claimed: bool,
) -> Result<(), String> {
    if old == new {
        return Ok(());
    }
    if claimed {
        if old.is_empty() && new == DEFAULT_CLUSTER_SET {
            return Ok(());
        }
        return Err(format!(
            "the cluster-set label of a cluster claimed from a cluster pool cannot be changed from {old:?} to {new:?}"
        ));
    }
    authorize_move(index, who, old, new)
}

pub fn review_deployment_create(
    index: &SubjectIndex,
    who: Requester<'_>,
    label: &str,
    pool_referenced: bool,
) -> Result<(), String> {
    if pool_referenced {
        return Ok(());
    }
    review_labelled_create(index, who, label)
}

pub fn review_deployment_label_change(
    index: &SubjectIndex,
    who: Requester<'_>,
    old: &str,
    new: &str,
) -> Result<(), String> {
    if old == new {
        return Ok(());
    }
    authorize_move(index, who, old, new)
}

pub fn review_pool_label_change(old: &str, new: &str) -> Result<(), String> {
    if old == new {
        return Ok(());
    }
    Err("the cluster-set label of a ClusterPool cannot be changed".into())
}

/// A cluster cannot go away while hosted clusters still run their agents on it
pub fn review_cluster_deletion<'a>(
    name: &str,
    clusters: impl IntoIterator<Item = &'a ManagedCluster>,
) -> Result<(), String> {
    let mut hosted: Vec<String> = clusters
        .into_iter()
        .filter(|c| c.hosting_cluster() == Some(name))
        .map(|c| c.name_any())
        .collect();
    if hosted.is_empty() {
        return Ok(());
    }
    hosted.sort();
    Err(format!(
        "managed cluster {name:?} is the hosting cluster of {}, delete those first",
        hosted.join(", ")
    ))
}

pub fn review_cluster_set(name: &str, spec: &ManagedClusterSetSpec) -> Result<(), String> {
    if name == GLOBAL_CLUSTER_SET {
        if *spec == ManagedClusterSetSpec::global() {
            return Ok(());
        }
        return Err(format!(
            "the {GLOBAL_CLUSTER_SET:?} ManagedClusterSet must select every cluster with an empty label selector"
        ));
    }
    if spec.selector_type() != SELECTOR_TYPE_EXCLUSIVE {
        return Err(format!(
            "ManagedClusterSet {name:?} must use the {SELECTOR_TYPE_EXCLUSIVE} selector type"
        ));
    }
    Ok(())
}

fn cluster_set_label(obj: Option<&DynamicObject>) -> &str {
    obj.and_then(|o| o.labels().get(CLUSTER_SET_LABEL))
        .map(String::as_str)
        .unwrap_or_default()
}

fn pool_referenced(obj: Option<&DynamicObject>) -> bool {
    obj.and_then(|o| o.data.get("spec"))
        .and_then(|spec| spec.get("clusterPoolRef"))
        .is_some_and(|r| !r.is_null())
}

fn cluster_set_spec(obj: Option<&DynamicObject>) -> Result<ManagedClusterSetSpec, String> {
    match obj.and_then(|o| o.data.get("spec")) {
        None | Some(Value::Null) => Ok(ManagedClusterSetSpec::default()),
        Some(spec) => serde_json::from_value(spec.clone())
            .map_err(|e| format!("invalid ManagedClusterSet spec: {e}")),
    }
}

/// Cloneable handle used by the `/validate` endpoint
#[derive(Clone)]
pub struct Admission {
    cache: SubjectCache,
    clusters: Store<ManagedCluster>,
    deployments: Store<ClusterDeployment>,
}

/// Feeds the admission stores, driven alongside the controllers
pub struct AdmissionStores {
    clusters: reflector::store::Writer<ManagedCluster>,
    deployments: reflector::store::Writer<ClusterDeployment>,
}

impl Admission {
    pub fn new(cache: SubjectCache) -> (Admission, AdmissionStores) {
        let (clusters, cluster_writer) = reflector::store();
        let (deployments, deployment_writer) = reflector::store();
        (
            Admission {
                cache,
                clusters,
                deployments,
            },
            AdmissionStores {
                clusters: cluster_writer,
                deployments: deployment_writer,
            },
        )
    }

    fn claimed(&self, cluster: &str) -> bool {
        self.deployments
            .get(&ObjectRef::new(cluster).within(cluster))
            .and_then(|cd| cd.spec.cluster_pool_ref.clone())
            .is_some()
    }

    pub fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Result<(), String> {
        if !self.cache.is_ready() {
            return Err("the cluster-set subject cache is not synced yet, retry".into());
        }
        let index = self.cache.get_map();
        let groups = req.user_info.groups.clone().unwrap_or_default();
        let who = Requester {
            user: req.user_info.username.as_deref().unwrap_or_default(),
            groups: &groups,
        };
        let old = req.old_object.as_ref();
        let new = req.object.as_ref();

        match (req.kind.group.as_str(), req.kind.kind.as_str(), &req.operation) {
            (CLUSTER_API_GROUP, "ManagedCluster", Operation::Create) => {
                review_labelled_create(&index, who, cluster_set_label(new))
            }
            (CLUSTER_API_GROUP, "ManagedCluster", Operation::Update) => {
                review_cluster_label_change(
                    &index,
                    who,
                    cluster_set_label(old),
                    cluster_set_label(new),
                    self.claimed(&req.name),
                )
            }
            (CLUSTER_API_GROUP, "ManagedCluster", Operation::Delete) => {
                let clusters = self.clusters.state();
                review_cluster_deletion(&req.name, clusters.iter().map(|c| c.as_ref()))
            }
            (CLUSTER_API_GROUP, "ManagedClusterSet", Operation::Create | Operation::Update) => {
                review_cluster_set(&req.name, &cluster_set_spec(new)?)
            }
            (HIVE_GROUP, "ClusterDeployment", Operation::Create) => review_deployment_create(
                &index,
                who,
                cluster_set_label(new),
                pool_referenced(new),
            ),
            (HIVE_GROUP, "ClusterDeployment", Operation::Update) => {
                review_deployment_label_change(
                    &index,
                    who,
                    cluster_set_label(old),
                    cluster_set_label(new),
                )
            }
            (HIVE_GROUP, "ClusterPool", Operation::Create) => {
                review_labelled_create(&index, who, cluster_set_label(new))
            }
            (HIVE_GROUP, "ClusterPool", Operation::Update) => {
                review_pool_label_change(cluster_set_label(old), cluster_set_label(new))
            }
            _ => Ok(()),
        }
    }
}

impl AdmissionStores {
    /// Keep both stores in sync until shutdown
    pub async fn run(self, client: Client) {
        let clusters = reflector::reflector(
            self.clusters,
            watcher(Api::<ManagedCluster>::all(client.clone()), watcher::Config::default()),
        )
        .touched_objects()
        .default_backoff()
        .for_each(|_| futures::future::ready(()));
        let deployments = reflector::reflector(
            self.deployments,
            watcher(Api::<ClusterDeployment>::all(client), watcher::Config::default()),
        )
        .touched_objects()
        .default_backoff()
        .for_each(|_| futures::future::ready(()));

        tokio::select! {
            _ = futures::future::join(clusters, deployments) => {}
            _ = tokio::signal::ctrl_c() => {
                debug!("admission stores shutting down");
            }
        }
    }
}

#[post("/validate")]
pub async fn validate(
    admission: Data<Admission>,
    body: Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    let req: AdmissionRequest<DynamicObject> = match body.into_inner().try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return HttpResponse::Ok().json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match admission.review(&req) {
        Ok(()) => AdmissionResponse::from(&req),
        Err(reason) => {
            info!(
                uid = %req.uid,
                kind = %req.kind.kind,
                name = %req.name,
                "Denying request: {}", reason
            );
            AdmissionResponse::from(&req).deny(reason)
        }
    };
    HttpResponse::Ok().json(response.into_review())
}
