//! Derived role names, rule templates and the subject algebra shared by the RBAC controllers
//! and the subject cache.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, RoleRef, Subject,
};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Resource;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::resources::managedclusters::CLUSTER_SET_LABEL;
use crate::{Error, Result};

pub const CLUSTER_API_GROUP: &str = "cluster.open-cluster-management.io";
pub const CLUSTER_VIEW_API_GROUP: &str = "clusterview.open-cluster-management.io";
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

pub static CLUSTER_ROLE_FINALIZER: &str = "open-cluster-management.io/managedclusterrole";
pub static CLUSTER_SET_ROLE_FINALIZER: &str = "open-cluster-management.io/managedclustersetrole";

const WILDCARD: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    Admin,
    View,
}

impl Access {
    pub const ALL: [Access; 2] = [Access::Admin, Access::View];

    pub fn as_str(self) -> &'static str {
        match self {
            Access::Admin => "admin",
            Access::View => "view",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn cluster_role_name(cluster: &str, access: Access) -> String {
    format!("open-cluster-management:managedcluster:{access}:{cluster}")
}

pub fn cluster_set_role_name(cluster_set: &str, access: Access) -> String {
    format!("open-cluster-management:managedclusterset:{access}:{cluster_set}")
}

/// Cluster-scoped binding granting the cluster-set subjects the member cluster's derived role
pub fn cluster_binding_name(cluster: &str, access: Access) -> String {
    format!("open-cluster-management:managedclusterset:{access}:managedcluster:{cluster}")
}

/// Binding in the member cluster namespace granting the built-in admin or view role
pub fn namespace_binding_name(access: Access) -> String {
    format!("open-cluster-management:managedclusterset:{access}")
}

static CLUSTER_BINDING_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^open-cluster-management:managedclusterset:(admin|view):managedcluster:(.+)$")
        .expect("static regex")
});

/// Inverse of [`cluster_binding_name`]
pub fn parse_cluster_binding_name(name: &str) -> Option<(Access, &str)> {
    let caps = CLUSTER_BINDING_NAME.captures(name)?;
    let access = match caps.get(1)?.as_str() {
        "admin" => Access::Admin,
        _ => Access::View,
    };
    Some((access, caps.get(2)?.as_str()))
}

fn split_access<'a>(name: &'a str, prefix: &str) -> Option<(Access, &'a str)> {
    let (access, target) = name.strip_prefix(prefix)?.split_once(':')?;
    let access = match access {
        "admin" => Access::Admin,
        "view" => Access::View,
        _ => return None,
    };
    Some((access, target)).filter(|(_, target)| !target.is_empty())
}

/// Inverse of [`cluster_role_name`]
pub fn parse_cluster_role_name(name: &str) -> Option<(Access, &str)> {
    split_access(name, "open-cluster-management:managedcluster:")
}

/// Inverse of [`cluster_set_role_name`]
pub fn parse_cluster_set_role_name(name: &str) -> Option<(Access, &str)> {
    split_access(name, "open-cluster-management:managedclusterset:")
}

/// Labels on every binding the subject propagator owns
pub fn propagated_binding_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_SET_LABEL.to_string(), "true".to_string())])
}

fn rule(verbs: &[&str], group: &str, resources: &[&str], names: &[&str]) -> PolicyRule {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        verbs: strings(verbs),
        api_groups: Some(vec![group.to_string()]),
        resources: Some(strings(resources)),
        resource_names: Some(strings(names)),
        non_resource_urls: None,
    }
}

const READ_VERBS: &[&str] = &["get", "list", "watch"];

pub fn cluster_role_rules(cluster: &str, access: Access) -> Vec<PolicyRule> {
    let verbs: &[&str] = match access {
        Access::Admin => &["create", "get", "list", "watch", "update", "patch", "delete"],
        Access::View => READ_VERBS,
    };
    vec![
        rule(verbs, CLUSTER_API_GROUP, &["managedclusters"], &[cluster]),
        rule(
            READ_VERBS,
            CLUSTER_VIEW_API_GROUP,
            &["managedclusters", "kubevirtprojects"],
            &[cluster],
        ),
    ]
}

pub fn cluster_set_role_rules(cluster_set: &str, access: Access) -> Vec<PolicyRule> {
    match access {
        Access::Admin => vec![
            rule(
                &["create", "update", "delete"],
                CLUSTER_API_GROUP,
                &["managedclustersets/bind"],
                &[cluster_set],
            ),
            rule(
                &["create"],
                CLUSTER_API_GROUP,
                &["managedclustersets/join"],
                &[cluster_set],
            ),
            rule(
                &["get", "list", "watch", "update", "patch", "delete"],
                CLUSTER_API_GROUP,
                &["managedclustersets"],
                &[cluster_set],
            ),
        ],
        Access::View => vec![rule(
            READ_VERBS,
            CLUSTER_API_GROUP,
            &["managedclustersets"],
            &[cluster_set],
        )],
    }
}

pub fn cluster_role(name: String, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(name),
            ..Default::default()
        },
        rules: Some(rules),
        aggregation_rule: None,
    }
}

fn contains(items: Option<&Vec<String>>, wanted: &str) -> bool {
    items.is_some_and(|items| items.iter().any(|i| i == wanted))
}

fn grants(rule: &PolicyRule, access: Access) -> bool {
    if !contains(rule.api_groups.as_ref(), CLUSTER_API_GROUP) {
        return false;
    }
    let resources = rule.resources.as_ref();
    let verbs = Some(&rule.verbs);
    match access {
        Access::Admin => {
            (contains(resources, "managedclustersets/bind")
                || contains(resources, "managedclustersets/join")
                || contains(resources, WILDCARD))
                && (contains(verbs, "create") || contains(verbs, WILDCARD))
        }
        Access::View => {
            (contains(resources, "managedclustersets") || contains(resources, WILDCARD))
                && (contains(verbs, "get") || contains(verbs, WILDCARD))
        }
    }
}

/// Cluster-set names a role's rules grant `access` on; `*` stands for every set.
///
/// A full wildcard rule grants everything. For admin, a resource name list is required; for
/// view an empty list means every set.
pub fn clustersets_in_rules(rules: &[PolicyRule], access: Access) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for rule in rules {
        if contains(rule.api_groups.as_ref(), WILDCARD)
            && contains(rule.resources.as_ref(), WILDCARD)
            && contains(Some(&rule.verbs), WILDCARD)
        {
            names.insert(WILDCARD.to_string());
        }
        if !grants(rule, access) {
            continue;
        }
        let resource_names = rule.resource_names.as_deref().unwrap_or_default();
        if resource_names.is_empty() && access == Access::View {
            return BTreeSet::from([WILDCARD.to_string()]);
        }
        for name in resource_names {
            if name == WILDCARD {
                return BTreeSet::from([WILDCARD.to_string()]);
            }
            names.insert(name.clone());
        }
    }
    names
}

type SubjectKey<'a> = (&'a str, Option<&'a str>, &'a str, Option<&'a str>);

fn subject_key(s: &Subject) -> SubjectKey<'_> {
    (
        s.kind.as_str(),
        s.api_group.as_deref().filter(|g| !g.is_empty()),
        s.name.as_str(),
        s.namespace.as_deref().filter(|n| !n.is_empty()),
    )
}

/// Order preserving union: `first` followed by the subjects of `second` it lacks
pub fn merge_subjects(first: &[Subject], second: &[Subject]) -> Vec<Subject> {
    let mut seen: BTreeSet<SubjectKey<'_>> = BTreeSet::new();
    let mut merged = Vec::with_capacity(first.len() + second.len());
    for s in first.iter().chain(second) {
        if seen.insert(subject_key(s)) {
            merged.push(s.clone());
        }
    }
    merged
}

/// Order independent equality
pub fn equal_subjects(a: &[Subject], b: &[Subject]) -> bool {
    let a: BTreeSet<_> = a.iter().map(subject_key).collect();
    let b: BTreeSet<_> = b.iter().map(subject_key).collect();
    a == b
}

fn cluster_role_ref(name: String) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name,
    }
}

pub fn required_cluster_role_binding(
    cluster: &str,
    access: Access,
    subjects: Vec<Subject>,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster_binding_name(cluster, access)),
            labels: Some(propagated_binding_labels()),
            ..Default::default()
        },
        role_ref: cluster_role_ref(cluster_role_name(cluster, access)),
        subjects: Some(subjects),
    }
}

pub fn required_role_binding(
    cluster: &str,
    access: Access,
    subjects: Vec<Subject>,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(namespace_binding_name(access)),
            namespace: Some(cluster.to_string()),
            labels: Some(propagated_binding_labels()),
            ..Default::default()
        },
        role_ref: cluster_role_ref(access.as_str().to_string()),
        subjects: Some(subjects),
    }
}

fn labels_missing(existing: &ObjectMeta, required: &ObjectMeta) -> bool {
    let have = existing.labels.as_ref();
    required
        .labels
        .iter()
        .flatten()
        .any(|(k, v)| have.and_then(|l| l.get(k)) != Some(v))
}

fn merge_labels(existing: &mut ObjectMeta, required: &ObjectMeta) {
    let labels = existing.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in required.labels.iter().flatten() {
        labels.insert(k.clone(), v.clone());
    }
}

/// Create the role, or replace it if its rules drifted. Returns true when a write was issued.
pub async fn apply_cluster_role(api: &Api<ClusterRole>, required: ClusterRole) -> Result<bool> {
    let name = required.metadata.name.clone().unwrap_or_default();
    match api.get_opt(&name).await? {
        None => {
            debug!("Creating ClusterRole {}", name);
            api.create(&PostParams::default(), &required).await?;
            Ok(true)
        }
        Some(mut existing) if existing.rules != required.rules => {
            debug!("Updating rules of ClusterRole {}", name);
            existing.rules = required.rules;
            api.replace(&name, &PostParams::default(), &existing).await?;
            Ok(true)
        }
        Some(_) => Ok(false),
    }
}

/// The parts of a ClusterRoleBinding or RoleBinding that get reconciled
pub trait Binding: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + fmt::Debug {
    fn role_ref(&self) -> &RoleRef;
    fn subjects(&self) -> &[Subject];
    fn set_subjects(&mut self, subjects: Option<Vec<Subject>>);
    fn take_subjects(&mut self) -> Option<Vec<Subject>>;
}

impl Binding for ClusterRoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }

    fn set_subjects(&mut self, subjects: Option<Vec<Subject>>) {
        self.subjects = subjects;
    }

    fn take_subjects(&mut self) -> Option<Vec<Subject>> {
        self.subjects.take()
    }
}

impl Binding for RoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }

    fn set_subjects(&mut self, subjects: Option<Vec<Subject>>) {
        self.subjects = subjects;
    }

    fn take_subjects(&mut self) -> Option<Vec<Subject>> {
        self.subjects.take()
    }
}

/// Does `existing` need rewriting to match `required`
fn binding_needs_update<K: Binding>(existing: &K, required: &K) -> bool {
    !equal_subjects(existing.subjects(), required.subjects())
        || existing.role_ref() != required.role_ref()
        || labels_missing(existing.meta(), required.meta())
}

/// Create the binding, or bring its subjects and labels in line. A changed roleRef is
/// immutable, so the binding is recreated. Returns true when a write was issued.
pub async fn apply_binding<K: Binding>(api: &Api<K>, mut required: K) -> Result<bool> {
    let name = required.meta().name.clone().unwrap_or_default();
    let kind = K::kind(&());
    let Some(mut existing) = api.get_opt(&name).await? else {
        debug!("Creating {} {}", kind, name);
        api.create(&PostParams::default(), &required).await?;
        return Ok(true);
    };
    if !binding_needs_update(&existing, &required) {
        return Ok(false);
    }
    if existing.role_ref() != required.role_ref() {
        delete_ignoring_not_found(api, &name).await?;
        api.create(&PostParams::default(), &required).await?;
        return Ok(true);
    }
    debug!("Updating {} {}", kind, name);
    merge_labels(existing.meta_mut(), required.meta());
    existing.set_subjects(required.take_subjects());
    api.replace(&name, &PostParams::default(), &existing).await?;
    Ok(true)
}

/// Delete by name, an object that is already gone counts as deleted
pub async fn delete_ignoring_not_found<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
        Err(err) => Err(Error::KubeError(err)),
        Ok(_) => Ok(()),
    }
}
