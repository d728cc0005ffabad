//! In-memory index from cluster-set name (or `*`) to the subjects holding admin or view access
//! on it, derived from cluster-roles and cluster-role-bindings.
//!
//! Only the mutator task calls [`SubjectCache::rebuild`]. Everyone else reads immutable
//! snapshots through [`SubjectCache::get_map`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Subject};
use kube::ResourceExt;

use crate::rbac::{clustersets_in_rules, merge_subjects, Access};

pub const ALL_CLUSTER_SETS: &str = "*";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubjectIndex {
    pub admin: BTreeMap<String, Vec<Subject>>,
    pub view: BTreeMap<String, Vec<Subject>>,
}

impl SubjectIndex {
    /// Deterministic in its inputs: bindings are folded in name order whatever order they come in
    pub fn build<'a>(
        roles: impl IntoIterator<Item = &'a ClusterRole>,
        bindings: impl IntoIterator<Item = &'a ClusterRoleBinding>,
    ) -> Self {
        let roles: BTreeMap<String, &ClusterRole> =
            roles.into_iter().map(|r| (r.name_any(), r)).collect();
        let mut bindings: Vec<&ClusterRoleBinding> = bindings.into_iter().collect();
        bindings.sort_by_key(|b| b.name_any());

        let mut index = SubjectIndex::default();
        for binding in bindings {
            if binding.role_ref.kind != "ClusterRole" {
                continue;
            }
            let Some(role) = roles.get(&binding.role_ref.name) else {
                continue;
            };
            let subjects = binding.subjects.as_deref().unwrap_or_default();
            if subjects.is_empty() {
                continue;
            }
            let rules = role.rules.as_deref().unwrap_or_default();
            for access in Access::ALL {
                let map = index.subjects_mut(access);
                for set in clustersets_in_rules(rules, access) {
                    let entry = map.entry(set).or_default();
                    *entry = merge_subjects(entry, subjects);
                }
            }
        }
        index
    }

    pub fn subjects(&self, access: Access) -> &BTreeMap<String, Vec<Subject>> {
        match access {
            Access::Admin => &self.admin,
            Access::View => &self.view,
        }
    }

    fn subjects_mut(&mut self, access: Access) -> &mut BTreeMap<String, Vec<Subject>> {
        match access {
            Access::Admin => &mut self.admin,
            Access::View => &mut self.view,
        }
    }

    /// Union of B[s] over `sets`, followed by B[*] when `sets` is non-empty
    pub fn subjects_for_sets<'a>(
        &self,
        access: Access,
        sets: impl IntoIterator<Item = &'a str>,
    ) -> Vec<Subject> {
        let map = self.subjects(access);
        let mut subjects = Vec::new();
        let mut any = false;
        for set in sets {
            any = true;
            if let Some(found) = map.get(set) {
                subjects = merge_subjects(&subjects, found);
            }
        }
        if any {
            if let Some(all) = map.get(ALL_CLUSTER_SETS) {
                subjects = merge_subjects(&subjects, all);
            }
        }
        subjects
    }

    /// Whether the user, directly or through a group, holds admin access on `cluster_set`.
    /// An empty set name can only be handled by someone holding every set.
    pub fn can_bind(&self, user: &str, groups: &[String], cluster_set: &str) -> bool {
        let holds = |subjects: Option<&Vec<Subject>>| {
            subjects.into_iter().flatten().any(|s| match s.kind.as_str() {
                "User" => s.name == user,
                "Group" => groups.iter().any(|g| *g == s.name),
                "ServiceAccount" => {
                    let ns = s.namespace.as_deref().unwrap_or_default();
                    user == format!("system:serviceaccount:{ns}:{}", s.name)
                }
                _ => false,
            })
        };
        if holds(self.admin.get(ALL_CLUSTER_SETS)) {
            return true;
        }
        !cluster_set.is_empty() && holds(self.admin.get(cluster_set))
    }
}

#[derive(Default)]
struct Inner {
    index: Arc<SubjectIndex>,
    generation: u64,
    ready: bool,
}

/// Cloneable handle on the process-wide subject index
#[derive(Clone, Default)]
pub struct SubjectCache {
    inner: Arc<RwLock<Inner>>,
}

impl SubjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current index, never mutated after it is handed out
    pub fn get_map(&self) -> Arc<SubjectIndex> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .index
            .clone()
    }

    /// Recompute from a store snapshot and swap it in. Returns true when the index changed.
    pub fn rebuild<'a>(
        &self,
        roles: impl IntoIterator<Item = &'a ClusterRole>,
        bindings: impl IntoIterator<Item = &'a ClusterRoleBinding>,
    ) -> bool {
        // computed before taking the lock
        let index = SubjectIndex::build(roles, bindings);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.ready = true;
        if *inner.index == index {
            return false;
        }
        inner.index = Arc::new(index);
        inner.generation += 1;
        true
    }

    /// Bumped on every change of the index
    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// False until the first rebuild from the initial store contents
    pub fn is_ready(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{CLUSTER_API_GROUP, RBAC_API_GROUP};
    use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef};
    use kube::api::ObjectMeta;

    fn role(name: &str, verbs: &[&str], resources: &[&str], names: &[&str]) -> ClusterRole {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: strings(verbs),
                api_groups: Some(vec![CLUSTER_API_GROUP.into()]),
                resources: Some(strings(resources)),
                resource_names: Some(strings(names)),
                non_resource_urls: None,
            }]),
            aggregation_rule: None,
        }
    }

    fn subject(kind: &str, name: &str) -> Subject {
        Subject {
            kind: kind.into(),
            api_group: Some(RBAC_API_GROUP.into()),
            name: name.into(),
            namespace: None,
        }
    }

    fn binding(name: &str, role: &str, subjects: Vec<Subject>) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.into(),
                kind: "ClusterRole".into(),
                name: role.into(),
            },
            subjects: Some(subjects),
        }
    }

    #[test]
    fn bind_permission_maps_sets_to_subjects() {
        let roles = [role("r", &["create"], &["managedclustersets/bind"], &["s1", "s2"])];
        let bindings = [binding("b", "r", vec![subject("User", "u")])];
        let index = SubjectIndex::build(&roles, &bindings);
        assert_eq!(index.admin["s1"], vec![subject("User", "u")]);
        assert_eq!(index.admin["s2"], vec![subject("User", "u")]);
        assert!(!index.admin.contains_key("s3"));
        assert!(index.view.is_empty());
    }

    #[test]
    fn unknown_role_or_empty_subjects_contribute_nothing() {
        let roles = [role("r", &["create"], &["managedclustersets/bind"], &["s1"])];
        let bindings = [
            binding("a", "missing", vec![subject("User", "u")]),
            binding("b", "r", vec![]),
        ];
        assert_eq!(SubjectIndex::build(&roles, &bindings), SubjectIndex::default());
    }

    #[test]
    fn build_is_independent_of_input_order() {
        let roles = [
            role("r1", &["create"], &["managedclustersets/bind"], &["s1"]),
            role("r2", &["create"], &["managedclustersets/join"], &["s1"]),
        ];
        let b1 = binding("b1", "r1", vec![subject("User", "u1"), subject("Group", "g")]);
        let b2 = binding("b2", "r2", vec![subject("User", "u2"), subject("User", "u1")]);
        let forward = SubjectIndex::build(&roles, [&b1, &b2]);
        let backward = SubjectIndex::build(roles.iter().rev(), [&b2, &b1]);
        assert_eq!(forward, backward);
        assert_eq!(
            forward.admin["s1"],
            vec![subject("User", "u1"), subject("Group", "g"), subject("User", "u2")]
        );
    }

    #[test]
    fn wildcard_subjects_follow_membership() {
        let roles = [
            role("r1", &["create"], &["managedclustersets/bind"], &["s1"]),
            role("all", &["create"], &["managedclustersets/bind"], &["*"]),
        ];
        let bindings = [
            binding("b1", "r1", vec![subject("User", "u")]),
            binding("b2", "all", vec![subject("Group", "admins")]),
        ];
        let index = SubjectIndex::build(&roles, &bindings);
        assert_eq!(
            index.subjects_for_sets(Access::Admin, ["s1"]),
            vec![subject("User", "u"), subject("Group", "admins")]
        );
        assert_eq!(
            index.subjects_for_sets(Access::Admin, ["s2"]),
            vec![subject("Group", "admins")]
        );
        assert!(index
            .subjects_for_sets(Access::Admin, std::iter::empty())
            .is_empty());
    }

    #[test]
    fn can_bind_checks_users_groups_and_wildcard() {
        let roles = [
            role("r1", &["create"], &["managedclustersets/bind"], &["s1"]),
            role("all", &["create"], &["managedclustersets/bind"], &["*"]),
        ];
        let bindings = [
            binding("b1", "r1", vec![subject("User", "u"), subject("Group", "devs")]),
            binding("b2", "all", vec![subject("User", "root")]),
        ];
        let index = SubjectIndex::build(&roles, &bindings);
        assert!(index.can_bind("u", &[], "s1"));
        assert!(!index.can_bind("u", &[], "s2"));
        assert!(!index.can_bind("u", &[], ""));
        assert!(index.can_bind("someone", &["devs".into()], "s1"));
        assert!(index.can_bind("root", &[], "anything"));
        assert!(index.can_bind("root", &[], ""));
    }

    #[test]
    fn rebuild_reports_changes_only() {
        let cache = SubjectCache::new();
        assert!(!cache.is_ready());

        let roles = [role("r", &["create"], &["managedclustersets/bind"], &["s1"])];
        let bindings = [binding("b", "r", vec![subject("User", "u")])];
        assert!(cache.rebuild(&roles, &bindings));
        assert!(cache.is_ready());
        assert_eq!(cache.generation(), 1);

        let before = cache.get_map();
        assert!(!cache.rebuild(&roles, &bindings));
        assert_eq!(cache.generation(), 1);

        assert!(cache.rebuild(&roles, &[]));
        assert_eq!(cache.generation(), 2);
        // earlier snapshots are unaffected
        assert_eq!(before.admin["s1"], vec![subject("User", "u")]);
        assert!(cache.get_map().admin.is_empty());
    }
}
