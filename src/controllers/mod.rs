use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::core::object::HasStatus;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::cache::SubjectCache;
use crate::webhook::AdmissionStores;
use crate::{Error, Metrics, Result};

pub mod addoninstall;
pub mod baremetalasset;
pub mod certrotation;
pub mod clusterdeployment;
pub mod clusterrole;
pub mod clustersetrole;
pub mod clustersetsubjects;
pub mod deletionguard;
pub mod hostedannotation;

/// Field manager and event reporter name
pub const MANAGER: &str = "foundation-operator";

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Bumped whenever the cluster-set subject index changes
    pub subject_cache_generation: u64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            subject_cache_generation: 0,
        }
    }
}

/// Resolved command line configuration
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace and name of the rotated agent TLS secret
    pub cert_secret_namespace: String,
    pub cert_secret_name: String,
    /// The namespace the operator runs in
    pub pod_namespace: String,
    pub agent_image: String,
    pub agent_kubeconfig_secret: String,
    pub addon_install_namespace: String,
    pub cert_validity_days: i64,
    pub disable_addon_install: bool,
    /// Applied to the read and write timeouts of the kube client
    pub request_timeout: Duration,
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    pub settings: Arc<Settings>,
    /// Cluster-set subject index, written only by the subject mutator
    pub subject_cache: SubjectCache,
}

impl State {
    pub fn new(settings: Settings) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            settings: Arc::new(settings),
            subject_cache: SubjectCache::new(),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.diagnostics.read().await.clone();
        diagnostics.subject_cache_generation = self.subject_cache.generation();
        diagnostics
    }
}

async fn client(settings: &Settings) -> Result<Client> {
    let mut config = kube::Config::infer()
        .await
        .map_err(|e| Error::KubeError(kube::Error::InferConfig(e)))?;
    config.read_timeout = Some(settings.request_timeout);
    config.write_timeout = Some(settings.request_timeout);
    Ok(Client::try_from(config)?)
}

/// Start every controller and the admission stores, returns once all of them shut down
pub async fn run(state: State, admission: AdmissionStores) {
    let client = match client(&state.settings).await {
        Ok(client) => client,
        Err(e) => {
            error!("failed to create kube Client: {e:?}");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new().and_then(|m| m.register(&state.registry)) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("failed to register metrics: {e:?}");
            std::process::exit(1);
        }
    };

    let addons = {
        let (client, metrics, state) = (client.clone(), metrics.clone(), state.clone());
        async move {
            if state.settings.disable_addon_install {
                info!("Addon installation is disabled");
                return;
            }
            tokio::join!(
                addoninstall::run(client.clone(), metrics.clone(), state.clone()),
                hostedannotation::run(client, metrics, state),
            );
        }
    };

    tokio::join!(
        clusterrole::run(client.clone(), metrics.clone(), state.clone()),
        clustersetrole::run(client.clone(), metrics.clone(), state.clone()),
        clusterdeployment::run(client.clone(), metrics.clone(), state.clone()),
        clustersetsubjects::run(client.clone(), metrics.clone(), state.clone()),
        baremetalasset::run(client.clone(), metrics.clone(), state.clone()),
        deletionguard::run(client.clone(), metrics.clone(), state.clone()),
        certrotation::run(client.clone(), metrics.clone(), state.clone()),
        addons,
        admission.run(client),
    );
}

/// Key of an object in the per-key backoff table
pub(crate) fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{ns}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}

/// Warning event and failure count for a failed reconcile
pub(crate) async fn report_failure<K>(
    recorder: &Recorder,
    metrics: &Metrics,
    obj: &K,
    err: &Error,
) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    warn!("reconcile failed: {:?}", err);
    metrics.reconcile_failure(obj, err);
    recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(err.to_string()),
                action: "Reconcile".into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await?;
    Ok(())
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
pub(crate) fn ensure_deletion_change<K: Resource, E>(
    mut event: std::result::Result<kube::runtime::watcher::Event<K>, E>,
) -> std::result::Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

pub(crate) fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.meta().deletion_timestamp.is_some().hash(&mut hasher);
    obj.finalizers().hash(&mut hasher);
    Some(hasher.finish())
}

/// Cluster syncs carry everything interesting in status, which does not bump generation
pub(crate) fn status_predicate_serde<K: Resource + HasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        if let Ok(key) = serde_hashkey::to_key(s) {
            key.hash(&mut hasher);
        }
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::hive::{ClusterSync, ClusterSyncStatus, SyncStatus};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(generation: Option<i64>, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                namespace: Some("ns".into()),
                generation,
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn changed_predicate_tracks_generation_and_labels() {
        let a = config_map(Some(1), &[("a", "b")]);
        assert_eq!(changed_predicate(&a), changed_predicate(&a.clone()));
        assert_ne!(
            changed_predicate(&a),
            changed_predicate(&config_map(Some(2), &[("a", "b")]))
        );
        assert_ne!(
            changed_predicate(&a),
            changed_predicate(&config_map(Some(1), &[("a", "c")]))
        );
    }

    #[test]
    fn deletion_bumps_generation() {
        let event: std::result::Result<_, ()> = Ok(kube::runtime::watcher::Event::Delete(
            config_map(Some(3), &[]),
        ));
        match ensure_deletion_change(event) {
            Ok(kube::runtime::watcher::Event::Delete(cm)) => {
                assert_eq!(cm.metadata.generation, Some(4))
            }
            _ => panic!("expected a delete event"),
        }
    }

    #[test]
    fn status_predicate_sees_sync_results() {
        let mut sync = ClusterSync::new("c1", Default::default());
        let before = status_predicate_serde(&sync);
        sync.status = Some(ClusterSyncStatus {
            sync_sets: vec![SyncStatus {
                name: "asset".into(),
                observed_generation: 1,
                result: "Success".into(),
                failure_message: None,
            }],
            ..Default::default()
        });
        assert_ne!(before, status_predicate_serde(&sync));
    }

    #[test]
    fn object_keys() {
        assert_eq!(object_key(&config_map(None, &[])), "ns/cm");
    }
}
