//! Keeps the agent TLS secret present and well inside its validity window.
//!
//! Not a kube Controller: there is a single object to look after, so a watch on that one secret
//! is merged with a resync ticker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::*;

use crate::controllers::{Settings, State};
use crate::pki::{generate_client_bundle, invalid_reason, CertBundle};
use crate::{telemetry, Metrics, Result};

const RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const CA_KEY: &str = "ca.crt";
pub const CERT_KEY: &str = "tls.crt";
pub const PRIVATE_KEY_KEY: &str = "tls.key";

#[derive(Debug, PartialEq)]
enum Rotation {
    Create,
    Replace(String),
    Keep,
}

impl Rotation {
    fn metric_reason(&self) -> &'static str {
        match self {
            Rotation::Create => "missing",
            Rotation::Replace(_) => "invalid",
            Rotation::Keep => "valid",
        }
    }
}

fn decide(secret: Option<&Secret>, now: i64) -> Rotation {
    let Some(secret) = secret else {
        return Rotation::Create;
    };
    let data = secret.data.as_ref();
    let field = |key: &str| data.and_then(|d| d.get(key)).map(|b| b.0.as_slice());
    let (Some(ca), Some(cert), Some(_)) = (field(CA_KEY), field(CERT_KEY), field(PRIVATE_KEY_KEY)) else {
        return Rotation::Replace("secret is missing a key".into());
    };
    match invalid_reason(ca, cert, now) {
        Some(reason) => Rotation::Replace(reason),
        None => Rotation::Keep,
    }
}

fn secret_data(bundle: &CertBundle) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (CA_KEY.to_string(), ByteString(bundle.ca_pem.clone().into_bytes())),
        (CERT_KEY.to_string(), ByteString(bundle.cert_pem.clone().into_bytes())),
        (PRIVATE_KEY_KEY.to_string(), ByteString(bundle.key_pem.clone().into_bytes())),
    ])
}

fn tls_secret(settings: &Settings, bundle: &CertBundle) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(settings.cert_secret_name.clone()),
            namespace: Some(settings.cert_secret_namespace.clone()),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_string()),
        data: Some(secret_data(bundle)),
        ..Default::default()
    }
}

#[instrument(skip(api, settings, metrics), fields(trace_id))]
async fn rotate(api: &Api<Secret>, settings: &Settings, metrics: &Metrics) -> Result<()> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let name = &settings.cert_secret_name;
    let existing = api.get_opt(name).await?;
    let decision = decide(existing.as_ref(), Utc::now().timestamp());
    if decision == Rotation::Keep {
        debug!("TLS secret {} is valid", name);
        return Ok(());
    }

    let bundle = generate_client_bundle(settings.cert_validity_days)?;
    let desired = tls_secret(settings, &bundle);
    match (existing, &decision) {
        (Some(existing), Rotation::Replace(reason)) => {
            info!("Rotating TLS secret {}: {}", name, reason);
            if existing.type_.as_deref() == Some(TLS_SECRET_TYPE) {
                let mut replaced = existing;
                replaced.data = desired.data;
                replaced.string_data = None;
                api.replace(name, &PostParams::default(), &replaced).await?;
            } else {
                // type is immutable
                api.delete(name, &DeleteParams::default()).await?;
                api.create(&PostParams::default(), &desired).await?;
            }
        }
        _ => {
            info!("Creating TLS secret {}", name);
            api.create(&PostParams::default(), &desired).await?;
        }
    }
    metrics
        .cert_rotations
        .with_label_values(&[decision.metric_reason()])
        .inc();
    Ok(())
}

pub async fn run(client: Client, metrics: Metrics, state: State) {
    let settings = Arc::clone(&state.settings);
    let api: Api<Secret> = Api::namespaced(client, &settings.cert_secret_namespace);
    let config =
        watcher::Config::default().fields(&format!("metadata.name={}", settings.cert_secret_name));
    let events = watcher(api.clone(), config).default_backoff().touched_objects();
    tokio::pin!(events);

    let mut resync = tokio::time::interval(RESYNC_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.next() => {
                if event.is_none() {
                    break;
                }
            }
            _ = resync.tick() => {}
        }
        state.diagnostics.write().await.last_event = Utc::now();
        if let Err(e) = rotate(&api, &settings, &metrics).await {
            warn!("Failed to reconcile TLS secret {}: {e}", settings.cert_secret_name);
        }
    }
    info!("Certificate rotation stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            cert_secret_namespace: "open-cluster-management".into(),
            cert_secret_name: "ocm-klusterlet-self-signed-secrets".into(),
            pod_namespace: "open-cluster-management".into(),
            agent_image: "image".into(),
            agent_kubeconfig_secret: "kubeconfig".into(),
            addon_install_namespace: "open-cluster-management-agent-addon".into(),
            cert_validity_days: 365,
            disable_addon_install: false,
            request_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn missing_secret_is_created() {
        assert_eq!(decide(None, Utc::now().timestamp()), Rotation::Create);
    }

    #[test]
    fn fresh_secret_is_kept() {
        let bundle = generate_client_bundle(365).unwrap();
        let secret = tls_secret(&settings(), &bundle);
        assert_eq!(secret.type_.as_deref(), Some(TLS_SECRET_TYPE));
        assert_eq!(decide(Some(&secret), Utc::now().timestamp()), Rotation::Keep);
    }

    #[test]
    fn partial_or_garbled_secret_is_replaced() {
        let bundle = generate_client_bundle(365).unwrap();
        let mut secret = tls_secret(&settings(), &bundle);
        secret.data.as_mut().unwrap().remove(PRIVATE_KEY_KEY);
        assert!(matches!(
            decide(Some(&secret), Utc::now().timestamp()),
            Rotation::Replace(_)
        ));

        let mut secret = tls_secret(&settings(), &bundle);
        secret
            .data
            .as_mut()
            .unwrap()
            .insert(CERT_KEY.into(), ByteString(b"not a certificate".to_vec()));
        assert!(matches!(
            decide(Some(&secret), Utc::now().timestamp()),
            Rotation::Replace(_)
        ));
    }

    #[test]
    fn secret_from_another_ca_is_replaced() {
        let first = generate_client_bundle(365).unwrap();
        let bootstrap = crate::pki::generate_bootstrap_bundle("acm-agent", &[]).unwrap();
        let mut secret = tls_secret(&settings(), &first);
        secret
            .data
            .as_mut()
            .unwrap()
            .insert(CA_KEY.into(), ByteString(bootstrap.ca_pem.into_bytes()));
        assert!(matches!(
            decide(Some(&secret), Utc::now().timestamp()),
            Rotation::Replace(_)
        ));
    }

    #[test]
    fn secret_is_rotated_late_in_its_life() {
        let bundle = generate_client_bundle(10).unwrap();
        let secret = tls_secret(&settings(), &bundle);
        let nine_days = Utc::now().timestamp() + 9 * 24 * 3600;
        assert!(matches!(decide(Some(&secret), nine_days), Rotation::Replace(_)));
    }
}
