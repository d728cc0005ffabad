use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tracing::*;

pub use foundation_operator::{self, telemetry, Settings, State};
use foundation_operator::manifests::{agent_manifests, AgentManifestParams};
use foundation_operator::webhook::{self, Admission};
use foundation_operator::Error;

const IN_POD_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const FALLBACK_NAMESPACE: &str = "open-cluster-management";

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// `namespace/name` or bare `name` of the rotated agent TLS secret
    #[arg(long, env = "CERT_SECRET", default_value = "ocm-klusterlet-self-signed-secrets")]
    cert_secret: String,

    #[arg(long, env = "POD_NAMESPACE")]
    pod_namespace: Option<String>,

    #[arg(
        long,
        env = "AGENT_IMAGE",
        default_value = "quay.io/stolostron/multicloud-manager:latest"
    )]
    agent_image: String,

    #[arg(long, env = "AGENT_KUBECONFIG_SECRET", default_value = "work-manager-hub-kubeconfig")]
    agent_kubeconfig_secret: String,

    #[arg(
        long,
        env = "ADDON_INSTALL_NAMESPACE",
        default_value = "open-cluster-management-agent-addon"
    )]
    addon_install_namespace: String,

    #[arg(long, env = "CERT_VALIDITY_DAYS", default_value_t = 365)]
    cert_validity_days: i64,

    /// Skip installing the work-manager addon
    #[arg(long, env = "DISABLE_ADDON_INSTALL", default_value_t = false)]
    disable_addon_install: bool,

    /// Read and write timeout of every kube API call
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
}

fn pod_namespace(flag: Option<String>) -> String {
    flag.filter(|ns| !ns.is_empty())
        .or_else(|| {
            std::fs::read_to_string(IN_POD_NAMESPACE_FILE)
                .ok()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
        })
        .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string())
}

/// Split `namespace/name`, a bare name lives in `default_namespace`
fn cert_secret(value: &str, default_namespace: &str) -> Result<(String, String), Error> {
    match value.split('/').collect::<Vec<_>>()[..] {
        [name] if !name.is_empty() => Ok((default_namespace.to_string(), name.to_string())),
        [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(Error::InvalidCertSecret(value.to_string())),
    }
}

impl Arguments {
    fn settings(self) -> Result<Settings, Error> {
        let pod_namespace = pod_namespace(self.pod_namespace);
        let (cert_secret_namespace, cert_secret_name) =
            cert_secret(&self.cert_secret, &pod_namespace)?;
        Ok(Settings {
            cert_secret_namespace,
            cert_secret_name,
            pod_namespace,
            agent_image: self.agent_image,
            agent_kubeconfig_secret: self.agent_kubeconfig_secret,
            addon_install_namespace: self.addon_install_namespace,
            cert_validity_days: self.cert_validity_days,
            disable_addon_install: self.disable_addon_install,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;

    let args: Arguments = Arguments::parse();
    let settings = args.settings()?;

    // Fail fast on broken agent templates rather than on the first cluster
    agent_manifests(&AgentManifestParams {
        cluster_name: "startup-check".into(),
        namespace: settings.addon_install_namespace.clone(),
        image: settings.agent_image.clone(),
        kubeconfig_secret: settings.agent_kubeconfig_secret.clone(),
    })?;
    info!(
        "Starting with TLS secret {}/{}",
        settings.cert_secret_namespace, settings.cert_secret_name
    );

    // Initiatilize Kubernetes controller state
    let state = State::new(settings);
    let (admission, admission_stores) = Admission::new(state.subject_cache.clone());
    let controller = foundation_operator::run(state.clone(), admission_stores);
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .app_data(Data::new(admission.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
            .service(webhook::validate)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_secret_accepts_both_forms() {
        assert_eq!(
            cert_secret("ocm/signer", "pod-ns").unwrap(),
            ("ocm".to_string(), "signer".to_string())
        );
        assert_eq!(
            cert_secret("signer", "pod-ns").unwrap(),
            ("pod-ns".to_string(), "signer".to_string())
        );
        for bad in ["", "/signer", "ocm/", "a/b/c"] {
            assert!(matches!(
                cert_secret(bad, "pod-ns"),
                Err(Error::InvalidCertSecret(_))
            ));
        }
    }

    #[test]
    fn explicit_namespace_wins() {
        assert_eq!(pod_namespace(Some("hub".into())), "hub");
    }
}
