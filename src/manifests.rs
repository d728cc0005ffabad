//! The work-manager agent objects, embedded at compile time and expanded per cluster.

use std::collections::BTreeSet;

use minijinja::{context, Environment, UndefinedBehavior};
use serde_json::Value;

use crate::{Error, Result};

const TEMPLATES: [(&str, &str); 5] = [
    (
        "clusterrole.yaml",
        include_str!("../manifests/clusterrole.yaml"),
    ),
    (
        "clusterrolebinding.yaml",
        include_str!("../manifests/clusterrolebinding.yaml"),
    ),
    (
        "serviceaccount.yaml",
        include_str!("../manifests/serviceaccount.yaml"),
    ),
    ("service.yaml", include_str!("../manifests/service.yaml")),
    (
        "deployment.yaml",
        include_str!("../manifests/deployment.yaml"),
    ),
];

#[derive(Clone, Debug)]
pub struct AgentManifestParams {
    pub cluster_name: String,
    /// Where the agent runs, the install namespace of the addon
    pub namespace: String,
    pub image: String,
    pub kubeconfig_secret: String,
}

fn template_error(e: minijinja::Error) -> Error {
    Error::TemplateError(e.to_string())
}

fn identity(object: &Value) -> Option<(String, String, String, String)> {
    let field = |v: &Value| v.as_str().map(str::to_string);
    let metadata = object.get("metadata")?;
    Some((
        field(object.get("apiVersion")?)?,
        field(object.get("kind")?)?,
        metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        field(metadata.get("name")?)?,
    ))
}

/// Render the five agent objects for one cluster.
///
/// Fails unless every template expands with all four parameters defined and the result is
/// exactly five distinct objects.
pub fn agent_manifests(params: &AgentManifestParams) -> Result<Vec<Value>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    for (name, source) in TEMPLATES {
        env.add_template(name, source).map_err(template_error)?;
    }
    let ctx = context! {
        ClusterName => params.cluster_name,
        Namespace => params.namespace,
        Image => params.image,
        KubeConfigSecret => params.kubeconfig_secret,
    };

    let mut objects = Vec::with_capacity(TEMPLATES.len());
    let mut seen = BTreeSet::new();
    for (name, _) in TEMPLATES {
        let rendered = env
            .get_template(name)
            .and_then(|t| t.render(&ctx))
            .map_err(template_error)?;
        let object: Value = serde_yaml::from_str(&rendered)?;
        let Some(id) = identity(&object) else {
            return Err(Error::TemplateError(format!(
                "{name} does not describe a named object"
            )));
        };
        if !seen.insert(id) {
            return Err(Error::TemplateError(format!("{name} duplicates another object")));
        }
        objects.push(object);
    }
    if objects.len() != TEMPLATES.len() {
        return Err(Error::TemplateError(format!(
            "expected {} objects, got {}",
            TEMPLATES.len(),
            objects.len()
        )));
    }
    Ok(objects)
}
