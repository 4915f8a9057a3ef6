//! cloudflared tunnel config and deployment.

use super::naming::{
    ComponentKind, ResourceNaming, TUNNEL_CONFIG_NAME, TUNNEL_CREDENTIALS_DEFAULT,
    TUNNEL_DEPLOYMENT_NAME,
};
use super::resources::DesiredResource;
use crate::crds::{CloudflaredIngressRule, CloudflaredSpec, HonseFarmCluster};
use crate::tasks::config::TunnelConfig;
use crate::tasks::types::{Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

pub const TUNNEL_CONFIG_KEY: &str = "config.yaml";
const CREDENTIALS_FILE: &str = "/etc/cloudflared/creds/credentials.json";

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// `(service, namespace, port)` a rule points at, if it is complete
fn rule_backend<'a>(
    rule: &'a CloudflaredIngressRule,
    target_namespace: &'a str,
) -> Option<(String, &'a str, i32)> {
    if let Some(component) = non_empty(rule.component.as_ref()) {
        let kind = ComponentKind::parse(component)?;
        let shard = non_empty(rule.shard_name.as_ref());
        if kind == ComponentKind::ShardFileserver && shard.is_none() {
            return None;
        }
        return Some((
            ResourceNaming::service_name(kind, shard),
            target_namespace,
            kind.port(),
        ));
    }

    let service = non_empty(rule.service_name.as_ref())?;
    let namespace = non_empty(rule.service_namespace.as_ref())?;
    let port = rule.service_port.filter(|p| *p > 0)?;
    Some((service.to_string(), namespace, port))
}

/// Line-oriented cloudflared config. Special-service rules emit only their
/// service line; incomplete rules are skipped.
pub fn render_tunnel_config(spec: &CloudflaredSpec, target_namespace: &str) -> String {
    let mut lines = vec![
        format!("tunnel: {}", spec.tunnel_id.trim()),
        format!("credentials-file: {CREDENTIALS_FILE}"),
        "ingress:".to_string(),
    ];

    for rule in &spec.ingress {
        if let Some(special) = non_empty(rule.special_service.as_ref()) {
            lines.push(format!("  - service: {special}"));
            continue;
        }
        let Some(hostname) = non_empty(rule.hostname.as_ref()) else {
            debug!("Skipping tunnel ingress rule without a hostname");
            continue;
        };
        let Some((service, namespace, port)) = rule_backend(rule, target_namespace) else {
            debug!(hostname, "Skipping incomplete tunnel ingress rule");
            continue;
        };
        lines.push(format!("  - hostname: {hostname}"));
        lines.push(format!(
            "    service: http://{service}.{namespace}.svc.cluster.local:{port}"
        ));
    }

    lines.join("\n")
}

/// Tunnel ConfigMap and Deployment; empty when the tunnel is disabled
pub fn render_tunnel(
    cluster: &HonseFarmCluster,
    config: &TunnelConfig,
) -> Result<Vec<DesiredResource>> {
    let Some(spec) = cluster.spec.cloudflared.as_ref().filter(|c| c.enabled) else {
        return Ok(Vec::new());
    };
    if spec.tunnel_id.trim().is_empty() {
        return Err(Error::ConfigError(
            "spec.cloudflared.tunnelId must be set when the tunnel is enabled".into(),
        ));
    }

    let namespace = cluster.target_namespace();
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), TUNNEL_DEPLOYMENT_NAME.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    let config_map = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": TUNNEL_CONFIG_NAME,
            "namespace": namespace,
            "labels": labels
        },
        "data": { TUNNEL_CONFIG_KEY: render_tunnel_config(spec, namespace) }
    });

    let image = non_empty(spec.image.as_ref()).unwrap_or(config.default_image.as_str());
    let mut args = vec!["tunnel".to_string(), "run".to_string()];
    args.extend(spec.extra_args.iter().cloned());

    // Pods can only mount secrets from their own namespace
    let credentials = spec
        .credentials_secret_ref
        .as_ref()
        .and_then(|r| non_empty(Some(&r.name)))
        .unwrap_or(TUNNEL_CREDENTIALS_DEFAULT);

    let selector = json!({ "app": TUNNEL_DEPLOYMENT_NAME });
    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": TUNNEL_DEPLOYMENT_NAME,
            "namespace": namespace,
            "labels": labels
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": selector },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": TUNNEL_DEPLOYMENT_NAME,
                        "image": image,
                        "args": args,
                        "volumeMounts": [
                            { "name": "config", "mountPath": "/etc/cloudflared" },
                            { "name": "credentials", "mountPath": "/etc/cloudflared/creds", "readOnly": true }
                        ]
                    }],
                    "volumes": [
                        { "name": "config", "configMap": { "name": TUNNEL_CONFIG_NAME } },
                        { "name": "credentials", "secret": { "secretName": credentials } }
                    ]
                }
            }
        }
    });

    Ok(vec![
        DesiredResource::ConfigMap(serde_json::from_value(config_map)?),
        DesiredResource::Deployment(serde_json::from_value(deployment)?),
    ])
}
