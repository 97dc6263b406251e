use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_LEASE_NAME: &str = "frp-lb-controller-manager";
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/gofrp/frp-lb:latest";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElection {
    pub enabled: bool,
    pub lease_name: String,
    /// Falls back to the pod namespace, then `default`.
    pub lease_namespace: Option<String>,
    pub lease_duration_seconds: u64,
    pub renew_deadline_seconds: u64,
    pub retry_period_seconds: u64,
}

impl Default for LeaderElection {
    fn default() -> Self {
        LeaderElection {
            enabled: true,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace: None,
            lease_duration_seconds: 30,
            renew_deadline_seconds: 15,
            retry_period_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Webhook {
    pub bind_address: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Reject deleting an FrpServer that an annotated Service still points at.
    pub deny_delete_when_referenced: bool,
    pub probe_timeout_seconds: u64,
}

impl Default for Webhook {
    fn default() -> Self {
        Webhook {
            bind_address: "0.0.0.0:9443".to_string(),
            cert_file: PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.crt"),
            key_file: PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.key"),
            deny_delete_when_referenced: true,
            probe_timeout_seconds: 25,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Controllers {
    pub service_concurrency: u16,
    pub frp_server_concurrency: u16,
    pub frp_server_resync_seconds: u64,
    pub max_retries: u32,
}

impl Default for Controllers {
    fn default() -> Self {
        Controllers {
            service_concurrency: 3,
            frp_server_concurrency: 2,
            frp_server_resync_seconds: 60,
            max_retries: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub leader_election: LeaderElection,
    pub webhook: Webhook,
    pub health_probe_bind_address: String,
    pub controllers: Controllers,
    /// Worker Pod template given inline.
    pub pod_template: Option<Pod>,
    /// Worker Pod template read from a YAML file; used when no inline
    /// template is set.
    pub pod_template_file: Option<PathBuf>,
    pub agent_image: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            leader_election: LeaderElection::default(),
            webhook: Webhook::default(),
            health_probe_bind_address: "0.0.0.0:8081".to_string(),
            controllers: Controllers::default(),
            pod_template: None,
            pod_template_file: None,
            agent_image: DEFAULT_AGENT_IMAGE.to_string(),
        }
    }
}

impl Options {
    /// Parses a config document. YAML is picked by a `.yaml`/`.yml`
    /// extension, anything else is read as TOML.
    pub fn parse(path: &Path, contents: &str) -> Result<Options, Error> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(contents)?),
            _ => Ok(toml::from_str(contents)?),
        }
    }

    pub async fn load(path: &Path) -> Result<Options, Error> {
        let contents = tokio::fs::read_to_string(path).await?;
        Options::parse(path, &contents)
    }

    /// The worker Pod template: inline first, then the template file, then
    /// a single agent container.
    pub async fn pod_template(&self) -> Result<Pod, Error> {
        if let Some(pod) = &self.pod_template {
            return Ok(pod.clone());
        }
        if let Some(path) = &self.pod_template_file {
            let contents = tokio::fs::read_to_string(path).await?;
            return Ok(serde_yaml::from_str(&contents)?);
        }
        Ok(default_pod_template(&self.agent_image))
    }
}

pub fn default_pod_template(image: &str) -> Pod {
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    Pod {
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "frpc".to_string(),
                image: Some(image.to_string()),
                args: Some(vec!["agent".to_string()]),
                ..Container::default()
            }],
            restart_policy: Some("Always".to_string()),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_given_fields() {
        let opts = Options::parse(
            Path::new("manager.toml"),
            r#"
healthProbeBindAddress = "127.0.0.1:8081"

[webhook]
denyDeleteWhenReferenced = false

[controllers]
maxRetries = 3
"#,
        )
        .unwrap();
        assert_eq!(opts.health_probe_bind_address, "127.0.0.1:8081");
        assert!(!opts.webhook.deny_delete_when_referenced);
        assert_eq!(opts.webhook.bind_address, "0.0.0.0:9443");
        assert_eq!(opts.controllers.max_retries, 3);
        assert_eq!(opts.controllers.service_concurrency, 3);
        assert_eq!(opts.leader_election.lease_duration_seconds, 30);
    }

    #[test]
    fn yaml_carries_inline_pod_template() {
        let opts = Options::parse(
            Path::new("manager.yaml"),
            r#"
leaderElection:
  enabled: false
podTemplate:
  metadata:
    name: edge-client
  spec:
    containers:
      - name: frpc
        image: example/frpc:1
"#,
        )
        .unwrap();
        assert!(!opts.leader_election.enabled);
        let pod = opts.pod_template.unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("edge-client"));
    }

    #[test]
    fn bad_documents_are_errors() {
        assert!(matches!(
            Options::parse(Path::new("x.toml"), "controllers = 3"),
            Err(Error::TomlError(_))
        ));
        assert!(matches!(
            Options::parse(Path::new("x.yml"), "controllers: [1"),
            Err(Error::YamlError(_))
        ));
    }

    #[tokio::test]
    async fn default_template_runs_the_agent() {
        let pod = Options::default().pod_template().await.unwrap();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers[0].args.as_deref(), Some(&["agent".to_string()][..]));
    }
}
