use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Pod, Service};
use kube::ResourceExt;
use rand::{distributions::Alphanumeric, Rng};

use super::refmanager::Owner;
use crate::crd::{LABEL_CONTROLLER_UID, LABEL_SERVICE_NAME};

pub const DEFAULT_BASE_NAME: &str = "frp-client";
pub const ENV_SERVICE_NAMESPACE: &str = "FRP_SERVICE_NAMESPACE";
pub const ENV_SERVICE_NAME: &str = "FRP_SERVICE_NAME";

const SUFFIX_LEN: usize = 5;

/// Identity labels every worker Pod of `svc` carries.
pub fn service_labels(svc: &Service) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_SERVICE_NAME.to_string(), svc.name_any()),
        (LABEL_CONTROLLER_UID.to_string(), svc.uid().unwrap_or_default()),
    ])
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

fn set_env(env: &mut Vec<EnvVar>, name: &str, value: String) {
    match env.iter_mut().find(|var| var.name == name) {
        Some(var) => {
            var.value = Some(value);
            var.value_from = None;
        }
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..EnvVar::default()
        }),
    }
}

/// Builds a worker Pod for `svc` from `template`.
pub fn pod_from_template(template: &Pod, svc: &Service) -> Pod {
    let mut pod = template.clone();
    let namespace = svc.namespace().unwrap_or_default();

    let base = template
        .metadata
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_BASE_NAME);
    let meta = &mut pod.metadata;
    meta.name = Some(format!("{base}-{}-{}", svc.name_any(), random_suffix()));
    meta.generate_name = None;
    meta.namespace = Some(namespace.clone());
    meta.resource_version = None;
    meta.uid = None;
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(service_labels(svc));
    meta.owner_references = Some(vec![Owner::of(svc).controller_ref()]);

    if let Some(spec) = pod.spec.as_mut() {
        for container in spec.containers.iter_mut() {
            let env = container.env.get_or_insert_with(Vec::new);
            set_env(env, ENV_SERVICE_NAMESPACE, namespace.clone());
            set_env(env, ENV_SERVICE_NAME, svc.name_any());
        }
    }
    pod.status = None;
    pod
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_pod_template;
    use kube::api::ObjectMeta;

    fn service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("app".to_string()),
                uid: Some("U".to_string()),
                ..ObjectMeta::default()
            },
            ..Service::default()
        }
    }

    #[test]
    fn generated_pod_is_owned_and_labelled() {
        let pod = pod_from_template(&default_pod_template("frpc:1"), &service());
        let name = pod.name_any();
        assert!(name.starts_with("frp-client-web-"));
        assert_eq!(name.len(), "frp-client-web-".len() + SUFFIX_LEN);
        assert_eq!(pod.namespace().as_deref(), Some("app"));
        assert_eq!(pod.labels().get(LABEL_SERVICE_NAME).map(String::as_str), Some("web"));
        assert_eq!(pod.labels().get(LABEL_CONTROLLER_UID).map(String::as_str), Some("U"));

        let oref = &pod.owner_references()[0];
        assert_eq!((oref.kind.as_str(), oref.uid.as_str()), ("Service", "U"));
        assert_eq!(oref.controller, Some(true));
    }

    #[test]
    fn template_name_and_labels_are_kept() {
        let mut template = default_pod_template("frpc:1");
        template.metadata.name = Some("edge".to_string());
        template.metadata.labels = Some(BTreeMap::from([("team".to_string(), "net".to_string())]));
        let pod = pod_from_template(&template, &service());
        assert!(pod.name_any().starts_with("edge-web-"));
        assert_eq!(pod.labels().len(), 3);
    }

    #[test]
    fn every_container_learns_its_service() {
        let mut template = default_pod_template("frpc:1");
        let spec = template.spec.as_mut().unwrap();
        let mut sidecar = spec.containers[0].clone();
        sidecar.name = "sidecar".to_string();
        sidecar.env = Some(vec![EnvVar {
            name: ENV_SERVICE_NAME.to_string(),
            value: Some("stale".to_string()),
            ..EnvVar::default()
        }]);
        spec.containers.push(sidecar);

        let pod = pod_from_template(&template, &service());
        for container in pod.spec.unwrap().containers {
            let env = container.env.unwrap();
            let get = |name: &str| {
                env.iter()
                    .find(|var| var.name == name)
                    .and_then(|var| var.value.clone())
            };
            assert_eq!(get(ENV_SERVICE_NAMESPACE).as_deref(), Some("app"));
            assert_eq!(get(ENV_SERVICE_NAME).as_deref(), Some("web"));
            assert_eq!(env.len(), 2);
        }
    }
}
