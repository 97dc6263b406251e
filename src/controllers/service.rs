use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    runtime::{
        controller::{Action, Config},
        reflector::ObjectRef,
        watcher, Controller,
    },
    Api, ResourceExt,
};
use log::{debug, error, info, warn};

use super::{
    pod::{pod_from_template, service_labels},
    refmanager::{Owner, RefManager},
    store::ObjectStore,
    RECONCILE_TIMEOUT,
};
use crate::{
    context::Context,
    crd::{FrpServer, ANNOTATION_FRP_SERVER_NAME, FINALIZER_TRACKING, LABEL_SERVICE_NAME},
    error::Error,
};

pub fn frp_server_name(svc: &Service) -> Option<&str> {
    svc.annotations()
        .get(ANNOTATION_FRP_SERVER_NAME)
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}

fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some("LoadBalancer")
}

pub fn is_active(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed")) && pod.metadata.deletion_timestamp.is_none()
}

fn has_finalizer(svc: &Service) -> bool {
    svc.finalizers().iter().any(|f| f == FINALIZER_TRACKING)
}

fn has_ingress(svc: &Service) -> bool {
    svc.status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty())
}

async fn delete_pods(pods: &dyn ObjectStore<Pod>, victims: &[Pod]) -> Vec<Error> {
    let mut errors = Vec::new();
    for pod in victims {
        let namespace = pod.namespace().unwrap_or_default();
        match pods.delete(&namespace, &pod.name_any()).await {
            Ok(()) => info!("deleted pod {namespace}/{}", pod.name_any()),
            Err(err) if err.is_not_found() => {}
            Err(err) => errors.push(err),
        }
    }
    errors
}

/// Keeps exactly one active worker Pod alive for a qualifying Service and
/// none for any other.
pub struct ServiceReconciler<'a> {
    pub services: &'a dyn ObjectStore<Service>,
    pub pods: &'a dyn ObjectStore<Pod>,
    pub frp_servers: &'a dyn ObjectStore<FrpServer>,
    pub template: &'a Pod,
}

impl<'a> ServiceReconciler<'a> {
    async fn qualifies(&self, svc: &Service) -> Result<bool, Error> {
        if !is_load_balancer(svc) || svc.metadata.deletion_timestamp.is_some() {
            return Ok(false);
        }
        let Some(server) = frp_server_name(svc) else {
            return Ok(false);
        };
        match self.frp_servers.get("", server).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => {
                warn!(
                    "service {}/{} names missing frp server {server}",
                    svc.namespace().unwrap_or_default(),
                    svc.name_any()
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let svc = match self.services.get(namespace, name).await {
            Ok(svc) => svc,
            Err(err) if err.is_not_found() => {
                debug!("service {namespace}/{name} is gone");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let selector = service_labels(&svc);
        let (active, inactive): (Vec<Pod>, Vec<Pod>) = self
            .pods
            .list(namespace, &selector)
            .await?
            .into_iter()
            .partition(is_active);

        let mut errors = Vec::new();

        let services = self.services;
        let uid = svc.uid();
        let can_adopt = async move {
            let fresh = services.get(namespace, name).await?;
            if fresh.uid() != uid {
                return Err(Error::InvalidConfig(format!(
                    "service {namespace}/{name} was recreated with uid {:?}",
                    fresh.uid()
                )));
            }
            if fresh.metadata.deletion_timestamp.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "service {namespace}/{name} is being deleted"
                )));
            }
            Ok(())
        }
        .boxed();
        let mut refs = RefManager::new(self.pods, selector, Owner::of(&svc), can_adopt);
        let claimed = match refs.claim(active).await {
            Ok(claimed) => claimed,
            Err(err) => {
                errors.push(err);
                Vec::new()
            }
        };

        errors.extend(delete_pods(self.pods, &inactive).await);
        Error::aggregate(errors)?;

        if !self.qualifies(&svc).await? {
            return self.release(svc, &claimed).await;
        }

        let svc = if has_finalizer(&svc) {
            svc
        } else {
            let mut updated = svc;
            updated
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER_TRACKING.to_string());
            let updated = self.services.replace(&updated).await?;
            info!("added finalizer to service {namespace}/{name}");
            updated
        };

        if claimed.is_empty() {
            let pod = pod_from_template(self.template, &svc);
            let created = self.pods.create(namespace, &pod).await?;
            info!("created pod {namespace}/{} for service {name}", created.name_any());
        }
        Ok(())
    }

    async fn release(&self, svc: Service, claimed: &[Pod]) -> Result<(), Error> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();

        Error::aggregate(delete_pods(self.pods, claimed).await)?;
        if !has_finalizer(&svc) {
            return Ok(());
        }

        let mut svc = svc;
        if has_ingress(&svc) {
            if let Some(lb) = svc
                .status
                .as_mut()
                .and_then(|status| status.load_balancer.as_mut())
            {
                lb.ingress = None;
            }
            svc = match self.services.replace_status(&svc).await {
                Ok(updated) => updated,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            };
            info!("cleared load balancer ingress of service {namespace}/{name}");
        }

        if let Some(finalizers) = svc.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER_TRACKING);
        }
        match self.services.replace(&svc).await {
            Ok(_) => {
                info!("released service {namespace}/{name}");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn reconcile(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let reconciler = ServiceReconciler {
        services: ctx.services.as_ref(),
        pods: ctx.pods.as_ref(),
        frp_servers: ctx.frp_servers.as_ref(),
        template: &ctx.pod_template,
    };

    tokio::time::timeout(RECONCILE_TIMEOUT, reconciler.reconcile(&namespace, &name)).await??;
    ctx.service_retries.forget(&format!("{namespace}/{name}"));
    Ok(Action::await_change())
}

fn error_policy(svc: Arc<Service>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = format!("{}/{}", svc.namespace().unwrap_or_default(), svc.name_any());
    error!("reconcile service {key} failed: {err}");
    ctx.service_retries.action(&key)
}

pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let client = ctx.client.clone();

    let svc_api: Api<Service> = Api::all(client.clone());
    let pod_api: Api<Pod> = Api::all(client.clone());
    let server_api: Api<FrpServer> = Api::all(client.clone());

    let controller = Controller::new(svc_api, watcher::Config::default());
    let services = controller.store();

    controller
        .owns(pod_api, watcher::Config::default().labels(LABEL_SERVICE_NAME))
        .watches(server_api, watcher::Config::default(), move |server| {
            let server_name = server.name_any();
            services
                .state()
                .into_iter()
                .filter(|svc| frp_server_name(svc) == Some(server_name.as_str()))
                .map(|svc| ObjectRef::from_obj(svc.as_ref()))
                .collect::<Vec<_>>()
        })
        .with_config(Config::default().concurrency(ctx.options.controllers.service_concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("reconciled service {}", o.0),
                Err(e) => warn!("reconcile service failed: {e}"),
            }
        })
        .await;

    Ok(())
}
