use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures_util::StreamExt;
use k8s_openapi::{
    api::core::v1::{ObjectReference, Service},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{
    runtime::{
        controller::{Action, Config},
        reflector::ObjectRef,
        watcher, Controller,
    },
    Api, Resource, ResourceExt,
};
use log::{debug, error, info, warn};

use super::{service::frp_server_name, store::ObjectStore, RECONCILE_TIMEOUT};
use crate::{
    context::Context,
    crd::{FrpServer, FrpServerStatus, Phase},
    error::Error,
    probe::{ProbeFailure, Prober, REASON_INITIALIZED},
};

pub const CONDITION_INITIALIZED: &str = "Initialized";
const PENDING_REQUEUE: Duration = Duration::from_secs(1);

pub fn service_reference(svc: &Service) -> ObjectReference {
    ObjectReference {
        api_version: Some(Service::api_version(&()).to_string()),
        kind: Some(Service::kind(&()).to_string()),
        namespace: svc.namespace(),
        name: Some(svc.name_any()),
        uid: svc.uid(),
        ..ObjectReference::default()
    }
}

/// References to every Service whose annotation names `server`, sorted by
/// namespace and name.
pub fn referencing_services(server: &str, services: &[Service]) -> Vec<ObjectReference> {
    let mut refs: Vec<ObjectReference> = services
        .iter()
        .filter(|svc| frp_server_name(svc) == Some(server))
        .map(service_reference)
        .collect();
    refs.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    refs
}

/// Replaces the condition with the same type, keeping its transition time
/// when nothing about it changed.
fn merge_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// The status `server` should carry next. `probe` is `None` while the
/// server has not been probed yet.
pub fn next_status(
    server: &FrpServer,
    probe: Option<&Result<(), ProbeFailure>>,
    service_references: Vec<ObjectReference>,
) -> FrpServerStatus {
    let mut status = server.status.clone().unwrap_or_default();
    status.observed_generation = server.metadata.generation;
    status.service_references = service_references;

    let Some(outcome) = probe else {
        status.phase = Some(Phase::Pending);
        status.reason = None;
        return status;
    };

    let (phase, reason, message) = match outcome {
        Ok(()) => (Phase::Healthy, REASON_INITIALIZED, String::new()),
        Err(failure) => (Phase::Unhealthy, failure.reason(), failure.message().to_string()),
    };
    status.phase = Some(phase);
    status.reason = Some(reason.to_string());
    merge_condition(
        &mut status.conditions,
        Condition {
            type_: CONDITION_INITIALIZED.to_string(),
            status: "True".to_string(),
            reason: reason.to_string(),
            message,
            observed_generation: server.metadata.generation,
            last_transition_time: Time(chrono::Utc::now()),
        },
    );
    status
}

/// Compares two statuses ignoring condition timestamps.
fn same_status(a: &FrpServerStatus, b: &FrpServerStatus) -> bool {
    let strip = |status: &FrpServerStatus| {
        let mut status = status.clone();
        for condition in status.conditions.iter_mut() {
            condition.last_transition_time = Time(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        }
        status
    };
    strip(a) == strip(b)
}

pub struct FrpServerReconciler<'a> {
    pub frp_servers: &'a dyn ObjectStore<FrpServer>,
    pub services: &'a dyn ObjectStore<Service>,
    pub prober: &'a dyn Prober,
    pub resync: Duration,
}

impl<'a> FrpServerReconciler<'a> {
    pub async fn reconcile(&self, name: &str) -> Result<Option<Duration>, Error> {
        let server = match self.frp_servers.get("", name).await {
            Ok(server) => server,
            Err(err) if err.is_not_found() => {
                debug!("frp server {name} is gone");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let services = self.services.list("", &BTreeMap::new()).await?;
        let refs = referencing_services(name, &services);

        let first_observation = server.phase() == Phase::Unknown;
        let outcome = if first_observation {
            None
        } else {
            Some(self.prober.probe(&server).await)
        };
        if let Some(Err(failure)) = &outcome {
            warn!("frp server {name} is unhealthy: {}: {}", failure.reason(), failure.message());
        }

        let status = next_status(&server, outcome.as_ref(), refs);
        let unchanged = server
            .status
            .as_ref()
            .is_some_and(|current| same_status(current, &status));
        if !unchanged {
            let phase = status.phase.unwrap_or_default();
            let mut updated = server;
            updated.status = Some(status);
            match self.frp_servers.replace_status(&updated).await {
                Ok(_) => info!("frp server {name} is {phase}"),
                Err(err) if err.is_not_found() => return Ok(None),
                Err(err) => return Err(err),
            }
        }

        if first_observation {
            Ok(Some(PENDING_REQUEUE))
        } else {
            Ok(Some(self.resync))
        }
    }
}

async fn reconcile(server: Arc<FrpServer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = server.name_any();
    let reconciler = FrpServerReconciler {
        frp_servers: ctx.frp_servers.as_ref(),
        services: ctx.services.as_ref(),
        prober: ctx.prober.as_ref(),
        resync: Duration::from_secs(ctx.options.controllers.frp_server_resync_seconds),
    };

    let requeue = tokio::time::timeout(RECONCILE_TIMEOUT, reconciler.reconcile(&name)).await??;
    ctx.frp_server_retries.forget(&name);
    Ok(match requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(server: Arc<FrpServer>, err: &Error, ctx: Arc<Context>) -> Action {
    let name = server.name_any();
    error!("reconcile frp server {name} failed: {err}");
    ctx.frp_server_retries.action(&name)
}

pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let client = ctx.client.clone();

    let server_api: Api<FrpServer> = Api::all(client.clone());
    let svc_api: Api<Service> = Api::all(client.clone());

    Controller::new(server_api, watcher::Config::default())
        .watches(svc_api, watcher::Config::default(), |svc| {
            frp_server_name(&svc).map(|name| ObjectRef::<FrpServer>::new(name))
        })
        .with_config(Config::default().concurrency(ctx.options.controllers.frp_server_concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("reconciled frp server {}", o.0),
                Err(e) => warn!("reconcile frp server failed: {e}"),
            }
        })
        .await;

    Ok(())
}
