use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::{Pod, Service};

use crate::{
    config::Options,
    controllers::{
        store::{KubeStore, ObjectStore},
        RetryTracker,
    },
    crd::FrpServer,
    probe::{LiveProber, Prober},
};

/// Shared state handed to every reconcile.
pub struct Context {
    pub client: kube::Client,
    pub options: Options,
    pub pod_template: Pod,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
    pub frp_servers: Arc<dyn ObjectStore<FrpServer>>,
    pub prober: Arc<dyn Prober>,
    pub service_retries: RetryTracker,
    pub frp_server_retries: RetryTracker,
}

impl Context {
    pub fn new(client: kube::Client, options: Options, pod_template: Pod) -> Self {
        let max_retries = options.controllers.max_retries;
        let probe_timeout = Duration::from_secs(options.webhook.probe_timeout_seconds);
        Context {
            services: Arc::new(KubeStore::<Service>::namespaced(client.clone())),
            pods: Arc::new(KubeStore::<Pod>::namespaced(client.clone())),
            frp_servers: Arc::new(KubeStore::<FrpServer>::cluster(client.clone())),
            prober: Arc::new(LiveProber::new(Arc::new(client.clone()), probe_timeout)),
            service_retries: RetryTracker::new(max_retries),
            frp_server_retries: RetryTracker::new(max_retries),
            client,
            options,
            pod_template,
        }
    }
}
