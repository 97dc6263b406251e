//! Worker entry point: runs the FRP client for one Service and keeps its
//! proxies and load balancer status in line with the cluster.

use std::{net::IpAddr, sync::Arc, time::Duration};

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Service, ServiceStatus};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, ResourceExt,
};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::{
    controllers::{
        service::frp_server_name,
        store::{KubeStore, ObjectStore},
    },
    crd::FrpServer,
    error::Error,
    frpc::{config::ProxyConfig, Client},
    synth::{synthesize, SecretGetter, Synthesized},
};

const RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// One TCP proxy per TCP port, forwarding to the Service's cluster DNS name.
pub fn proxies_for_service(svc: &Service) -> Vec<ProxyConfig> {
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .into_iter()
        .flatten();

    let mut proxies = Vec::new();
    for port in ports {
        let protocol = port.protocol.as_deref().unwrap_or("TCP");
        if !protocol.eq_ignore_ascii_case("tcp") {
            warn!("skipping {protocol} port {} of service {namespace}/{name}: only tcp is supported", port.port);
            continue;
        }
        let Ok(number) = u16::try_from(port.port) else {
            warn!("skipping invalid port {} of service {namespace}/{name}", port.port);
            continue;
        };
        let port_name = port
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| number.to_string());
        proxies.push(ProxyConfig {
            name: format!("{namespace}.{name}.{port_name}"),
            type_: "tcp".to_string(),
            local_ip: format!("{name}.{namespace}.svc.cluster.local"),
            local_port: number,
            remote_port: number,
            ..ProxyConfig::default()
        });
    }
    proxies
}

/// IP entries for literal addresses, hostname entries for everything else.
pub fn ingress_for(external_ips: &[String]) -> Vec<LoadBalancerIngress> {
    external_ips
        .iter()
        .map(|addr| match addr.parse::<IpAddr>() {
            Ok(_) => LoadBalancerIngress {
                ip: Some(addr.clone()),
                ..LoadBalancerIngress::default()
            },
            Err(_) => LoadBalancerIngress {
                hostname: Some(addr.clone()),
                ..LoadBalancerIngress::default()
            },
        })
        .collect()
}

struct Session {
    server: String,
    generation: Option<i64>,
    client: Arc<Client>,
    task: JoinHandle<Result<(), Error>>,
    synthesized: Synthesized,
}

impl Session {
    async fn stop(self) {
        info!("stopping client for frp server {}", self.server);
        self.client.stop();
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("client for {} ended with {err}", self.server),
            Err(err) => warn!("client task for {} failed: {err}", self.server),
        }
        self.synthesized.release();
    }
}

pub struct Agent {
    namespace: String,
    name: String,
    services: Arc<dyn ObjectStore<Service>>,
    frp_servers: Arc<dyn ObjectStore<FrpServer>>,
    secrets: Arc<dyn SecretGetter>,
    session: Option<Session>,
}

impl Agent {
    pub fn new(
        namespace: &str,
        name: &str,
        services: Arc<dyn ObjectStore<Service>>,
        frp_servers: Arc<dyn ObjectStore<FrpServer>>,
        secrets: Arc<dyn SecretGetter>,
    ) -> Self {
        Agent {
            namespace: namespace.to_string(),
            name: name.to_string(),
            services,
            frp_servers,
            secrets,
            session: None,
        }
    }

    pub fn current_server(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.server.as_str())
    }

    async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
    }

    /// Fails when the running client gave up, which only happens when the
    /// first login fails and `loginFailExit` is set.
    pub async fn check_session(&mut self) -> Result<(), Error> {
        let finished = self
            .session
            .as_ref()
            .is_some_and(|session| session.task.is_finished());
        if !finished {
            return Ok(());
        }
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let result = session.task.await;
        session.synthesized.release();
        match result {
            Ok(result) => result,
            Err(err) => Err(Error::Other(err.into())),
        }
    }

    async fn start(&mut self, server: &FrpServer, proxies: Vec<ProxyConfig>) -> Result<(), Error> {
        let synthesized = synthesize(server, self.secrets.as_ref()).await?;
        let client = Client::new(synthesized.config.clone(), proxies);
        info!(
            "starting client for service {}/{} against frp server {} ({})",
            self.namespace,
            self.name,
            server.name_any(),
            synthesized.config.server_address()
        );
        let task = tokio::spawn(client.clone().run());
        self.session = Some(Session {
            server: server.name_any(),
            generation: server.metadata.generation,
            client,
            task,
            synthesized,
        });
        Ok(())
    }

    async fn publish_ingress(&self, svc: Service, external_ips: &[String]) -> Result<(), Error> {
        let desired = ingress_for(external_ips);
        let current = svc
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.clone())
            .unwrap_or_default();
        if current == desired {
            return Ok(());
        }

        let mut updated = svc;
        let status = updated.status.get_or_insert_with(ServiceStatus::default);
        status
            .load_balancer
            .get_or_insert_with(LoadBalancerStatus::default)
            .ingress = Some(desired);
        self.services.replace_status(&updated).await?;
        info!("published ingress {external_ips:?} for service {}/{}", self.namespace, self.name);
        Ok(())
    }

    /// Brings the client in line with the Service and its FrpServer.
    pub async fn sync(&mut self) -> Result<(), Error> {
        let svc = match self.services.get(&self.namespace, &self.name).await {
            Ok(svc) => svc,
            Err(err) if err.is_not_found() => {
                debug!("service {}/{} is gone", self.namespace, self.name);
                self.stop().await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let Some(server_name) = frp_server_name(&svc).map(str::to_string) else {
            self.stop().await;
            return Ok(());
        };
        let server = match self.frp_servers.get("", &server_name).await {
            Ok(server) => server,
            Err(err) if err.is_not_found() => {
                warn!("frp server {server_name} not found");
                self.stop().await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let proxies = proxies_for_service(&svc);
        let up_to_date = self.session.as_ref().is_some_and(|session| {
            session.server == server_name && session.generation == server.metadata.generation
        });
        if up_to_date {
            if let Some(session) = &self.session {
                session.client.reload(proxies).await?;
            }
        } else {
            self.stop().await;
            self.start(&server, proxies).await?;
        }

        self.publish_ingress(svc, &server.spec.external_ips).await
    }
}

pub async fn run(client: kube::Client, namespace: &str, name: &str) -> anyhow::Result<()> {
    let mut agent = Agent::new(
        namespace,
        name,
        Arc::new(KubeStore::<Service>::namespaced(client.clone())),
        Arc::new(KubeStore::<FrpServer>::cluster(client.clone())),
        Arc::new(client.clone()),
    );

    let svc_api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let server_api: Api<FrpServer> = Api::all(client.clone());
    let svc_events = watcher(
        svc_api,
        watcher::Config::default().fields(&format!("metadata.name={name}")),
    )
    .default_backoff()
    .applied_objects();
    let server_events = watcher(server_api, watcher::Config::default())
        .default_backoff()
        .applied_objects();
    tokio::pin!(svc_events, server_events);

    let mut resync = tokio::time::interval(RESYNC_PERIOD);
    info!("agent for service {namespace}/{name} started");
    loop {
        tokio::select! {
            event = svc_events.next() => match event {
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!("watching service {namespace}/{name} failed: {err}"),
                None => break,
            },
            event = server_events.next() => match event {
                Some(Ok(server))
                    if agent.current_server().map_or(true, |current| current == server.name_any()) => {}
                Some(Ok(_)) => continue,
                Some(Err(err)) => warn!("watching frp servers failed: {err}"),
                None => break,
            },
            _ = resync.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("agent for service {namespace}/{name} shutting down");
                break;
            }
        }

        if let Err(err) = agent.check_session().await {
            error!("client for service {namespace}/{name} gave up: {err}");
            agent.stop().await;
            return Err(err.into());
        }
        if let Err(err) = agent.sync().await {
            warn!("syncing service {namespace}/{name} failed: {err}");
        }
    }

    agent.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::store::memory::MemoryStore;
    use crate::crd::{AuthSpec, FrpServerSpec, TransportSpec, ANNOTATION_FRP_SERVER_NAME};
    use crate::synth::tests::MapSecrets;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn port(name: Option<&str>, number: i32, protocol: Option<&str>) -> ServicePort {
        ServicePort {
            name: name.map(str::to_string),
            port: number,
            protocol: protocol.map(str::to_string),
            ..ServicePort::default()
        }
    }

    fn web(ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("app".to_string()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_FRP_SERVER_NAME.to_string(),
                    "edge-1".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(ports),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    #[test]
    fn tcp_ports_become_proxies() {
        let svc = web(vec![
            port(None, 80, None),
            port(Some("https"), 443, Some("TCP")),
            port(Some("dns"), 53, Some("UDP")),
        ]);
        let proxies = proxies_for_service(&svc);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].name, "app.web.80");
        assert_eq!(proxies[0].local_address(), "web.app.svc.cluster.local:80");
        assert_eq!(proxies[0].remote_port, 80);
        assert_eq!(proxies[1].name, "app.web.https");
        assert_eq!(proxies[1].type_, "tcp");
    }

    #[test]
    fn ingress_splits_ips_and_hostnames() {
        let ingress = ingress_for(&[
            "198.51.100.10".to_string(),
            "edge.example.com".to_string(),
            "2001:db8::1".to_string(),
        ]);
        assert_eq!(ingress[0].ip.as_deref(), Some("198.51.100.10"));
        assert_eq!(ingress[1].hostname.as_deref(), Some("edge.example.com"));
        assert_eq!(ingress[2].ip.as_deref(), Some("2001:db8::1"));
    }

    fn agent(services: &Arc<MemoryStore<Service>>, servers: &Arc<MemoryStore<FrpServer>>) -> Agent {
        Agent::new(
            "app",
            "web",
            services.clone(),
            servers.clone(),
            Arc::new(MapSecrets::default()),
        )
    }

    fn edge(generation: i64) -> FrpServer {
        let mut server = FrpServer::new(
            "edge-1",
            FrpServerSpec {
                auth: AuthSpec {
                    token: Some("T".to_string()),
                    ..AuthSpec::default()
                },
                // nothing listens here; the client keeps retrying in the
                // background while the tests look at the agent's state
                server_addr: "127.0.0.1".to_string(),
                server_port: Some(9),
                login_fail_exit: Some(false),
                external_ips: vec!["edge.example.com".to_string()],
                transport: TransportSpec::default(),
                ..FrpServerSpec::default()
            },
        );
        server.metadata.generation = Some(generation);
        server
    }

    #[tokio::test]
    async fn sync_starts_client_and_publishes_ingress() {
        let services = Arc::new(MemoryStore::<Service>::default());
        let servers = Arc::new(MemoryStore::<FrpServer>::default());
        services.seed(web(vec![port(None, 80, None)]));
        servers.seed(edge(1));

        let mut agent = agent(&services, &servers);
        agent.sync().await.unwrap();
        assert_eq!(agent.current_server(), Some("edge-1"));

        let svc = services.get("app", "web").await.unwrap();
        let ingress = svc.status.unwrap().load_balancer.unwrap().ingress.unwrap();
        assert_eq!(ingress[0].hostname.as_deref(), Some("edge.example.com"));

        let writes = services.writes();
        agent.sync().await.unwrap();
        assert_eq!(services.writes(), writes);
        agent.stop().await;
    }

    #[tokio::test]
    async fn dropping_the_annotation_stops_the_client() {
        let services = Arc::new(MemoryStore::<Service>::default());
        let servers = Arc::new(MemoryStore::<FrpServer>::default());
        services.seed(web(vec![port(None, 80, None)]));
        servers.seed(edge(1));

        let mut agent = agent(&services, &servers);
        agent.sync().await.unwrap();

        let mut svc = services.get("app", "web").await.unwrap();
        svc.metadata.annotations = None;
        services.seed(svc);
        agent.sync().await.unwrap();
        assert_eq!(agent.current_server(), None);
    }

    #[tokio::test]
    async fn new_generation_restarts_the_client() {
        let services = Arc::new(MemoryStore::<Service>::default());
        let servers = Arc::new(MemoryStore::<FrpServer>::default());
        services.seed(web(vec![port(None, 80, None)]));
        servers.seed(edge(1));

        let mut agent = agent(&services, &servers);
        agent.sync().await.unwrap();
        let first = agent.session.as_ref().map(|s| Arc::as_ptr(&s.client));

        servers.seed(edge(2));
        agent.sync().await.unwrap();
        let second = agent.session.as_ref().map(|s| Arc::as_ptr(&s.client));
        assert_ne!(first, second);
        assert_eq!(agent.session.as_ref().and_then(|s| s.generation), Some(2));
        agent.stop().await;
    }
}
