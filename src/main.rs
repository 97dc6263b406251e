mod agent;
mod config;
mod context;
mod controllers;
mod crd;
mod error;
mod frpc;
mod health;
mod leader;
mod probe;
mod synth;
mod webhook;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::{coordination::v1::Lease, core::v1::Service};
use log::{error, info, warn};

use crate::{
    config::Options,
    context::Context,
    controllers::store::KubeStore,
    health::Readiness,
    leader::{holder_identity, LeaderElector},
    probe::LiveProber,
    webhook::WebhookState,
};

/// Exposes LoadBalancer Services through FRP servers.
#[derive(Parser, Debug)]
#[command(name = "frp-lb", version, about, long_about = None)]
struct Cli {
    /// Manager options file, TOML or YAML by extension.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the FrpServer and Service controllers behind leader election.
    ControllerManager(ControllerManagerArgs),
    /// Serve the FrpServer admission webhook.
    Manager(ManagerArgs),
    /// Run the FRP client for one Service inside a worker Pod.
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ControllerManagerArgs {
    #[arg(long)]
    leader_elect: Option<bool>,
    #[arg(long)]
    leader_elect_lease_duration: Option<u64>,
    #[arg(long)]
    leader_elect_renew_deadline: Option<u64>,
    #[arg(long)]
    leader_elect_retry_period: Option<u64>,
    #[arg(long)]
    health_probe_bind_address: Option<String>,
}

#[derive(Args, Debug)]
struct ManagerArgs {
    #[arg(long)]
    webhook_bind_address: Option<String>,
    #[arg(long)]
    webhook_cert_file: Option<PathBuf>,
    #[arg(long)]
    webhook_key_file: Option<PathBuf>,
    #[arg(long)]
    health_probe_bind_address: Option<String>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    #[arg(long, env = "FRP_SERVICE_NAMESPACE")]
    service_namespace: String,
    #[arg(long, env = "FRP_SERVICE_NAME")]
    service_name: String,
}

impl ControllerManagerArgs {
    fn apply(&self, options: &mut Options) {
        let election = &mut options.leader_election;
        if let Some(enabled) = self.leader_elect {
            election.enabled = enabled;
        }
        if let Some(secs) = self.leader_elect_lease_duration {
            election.lease_duration_seconds = secs;
        }
        if let Some(secs) = self.leader_elect_renew_deadline {
            election.renew_deadline_seconds = secs;
        }
        if let Some(secs) = self.leader_elect_retry_period {
            election.retry_period_seconds = secs;
        }
        if let Some(addr) = &self.health_probe_bind_address {
            options.health_probe_bind_address = addr.clone();
        }
    }
}

impl ManagerArgs {
    fn apply(&self, options: &mut Options) {
        if let Some(addr) = &self.webhook_bind_address {
            options.webhook.bind_address = addr.clone();
        }
        if let Some(path) = &self.webhook_cert_file {
            options.webhook.cert_file = path.clone();
        }
        if let Some(path) = &self.webhook_key_file {
            options.webhook.key_file = path.clone();
        }
        if let Some(addr) = &self.health_probe_bind_address {
            options.health_probe_bind_address = addr.clone();
        }
    }
}

fn spawn_health(options: &Options, readiness: Readiness) {
    let addr = options.health_probe_bind_address.clone();
    tokio::spawn(async move {
        if let Err(err) = health::serve(&addr, readiness).await {
            error!("health server on {addr} failed: {err}");
        }
    });
}

async fn run_controller_manager(options: Options) -> anyhow::Result<()> {
    let client = kube::Client::try_default().await?;
    let readiness = Readiness::default();
    spawn_health(&options, readiness.clone());

    let pod_template = options.pod_template().await?;
    let ctx = Arc::new(Context::new(client.clone(), options.clone(), pod_template));

    if !options.leader_election.enabled {
        readiness.set_ready(true);
        return controllers::run(ctx).await;
    }

    let namespace = options
        .leader_election
        .lease_namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_string());
    let elector = Arc::new(LeaderElector::new(
        Arc::new(KubeStore::<Lease>::namespaced(client.clone())),
        &namespace,
        &holder_identity(),
        &options.leader_election,
    ));
    readiness.set_ready(true);

    let mut guard = tokio::select! {
        guard = elector.clone().acquire() => guard,
        _ = tokio::signal::ctrl_c() => return Ok(()),
    };
    info!("{} is the leader", elector.identity());

    tokio::select! {
        res = controllers::run(ctx) => res,
        _ = guard.lost() => Err(anyhow::anyhow!("leadership lost")),
    }
}

async fn run_manager(options: Options) -> anyhow::Result<()> {
    let client = kube::Client::try_default().await?;
    let readiness = Readiness::default();
    spawn_health(&options, readiness.clone());

    let probe_timeout = Duration::from_secs(options.webhook.probe_timeout_seconds);
    let state = Arc::new(WebhookState {
        prober: Arc::new(LiveProber::new(Arc::new(client.clone()), probe_timeout)),
        services: Arc::new(KubeStore::<Service>::namespaced(client)),
        deny_delete_when_referenced: options.webhook.deny_delete_when_referenced,
    });
    readiness.set_ready(true);
    webhook::serve(&options.webhook, state).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level)).init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("a rustls crypto provider was already installed");
    }

    let mut options = match &cli.config {
        Some(path) => Options::load(path).await?,
        None => Options::default(),
    };

    match cli.command {
        Command::ControllerManager(args) => {
            args.apply(&mut options);
            info!("starting frp-lb controller manager");
            run_controller_manager(options).await
        }
        Command::Manager(args) => {
            args.apply(&mut options);
            info!("starting frp-lb webhook manager");
            run_manager(options).await
        }
        Command::Agent(args) => {
            info!("starting frp-lb agent for {}/{}", args.service_namespace, args.service_name);
            let client = kube::Client::try_default().await?;
            agent::run(client, &args.service_namespace, &args.service_name).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::try_parse_from([
            "frp-lb",
            "controller-manager",
            "--leader-elect",
            "false",
            "--health-probe-bind-address",
            "127.0.0.1:9000",
        ])
        .unwrap();
        let Command::ControllerManager(args) = cli.command else {
            panic!("expected controller-manager");
        };
        let mut options = Options::default();
        args.apply(&mut options);
        assert!(!options.leader_election.enabled);
        assert_eq!(options.health_probe_bind_address, "127.0.0.1:9000");
        assert_eq!(options.leader_election.lease_duration_seconds, 30);
    }

    #[test]
    fn agent_reads_service_from_flags() {
        let cli = Cli::try_parse_from([
            "frp-lb",
            "agent",
            "--service-namespace",
            "app",
            "--service-name",
            "web",
        ])
        .unwrap();
        let Command::Agent(args) = cli.command else {
            panic!("expected agent");
        };
        assert_eq!((args.service_namespace.as_str(), args.service_name.as_str()), ("app", "web"));
    }
}
