//! Live check of an FrpServer: synthesize its client config and log in once.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::ResourceExt;
use log::debug;

use crate::crd::FrpServer;
use crate::frpc;
use crate::synth::{synthesize, SecretGetter};

pub const REASON_GENERATE_CONFIG_FAILED: &str = "GenerateConfigFailed";
pub const REASON_INITIALIZE_FAILED: &str = "InitializeFailed";
pub const REASON_INITIALIZED: &str = "Initialized";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The FrpServer could not be turned into a client config.
    GenerateConfig(String),
    /// The config was fine but login did not succeed.
    Initialize(String),
}

impl ProbeFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            ProbeFailure::GenerateConfig(_) => REASON_GENERATE_CONFIG_FAILED,
            ProbeFailure::Initialize(_) => REASON_INITIALIZE_FAILED,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProbeFailure::GenerateConfig(msg) | ProbeFailure::Initialize(msg) => msg,
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, server: &FrpServer) -> Result<(), ProbeFailure>;
}

pub struct LiveProber {
    secrets: Arc<dyn SecretGetter>,
    timeout: Duration,
}

impl LiveProber {
    pub fn new(secrets: Arc<dyn SecretGetter>, timeout: Duration) -> Self {
        LiveProber { secrets, timeout }
    }
}

#[async_trait]
impl Prober for LiveProber {
    async fn probe(&self, server: &FrpServer) -> Result<(), ProbeFailure> {
        let synthesized = synthesize(server, self.secrets.as_ref())
            .await
            .map_err(|err| ProbeFailure::GenerateConfig(err.to_string()))?;

        debug!("probing frp server {} at {}", server.name_any(), synthesized.config.server_address());
        let result = tokio::time::timeout(self.timeout, frpc::probe(synthesized.config.clone())).await;
        synthesized.release();

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ProbeFailure::Initialize(err.to_string())),
            Err(_) => Err(ProbeFailure::Initialize(format!(
                "login did not finish within {:?}",
                self.timeout
            ))),
        }
    }
}
