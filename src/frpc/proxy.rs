use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use tokio::io::{copy, copy_bidirectional, split, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use super::config::ProxyConfig;
use super::crypto::{CryptoReader, CryptoWriter};
use super::msg::{CloseProxy, Message, NewProxy, StartWorkConn};
use super::supervisor;
use super::transport::BoxedStream;
use crate::error::Error;

/// How long a proxy rejected by the server waits before it is registered
/// again.
const START_ERR_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    WaitStart,
    Running,
    StartErr,
}

impl fmt::Display for ProxyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyPhase::WaitStart => "wait start",
            ProxyPhase::Running => "running",
            ProxyPhase::StartErr => "start error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyStatus {
    pub name: String,
    pub phase: ProxyPhase,
    pub remote_addr: String,
    pub error: String,
}

struct Wrapper {
    config: ProxyConfig,
    phase: ProxyPhase,
    remote_addr: String,
    last_err: String,
    last_change: Instant,
    work_conns: Vec<supervisor::Task>,
}

impl Wrapper {
    fn new(config: ProxyConfig) -> Wrapper {
        Wrapper {
            config,
            phase: ProxyPhase::WaitStart,
            remote_addr: String::new(),
            last_err: String::new(),
            last_change: Instant::now(),
            work_conns: Vec::new(),
        }
    }

    fn track(&mut self, task: supervisor::Task) {
        self.work_conns.retain(|task| !task.is_finished());
        self.work_conns.push(task);
    }

    /// Aborts every bridge still running for this proxy.
    fn stop(&mut self) {
        for task in self.work_conns.drain(..) {
            task.abort();
        }
    }

    fn new_proxy_msg(&self) -> Message {
        Message::NewProxy(NewProxy {
            proxy_name: self.config.name.clone(),
            proxy_type: self.config.type_.clone(),
            use_encryption: self.config.use_encryption,
            use_compression: self.config.use_compression,
            metas: self.config.metas.clone(),
            remote_port: self.config.remote_port,
        })
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus {
            name: self.config.name.clone(),
            phase: self.phase,
            remote_addr: self.remote_addr.clone(),
            error: self.last_err.clone(),
        }
    }
}

/// Registered proxies of one control session.
pub struct ProxyManager {
    proxies: RwLock<BTreeMap<String, Wrapper>>,
    send_tx: mpsc::Sender<Message>,
    token: String,
}

impl ProxyManager {
    pub fn new(send_tx: mpsc::Sender<Message>, token: impl Into<String>) -> ProxyManager {
        ProxyManager {
            proxies: RwLock::new(BTreeMap::new()),
            send_tx,
            token: token.into(),
        }
    }

    async fn emit(&self, msgs: Vec<Message>) -> Result<(), Error> {
        for msg in msgs {
            self.send_tx
                .send(msg)
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }
        Ok(())
    }

    /// Brings the registered set in line with `desired`. Proxies that vanished
    /// or whose config changed are closed; new ones are registered.
    pub async fn reload(&self, desired: Vec<ProxyConfig>) -> Result<(), Error> {
        let desired: BTreeMap<String, ProxyConfig> = desired
            .into_iter()
            .map(|cfg| (cfg.name.clone(), cfg))
            .collect();

        let mut msgs = Vec::new();
        {
            let mut proxies = self.proxies.write().await;

            let stale: Vec<String> = proxies
                .iter()
                .filter(|(name, wrapper)| desired.get(*name) != Some(&wrapper.config))
                .map(|(name, _)| name.clone())
                .collect();
            for name in stale {
                if let Some(mut wrapper) = proxies.remove(&name) {
                    wrapper.stop();
                }
                info!("proxy {name} removed");
                msgs.push(Message::CloseProxy(CloseProxy { proxy_name: name }));
            }

            for (name, cfg) in desired {
                if proxies.contains_key(&name) {
                    continue;
                }
                let wrapper = Wrapper::new(cfg);
                msgs.push(wrapper.new_proxy_msg());
                info!("proxy {name} added");
                proxies.insert(name, wrapper);
            }
        }

        self.emit(msgs).await
    }

    /// Records the server's answer to a NewProxy request.
    pub async fn start_proxy(&self, name: &str, remote_addr: &str, server_err: &str) {
        let mut proxies = self.proxies.write().await;
        let Some(wrapper) = proxies.get_mut(name) else {
            debug!("start response for unknown proxy {name}");
            return;
        };
        wrapper.last_change = Instant::now();
        if server_err.is_empty() {
            wrapper.phase = ProxyPhase::Running;
            wrapper.remote_addr = remote_addr.to_string();
            wrapper.last_err.clear();
            info!("proxy {name} started, remote address {remote_addr}");
        } else {
            wrapper.phase = ProxyPhase::StartErr;
            wrapper.last_err = server_err.to_string();
            warn!("proxy {name} start error: {server_err}");
        }
    }

    /// Registers again every proxy that has been rejected for a while.
    pub async fn retry_failed(&self) -> Result<(), Error> {
        let mut msgs = Vec::new();
        {
            let mut proxies = self.proxies.write().await;
            for wrapper in proxies.values_mut() {
                if wrapper.phase == ProxyPhase::StartErr
                    && wrapper.last_change.elapsed() >= START_ERR_RETRY
                {
                    wrapper.phase = ProxyPhase::WaitStart;
                    wrapper.last_change = Instant::now();
                    msgs.push(wrapper.new_proxy_msg());
                }
            }
        }
        self.emit(msgs).await
    }

    /// Bridges a work connection to the proxy's local target. The bridge
    /// lives until either side closes or the proxy is removed.
    pub async fn handle_work_conn(&self, name: &str, conn: BoxedStream, start: StartWorkConn) {
        let mut proxies = self.proxies.write().await;
        let Some(wrapper) = proxies.get_mut(name) else {
            debug!("work connection for unknown proxy {name} dropped");
            return;
        };
        if !start.error.is_empty() {
            warn!("work connection for proxy {name} rejected: {}", start.error);
            return;
        }

        let config = wrapper.config.clone();
        let token = config.use_encryption.then(|| self.token.clone());
        let task = supervisor::go(format!("work conn {name}"), async move {
            let local = config.local_address();
            match TcpStream::connect(&local).await {
                Ok(local_conn) => {
                    debug!(
                        "proxy {} bridging {}:{} -> {local}",
                        config.name, start.src_addr, start.src_port
                    );
                    if let Err(err) = bridge(conn, local_conn, token).await {
                        debug!("proxy {} work connection ended: {err}", config.name);
                    }
                }
                Err(err) => warn!("proxy {} connect to {local} failed: {err}", config.name),
            }
        });
        wrapper.track(task);
    }

    pub async fn statuses(&self) -> Vec<ProxyStatus> {
        self.proxies
            .read()
            .await
            .values()
            .map(Wrapper::status)
            .collect()
    }

    pub async fn close(&self) {
        let mut proxies = self.proxies.write().await;
        for (name, wrapper) in proxies.iter_mut() {
            wrapper.stop();
            debug!("proxy {name} closed");
        }
        proxies.clear();
    }
}

async fn bridge(
    mut remote: BoxedStream,
    mut local: TcpStream,
    token: Option<String>,
) -> std::io::Result<()> {
    let Some(token) = token else {
        copy_bidirectional(&mut remote, &mut local).await?;
        return Ok(());
    };

    let (remote_read, remote_write) = split(remote);
    let (mut local_read, mut local_write) = local.into_split();
    let mut remote_read = CryptoReader::new(remote_read, token.as_bytes());
    let mut remote_write = CryptoWriter::new(remote_write, token.as_bytes());

    let upstream = async {
        copy(&mut local_read, &mut remote_write).await?;
        remote_write.shutdown().await
    };
    let downstream = async {
        copy(&mut remote_read, &mut local_write).await?;
        local_write.shutdown().await
    };
    tokio::try_join!(upstream, downstream)?;
    Ok(())
}
