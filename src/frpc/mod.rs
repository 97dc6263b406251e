//! In-process FRP client: transport dialing, the login handshake, the
//! control session and the proxies registered through it.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use log::{info, warn};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use self::auth::AuthSetter;
use self::backoff::FastBackoff;
use self::config::{ClientCommonConfig, ProxyConfig};
use self::control::{login, Control};
use self::proxy::ProxyStatus;
use self::transport::Connector;

pub mod auth;
pub mod backoff;
pub mod config;
pub mod control;
pub mod crypto;
pub mod msg;
pub mod proxy;
pub mod supervisor;
pub mod transport;

/// Logs in once and disconnects. Used to check an FrpServer before it is
/// accepted or marked healthy.
pub async fn probe(config: ClientCommonConfig) -> Result<(), Error> {
    let config = Arc::new(config);
    let connector = Connector::new(config.clone());
    let auth = AuthSetter::new(&config.auth);
    let result = login(&config, &connector, &auth, "").await;
    connector.close();
    result.map(|_| ())
}

/// Keeps a control session to frps alive, logging in again with backoff
/// whenever the session drops.
pub struct Client {
    config: Arc<ClientCommonConfig>,
    proxies: RwLock<Vec<ProxyConfig>>,
    control: Mutex<Option<Arc<Control>>>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: ClientCommonConfig, proxies: Vec<ProxyConfig>) -> Arc<Client> {
        Arc::new(Client {
            config: Arc::new(config),
            proxies: RwLock::new(proxies),
            control: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ClientCommonConfig {
        &self.config
    }

    fn current(&self) -> Option<Arc<Control>> {
        self.control.lock().ok().and_then(|control| control.clone())
    }

    fn set_current(&self, control: Option<Arc<Control>>) {
        if let Ok(mut slot) = self.control.lock() {
            *slot = control;
        }
    }

    /// Replaces the proxy set, applying it to the live session if any.
    pub async fn reload(&self, proxies: Vec<ProxyConfig>) -> Result<(), Error> {
        *self.proxies.write().await = proxies.clone();
        match self.current() {
            Some(control) => control.reload(proxies).await,
            None => Ok(()),
        }
    }

    pub async fn statuses(&self) -> Vec<ProxyStatus> {
        match self.current() {
            Some(control) => control.proxy_statuses().await,
            None => Vec::new(),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(control) = self.current() {
            control.close();
        }
    }

    /// Runs until [`Client::stop`] is called. Fails only when the very first
    /// login fails and `loginFailExit` is set.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let mut backoff = FastBackoff::default();
        let mut run_id = String::new();
        let mut logged_in_once = false;
        let server = self.config.server_address();

        while !self.cancel.is_cancelled() {
            let connector = Arc::new(Connector::new(self.config.clone()));
            let auth = AuthSetter::new(&self.config.auth);

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = login(&self.config, &connector, &auth, &run_id) => attempt,
            };

            match attempt {
                Ok((conn, resp)) => {
                    logged_in_once = true;
                    run_id = resp.run_id;
                    info!("login to server {server} success, get run id [{run_id}]");

                    let control = Control::new(run_id.clone(), self.config.clone(), connector, auth);
                    self.set_current(Some(control.clone()));
                    let proxies = self.proxies.read().await.clone();

                    let mut session = tokio::spawn(control.clone().run(conn, proxies));
                    let joined = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            control.close();
                            session.await
                        }
                        joined = &mut session => joined,
                    };
                    if let Err(err) = joined {
                        warn!("control session task failed: {err}");
                    }
                    self.set_current(None);
                }
                Err(err) => {
                    connector.close();
                    if !logged_in_once && self.config.login_fail_exit {
                        return Err(err);
                    }
                    warn!("connect to server {server} failed: {err}");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            let delay = backoff.next_delay(Instant::now());
            info!("reconnecting to server {server} in {delay:?}");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(control) = self.current() {
            control.close();
        }
        info!("client for {server} stopped");
        Ok(())
    }
}
