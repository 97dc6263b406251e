use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Default, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Token,
    Oidc,
}

impl FromStr for AuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "token" => Ok(AuthMethod::Token),
            "oidc" => Ok(AuthMethod::Oidc),
            other => Err(Error::InvalidConfig(format!("unsupported auth method {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum AuthScope {
    HeartBeats,
    NewWorkConns,
}

impl FromStr for AuthScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HeartBeats" => Ok(AuthScope::HeartBeats),
            "NewWorkConns" => Ok(AuthScope::NewWorkConns),
            other => Err(Error::InvalidConfig(format!("unsupported auth scope {other:?}"))),
        }
    }
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OidcClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
    pub scope: String,
    pub token_endpoint_url: String,
    pub additional_endpoint_params: BTreeMap<String, String>,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthClientConfig {
    pub method: AuthMethod,
    pub additional_scopes: Vec<AuthScope>,
    pub token: String,
    pub oidc: OidcClientConfig,
}

impl AuthClientConfig {
    pub fn has_scope(&self, scope: AuthScope) -> bool {
        self.additional_scopes.contains(&scope)
    }
}

#[derive(Default, Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Kcp,
    Quic,
    Websocket,
    Wss,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "tcp" => Ok(Protocol::Tcp),
            "kcp" => Ok(Protocol::Kcp),
            "quic" => Ok(Protocol::Quic),
            "websocket" => Ok(Protocol::Websocket),
            "wss" => Ok(Protocol::Wss),
            other => Err(Error::InvalidConfig(format!("unsupported protocol {other:?}"))),
        }
    }
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuicOptions {
    pub keepalive_period: i64,
    pub max_idle_timeout: i64,
    pub max_incoming_streams: i64,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsClientConfig {
    pub enable: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub trusted_ca_file: Option<PathBuf>,
    pub server_name: String,
    pub disable_custom_tls_first_byte: bool,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub protocol: Protocol,
    pub dial_server_timeout: i64,
    pub dial_server_keepalive: i64,
    pub connect_server_local_ip: String,
    pub proxy_url: String,
    pub pool_count: i32,
    pub tcp_mux: bool,
    pub tcp_mux_keepalive_interval: i64,
    pub quic: QuicOptions,
    pub heartbeat_interval: i64,
    pub heartbeat_timeout: i64,
    pub tls: TlsClientConfig,
}

fn positive_secs(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}

impl TransportConfig {
    pub fn dial_timeout(&self) -> Option<Duration> {
        positive_secs(self.dial_server_timeout)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        positive_secs(self.dial_server_keepalive)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        positive_secs(self.heartbeat_interval)
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        positive_secs(self.heartbeat_timeout)
    }

    pub fn mux_keepalive(&self) -> Option<Duration> {
        positive_secs(self.tcp_mux_keepalive_interval)
    }

    /// Ping period and pong deadline of the control session. The yamux
    /// session sends no pings of its own, so with TCPMux the keepalive
    /// interval is enforced through control heartbeats: a ping at least
    /// every interval, and the session is dead after two intervals
    /// without a pong.
    pub fn liveness(&self) -> (Option<Duration>, Option<Duration>) {
        let interval = self.heartbeat_interval();
        let plain = (interval, interval.and(self.heartbeat_timeout()));
        if !self.tcp_mux || self.protocol == Protocol::Quic {
            return plain;
        }
        match self.mux_keepalive() {
            Some(keepalive) => {
                let ping = interval.map_or(keepalive, |interval| interval.min(keepalive));
                (Some(ping), Some(keepalive * 2))
            }
            None => plain,
        }
    }
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientCommonConfig {
    pub auth: AuthClientConfig,
    pub user: String,
    pub server_addr: String,
    pub server_port: u16,
    pub nat_hole_stun_server: String,
    pub dns_server: String,
    pub login_fail_exit: bool,
    pub transport: TransportConfig,
    pub udp_packet_size: i64,
    pub metadatas: BTreeMap<String, String>,
}

impl ClientCommonConfig {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metas: BTreeMap<String, String>,
}

impl ProxyConfig {
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }
}
