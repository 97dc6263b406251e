use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const ANNOTATION_FRP_SERVER_NAME: &str = "service.beta.kubernetes.io/frp-server-name";
pub const LABEL_SERVICE_NAME: &str = "gofrp.io/service-name";
pub const LABEL_CONTROLLER_UID: &str = "gofrp.io/controller-uid";
pub const FINALIZER_TRACKING: &str = "finalizer.gofrp.io/tracking";

pub const DEFAULT_SERVER_PORT: u16 = 7000;
pub const DEFAULT_PROTOCOL: &str = "tcp";
pub const DEFAULT_AUTH_METHOD: &str = "token";
pub const DEFAULT_DIAL_SERVER_TIMEOUT: i64 = 10;
pub const DEFAULT_DIAL_SERVER_KEEPALIVE: i64 = 7200;
pub const DEFAULT_POOL_COUNT: i32 = 1;
pub const DEFAULT_TCP_MUX: bool = true;
pub const DEFAULT_TCP_MUX_KEEPALIVE_INTERVAL: i64 = 60;
pub const DEFAULT_HEARTBEAT_INTERVAL: i64 = 30;
pub const DEFAULT_HEARTBEAT_TIMEOUT: i64 = 90;
pub const DEFAULT_UDP_PACKET_SIZE: i64 = 1500;
pub const DEFAULT_QUIC_KEEPALIVE_PERIOD: i64 = 10;
pub const DEFAULT_QUIC_MAX_IDLE_TIMEOUT: i64 = 30;
pub const DEFAULT_QUIC_MAX_INCOMING_STREAMS: i64 = 100000;
pub const DEFAULT_TLS_CA_FILE_NAME: &str = "tls.ca";
pub const DEFAULT_TLS_CERT_FILE_NAME: &str = "tls.crt";
pub const DEFAULT_TLS_KEY_FILE_NAME: &str = "tls.key";

pub const SUPPORTED_PROTOCOLS: [&str; 5] = ["tcp", "kcp", "quic", "websocket", "wss"];
pub const SUPPORTED_AUTH_METHODS: [&str; 2] = ["token", "oidc"];
pub const SUPPORTED_AUTH_SCOPES: [&str; 2] = ["HeartBeats", "NewWorkConns"];

#[derive(CustomResource, Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "frp.gofrp.io",
    version = "v1beta1",
    kind = "FrpServer",
    status = "FrpServerStatus",
    shortname = "frps",
    printcolumn = r#"{"name":"Server", "type":"string", "jsonPath":".spec.serverAddr"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FrpServerSpec {
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub server_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, rename = "externalIPs")]
    pub external_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_hole_stun_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_fail_exit: Option<bool>,
    #[serde(default)]
    pub transport: TransportSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_packet_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadatas: Option<BTreeMap<String, String>>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// One of `token` or `oidc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcSpec>,
    /// Subset of `HeartBeats` and `NewWorkConns`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_scopes: Option<Vec<String>>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OidcSpec {
    #[serde(default, rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default, rename = "tokenEndpointURL")]
    pub token_endpoint_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_endpoint_params: Option<BTreeMap<String, String>>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransportSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_server_timeout: Option<i64>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_server_keepalive: Option<i64>,
    #[serde(default, rename = "connectServerLocalIP", skip_serializing_if = "Option::is_none")]
    pub connect_server_local_ip: Option<String>,
    #[serde(default, rename = "proxyURL", skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_mux: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_mux_keepalive_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quic: Option<QuicSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<i64>,
    #[serde(default)]
    pub tls: TlsSpec,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuicSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_period: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_incoming_streams: Option<i64>,
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(
        default,
        rename = "disableCustomTLSFirstByte",
        skip_serializing_if = "Option::is_none"
    )]
    pub disable_custom_tls_first_byte: Option<bool>,
}

impl TlsSpec {
    pub fn enabled(&self) -> bool {
        self.enable.unwrap_or(false)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl SecretRef {
    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.name.is_empty()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    Pending,
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Healthy => write!(f, "Healthy"),
            Phase::Unhealthy => write!(f, "Unhealthy"),
            Phase::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FrpServerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_references: Vec<ObjectReference>,
}

impl FrpServerSpec {
    /// Fills every unset field that has a default. Applying it twice is the
    /// same as applying it once.
    pub fn apply_defaults(&mut self) {
        self.auth
            .method
            .get_or_insert_with(|| DEFAULT_AUTH_METHOD.to_string());
        self.server_port.get_or_insert(DEFAULT_SERVER_PORT);
        self.login_fail_exit.get_or_insert(true);
        self.udp_packet_size.get_or_insert(DEFAULT_UDP_PACKET_SIZE);

        let transport = &mut self.transport;
        let protocol = transport
            .protocol
            .get_or_insert_with(|| DEFAULT_PROTOCOL.to_string());
        if protocol.as_str() == "quic" {
            let quic = transport.quic.get_or_insert_with(QuicSpec::default);
            quic.keepalive_period
                .get_or_insert(DEFAULT_QUIC_KEEPALIVE_PERIOD);
            quic.max_idle_timeout
                .get_or_insert(DEFAULT_QUIC_MAX_IDLE_TIMEOUT);
            quic.max_incoming_streams
                .get_or_insert(DEFAULT_QUIC_MAX_INCOMING_STREAMS);
        }
        transport
            .dial_server_timeout
            .get_or_insert(DEFAULT_DIAL_SERVER_TIMEOUT);
        transport
            .dial_server_keepalive
            .get_or_insert(DEFAULT_DIAL_SERVER_KEEPALIVE);
        transport.pool_count.get_or_insert(DEFAULT_POOL_COUNT);
        transport.tcp_mux.get_or_insert(DEFAULT_TCP_MUX);
        transport
            .tcp_mux_keepalive_interval
            .get_or_insert(DEFAULT_TCP_MUX_KEEPALIVE_INTERVAL);
        transport
            .heartbeat_interval
            .get_or_insert(DEFAULT_HEARTBEAT_INTERVAL);
        transport
            .heartbeat_timeout
            .get_or_insert(DEFAULT_HEARTBEAT_TIMEOUT);

        let tls = &mut transport.tls;
        tls.disable_custom_tls_first_byte.get_or_insert(true);
        if !tls.enabled() {
            tls.secret_ref = None;
            tls.ca_file_name = None;
            tls.cert_file_name = None;
            tls.key_file_name = None;
        } else if tls.secret_ref.as_ref().is_some_and(|r| !r.is_empty()) {
            tls.ca_file_name
                .get_or_insert_with(|| DEFAULT_TLS_CA_FILE_NAME.to_string());
            tls.cert_file_name
                .get_or_insert_with(|| DEFAULT_TLS_CERT_FILE_NAME.to_string());
            tls.key_file_name
                .get_or_insert_with(|| DEFAULT_TLS_KEY_FILE_NAME.to_string());
        }
    }
}

impl FrpServer {
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .and_then(|status| status.phase)
            .unwrap_or_default()
    }
}
