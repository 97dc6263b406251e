//! Turns an FrpServer into a ready-to-dial client config. TLS material from
//! the referenced Secret is written to temp files owned by the returned
//! [`Synthesized`] handle and removed when the handle goes away.

use std::{io::Write, path::PathBuf, str::FromStr};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, ResourceExt};
use log::{debug, warn};
use tempfile::TempPath;

use crate::crd::{FrpServer, SecretRef};
use crate::error::Error;
use crate::frpc::config::{
    AuthClientConfig, AuthMethod, AuthScope, ClientCommonConfig, OidcClientConfig, Protocol,
    QuicOptions, TlsClientConfig, TransportConfig,
};

#[async_trait]
pub trait SecretGetter: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error>;
}

#[async_trait]
impl SecretGetter for kube::Client {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        Ok(api.get(name).await?)
    }
}

/// A synthesized config together with the temp files it points at.
#[derive(Debug)]
pub struct Synthesized {
    pub config: ClientCommonConfig,
    files: Vec<TempPath>,
}

impl Synthesized {
    pub fn files(&self) -> impl Iterator<Item = &std::path::Path> {
        self.files.iter().map(|path| &**path)
    }

    /// Removes the temp files. Dropping the handle does the same, minus the
    /// error reporting.
    pub fn release(self) {
        for path in self.files {
            let display = path.display().to_string();
            if let Err(err) = path.close() {
                warn!("removing tls file {display} failed: {err}");
            }
        }
    }
}

fn write_temp(prefix: &str, contents: &[u8]) -> Result<TempPath, Error> {
    let mut file = tempfile::Builder::new().prefix(prefix).tempfile()?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

struct TlsFiles {
    ca: Option<PathBuf>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
}

async fn materialize_tls(
    secrets: &dyn SecretGetter,
    secret_ref: &SecretRef,
    ca_name: &str,
    cert_name: &str,
    key_name: &str,
    files: &mut Vec<TempPath>,
) -> Result<TlsFiles, Error> {
    let secret = secrets
        .get_secret(&secret_ref.namespace, &secret_ref.name)
        .await?;
    let data = secret.data.unwrap_or_default();
    let missing = |key: &str| Error::SecretMaterial {
        namespace: secret_ref.namespace.clone(),
        name: secret_ref.name.clone(),
        reason: format!("missing key {key:?}"),
    };

    let mut out = TlsFiles {
        ca: None,
        cert: None,
        key: None,
    };

    if let Some(ca) = data.get(ca_name) {
        let path = write_temp("frp-tls-ca-", &ca.0)?;
        out.ca = Some(path.to_path_buf());
        files.push(path);
    }

    let cert = data.get(cert_name).ok_or_else(|| missing(cert_name))?;
    let key = data.get(key_name).ok_or_else(|| missing(key_name))?;

    let path = write_temp("frp-tls-crt-", &cert.0)?;
    out.cert = Some(path.to_path_buf());
    files.push(path);

    let path = write_temp("frp-tls-key-", &key.0)?;
    out.key = Some(path.to_path_buf());
    files.push(path);

    Ok(out)
}

fn parse_scopes(scopes: &[String]) -> Result<Vec<AuthScope>, Error> {
    scopes.iter().map(|scope| AuthScope::from_str(scope)).collect()
}

/// Maps `server` to a fully defaulted client config. On error every temp
/// file written so far is already gone.
pub async fn synthesize(
    server: &FrpServer,
    secrets: &dyn SecretGetter,
) -> Result<Synthesized, Error> {
    let mut spec = server.spec.clone();
    spec.apply_defaults();

    let auth_spec = &spec.auth;
    let oidc = auth_spec.oidc.clone().unwrap_or_default();
    let auth = AuthClientConfig {
        method: AuthMethod::from_str(auth_spec.method.as_deref().unwrap_or_default())?,
        additional_scopes: parse_scopes(auth_spec.additional_scopes.as_deref().unwrap_or_default())?,
        token: auth_spec.token.clone().unwrap_or_default(),
        oidc: OidcClientConfig {
            client_id: oidc.client_id,
            client_secret: oidc.client_secret,
            audience: oidc.audience,
            scope: oidc.scope,
            token_endpoint_url: oidc.token_endpoint_url,
            additional_endpoint_params: oidc.additional_endpoint_params.unwrap_or_default(),
        },
    };

    let t = &spec.transport;
    let quic = t.quic.clone().unwrap_or_default();
    let tls_spec = &t.tls;

    let mut files = Vec::new();
    let mut tls = TlsClientConfig {
        enable: tls_spec.enabled(),
        server_name: tls_spec.server_name.clone().unwrap_or_default(),
        disable_custom_tls_first_byte: tls_spec.disable_custom_tls_first_byte.unwrap_or(true),
        ..TlsClientConfig::default()
    };
    if let Some(secret_ref) = tls_spec.secret_ref.as_ref().filter(|r| !r.is_empty()) {
        if tls.enable {
            let material = materialize_tls(
                secrets,
                secret_ref,
                tls_spec.ca_file_name.as_deref().unwrap_or_default(),
                tls_spec.cert_file_name.as_deref().unwrap_or_default(),
                tls_spec.key_file_name.as_deref().unwrap_or_default(),
                &mut files,
            )
            .await?;
            tls.trusted_ca_file = material.ca;
            tls.cert_file = material.cert;
            tls.key_file = material.key;
            debug!(
                "materialized tls secret {}/{} for {}",
                secret_ref.namespace,
                secret_ref.name,
                server.name_any()
            );
        }
    }

    let transport = TransportConfig {
        protocol: Protocol::from_str(t.protocol.as_deref().unwrap_or_default())?,
        dial_server_timeout: t.dial_server_timeout.unwrap_or_default(),
        dial_server_keepalive: t.dial_server_keepalive.unwrap_or_default(),
        connect_server_local_ip: t.connect_server_local_ip.clone().unwrap_or_default(),
        proxy_url: t.proxy_url.clone().unwrap_or_default(),
        pool_count: t.pool_count.unwrap_or_default(),
        tcp_mux: t.tcp_mux.unwrap_or_default(),
        tcp_mux_keepalive_interval: t.tcp_mux_keepalive_interval.unwrap_or_default(),
        quic: QuicOptions {
            keepalive_period: quic.keepalive_period.unwrap_or_default(),
            max_idle_timeout: quic.max_idle_timeout.unwrap_or_default(),
            max_incoming_streams: quic.max_incoming_streams.unwrap_or_default(),
        },
        heartbeat_interval: t.heartbeat_interval.unwrap_or_default(),
        heartbeat_timeout: t.heartbeat_timeout.unwrap_or_default(),
        tls,
    };

    let config = ClientCommonConfig {
        auth,
        user: spec.user.clone().unwrap_or_default(),
        server_addr: spec.server_addr.clone(),
        server_port: spec.server_port.unwrap_or_default(),
        nat_hole_stun_server: spec.nat_hole_stun_server.clone().unwrap_or_default(),
        dns_server: spec.dns_server.clone().unwrap_or_default(),
        login_fail_exit: spec.login_fail_exit.unwrap_or(true),
        transport,
        udp_packet_size: spec.udp_packet_size.unwrap_or_default(),
        metadatas: spec.metadatas.clone().unwrap_or_default(),
    };

    Ok(Synthesized { config, files })
}
