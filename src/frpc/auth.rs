use std::collections::BTreeMap;

use md5::{Digest, Md5};
use serde::Deserialize;

use super::config::{AuthClientConfig, AuthMethod, AuthScope, OidcClientConfig};
use super::msg::{Login, NewWorkConn, Ping};
use crate::error::Error;

pub fn auth_key(token: &str, timestamp: i64) -> String {
    let digest = Md5::digest(format!("{token}{timestamp}").as_bytes());
    format!("{digest:x}")
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Client-credentials token source for OIDC authentication.
#[derive(Clone)]
pub struct OidcTokenSource {
    http: reqwest::Client,
    config: OidcClientConfig,
}

impl OidcTokenSource {
    pub fn new(config: OidcClientConfig) -> Self {
        OidcTokenSource {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn form(&self) -> BTreeMap<String, String> {
        let mut form = self.config.additional_endpoint_params.clone();
        form.insert("grant_type".to_string(), "client_credentials".to_string());
        form.insert("client_id".to_string(), self.config.client_id.clone());
        form.insert("client_secret".to_string(), self.config.client_secret.clone());
        if !self.config.audience.is_empty() {
            form.insert("audience".to_string(), self.config.audience.clone());
        }
        if !self.config.scope.is_empty() {
            form.insert("scope".to_string(), self.config.scope.clone());
        }
        form
    }

    pub async fn access_token(&self) -> Result<String, Error> {
        let resp = self
            .http
            .post(&self.config.token_endpoint_url)
            .form(&self.form())
            .send()
            .await
            .map_err(|err| Error::Auth(format!("oidc token request failed: {err}")))?;

        if !resp.status().is_success() {
            return Err(Error::Auth(format!(
                "oidc token endpoint returned {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|err| Error::Auth(format!("invalid oidc token response: {err}")))?;
        Ok(token.access_token)
    }
}

#[derive(Clone)]
enum Credentials {
    Token(String),
    Oidc(OidcTokenSource),
}

/// Fills in the privilege key of outgoing Login, Ping and NewWorkConn
/// messages according to the configured auth method and scopes.
#[derive(Clone)]
pub struct AuthSetter {
    credentials: Credentials,
    heartbeats: bool,
    new_work_conns: bool,
}

impl AuthSetter {
    pub fn new(config: &AuthClientConfig) -> Self {
        let credentials = match config.method {
            AuthMethod::Token => Credentials::Token(config.token.clone()),
            AuthMethod::Oidc => Credentials::Oidc(OidcTokenSource::new(config.oidc.clone())),
        };
        AuthSetter {
            credentials,
            heartbeats: config.has_scope(AuthScope::HeartBeats),
            new_work_conns: config.has_scope(AuthScope::NewWorkConns),
        }
    }

    async fn privilege_key(&self, timestamp: i64) -> Result<String, Error> {
        match &self.credentials {
            Credentials::Token(token) => Ok(auth_key(token, timestamp)),
            Credentials::Oidc(source) => source.access_token().await,
        }
    }

    pub async fn set_login(&self, login: &mut Login) -> Result<(), Error> {
        login.privilege_key = self.privilege_key(login.timestamp).await?;
        Ok(())
    }

    pub async fn set_ping(&self, ping: &mut Ping) -> Result<(), Error> {
        if !self.heartbeats {
            return Ok(());
        }
        ping.timestamp = unix_now();
        ping.privilege_key = self.privilege_key(ping.timestamp).await?;
        Ok(())
    }

    pub async fn set_new_work_conn(&self, msg: &mut NewWorkConn) -> Result<(), Error> {
        if !self.new_work_conns {
            return Ok(());
        }
        msg.timestamp = unix_now();
        msg.privilege_key = self.privilege_key(msg.timestamp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_config(scopes: Vec<AuthScope>) -> AuthClientConfig {
        AuthClientConfig {
            method: AuthMethod::Token,
            token: "T".to_string(),
            additional_scopes: scopes,
            ..AuthClientConfig::default()
        }
    }

    #[test]
    fn auth_key_is_md5_of_token_and_timestamp() {
        assert_eq!(auth_key("", 0), format!("{:x}", Md5::digest(b"0")));
        assert_eq!(auth_key("T", 1700000000).len(), 32);
        assert_ne!(auth_key("T", 1), auth_key("T", 2));
    }

    #[tokio::test]
    async fn login_always_carries_key() {
        let setter = AuthSetter::new(&token_config(vec![]));
        let mut login = Login {
            timestamp: 42,
            ..Login::default()
        };
        setter.set_login(&mut login).await.unwrap();
        assert_eq!(login.privilege_key, auth_key("T", 42));
    }

    #[tokio::test]
    async fn ping_key_requires_heartbeat_scope() {
        let mut ping = Ping::default();
        AuthSetter::new(&token_config(vec![]))
            .set_ping(&mut ping)
            .await
            .unwrap();
        assert!(ping.privilege_key.is_empty());

        AuthSetter::new(&token_config(vec![AuthScope::HeartBeats]))
            .set_ping(&mut ping)
            .await
            .unwrap();
        assert_eq!(ping.privilege_key, auth_key("T", ping.timestamp));
    }

    #[tokio::test]
    async fn work_conn_key_requires_scope() {
        let mut msg = NewWorkConn::default();
        AuthSetter::new(&token_config(vec![AuthScope::HeartBeats]))
            .set_new_work_conn(&mut msg)
            .await
            .unwrap();
        assert!(msg.privilege_key.is_empty());

        AuthSetter::new(&token_config(vec![AuthScope::NewWorkConns]))
            .set_new_work_conn(&mut msg)
            .await
            .unwrap();
        assert!(!msg.privilege_key.is_empty());
    }

    #[test]
    fn oidc_form_includes_extra_params() {
        let mut extra = BTreeMap::new();
        extra.insert("resource".to_string(), "frps".to_string());
        let source = OidcTokenSource::new(OidcClientConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            additional_endpoint_params: extra,
            ..OidcClientConfig::default()
        });
        let form = source.form();
        assert_eq!(form["grant_type"], "client_credentials");
        assert_eq!(form["resource"], "frps");
        assert!(!form.contains_key("audience"));
    }
}
