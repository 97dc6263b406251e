//! Admission webhook for FrpServer: defaulting, validation with a live
//! login probe, and delete protection for servers still in use.

pub mod frpserver;

use std::{net::SocketAddr, sync::Arc};

use axum::{routing::post, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Service;
use log::info;

use crate::{config::Webhook, controllers::store::ObjectStore, probe::Prober};

pub const MUTATE_PATH: &str = "/mutate-frp-gofrp-io-v1beta1-frpserver";
pub const VALIDATE_PATH: &str = "/validate-frp-gofrp-io-v1beta1-frpserver";

pub struct WebhookState {
    pub prober: Arc<dyn Prober>,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub deny_delete_when_referenced: bool,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(frpserver::mutate_handler))
        .route(VALIDATE_PATH, post(frpserver::validate_handler))
        .with_state(state)
}

pub async fn serve(options: &Webhook, state: Arc<WebhookState>) -> anyhow::Result<()> {
    let addr: SocketAddr = options.bind_address.parse()?;
    let tls = RustlsConfig::from_pem_file(&options.cert_file, &options.key_file).await?;
    info!("serving admission webhook on {addr}");
    axum_server::bind_rustls(addr, tls)
        .serve(router(state).into_make_service())
        .await?;
    Ok(())
}
