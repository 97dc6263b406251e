use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{PatchOperation, ReplaceOperation};
use kube::{
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    ResourceExt,
};
use log::{error, info, warn};

use super::WebhookState;
use crate::{
    controllers::service::frp_server_name,
    crd::{FrpServer, FrpServerSpec, SUPPORTED_AUTH_METHODS, SUPPORTED_AUTH_SCOPES, SUPPORTED_PROTOCOLS},
};

/// Field-level problems with an FrpServer spec, plus warnings that do not
/// block admission.
#[derive(Debug, Default)]
pub struct Findings {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Warnings for TLS fields that are ignored because TLS is off.
fn redundant_tls_fields(spec: &FrpServerSpec) -> Vec<String> {
    let tls = &spec.transport.tls;
    if tls.enabled() {
        return Vec::new();
    }
    let mut warnings = Vec::new();
    if tls.secret_ref.as_ref().is_some_and(|r| !r.is_empty()) {
        warnings.push("spec.transport.tls.secretRef is ignored when tls is disabled".to_string());
    }
    for (field, value) in [
        ("caFileName", &tls.ca_file_name),
        ("certFileName", &tls.cert_file_name),
        ("keyFileName", &tls.key_file_name),
    ] {
        if value.is_some() {
            warnings.push(format!("spec.transport.tls.{field} is ignored when tls is disabled"));
        }
    }
    warnings
}

pub fn validate_spec(raw: &FrpServerSpec) -> Findings {
    let mut findings = Findings {
        warnings: redundant_tls_fields(raw),
        ..Findings::default()
    };
    let errors = &mut findings.errors;

    let mut spec = raw.clone();
    spec.apply_defaults();

    if spec.server_addr.trim().is_empty() {
        errors.push("spec.serverAddr: must not be empty".to_string());
    }
    if spec.server_port == Some(0) {
        errors.push("spec.serverPort: must be between 1 and 65535".to_string());
    }
    if spec.external_ips.is_empty() {
        errors.push("spec.externalIPs: at least one address is required".to_string());
    }
    if spec.external_ips.iter().any(|ip| ip.trim().is_empty()) {
        errors.push("spec.externalIPs: entries must not be empty".to_string());
    }

    let auth = &spec.auth;
    let method = auth.method.as_deref().unwrap_or_default();
    if !SUPPORTED_AUTH_METHODS.contains(&method) {
        errors.push(format!(
            "spec.auth.method: unsupported value {method:?}, expected one of {SUPPORTED_AUTH_METHODS:?}"
        ));
    }
    if method == "token" && auth.token.as_deref().unwrap_or_default().is_empty() {
        errors.push("spec.auth.token: required when spec.auth.method is token".to_string());
    }
    if method == "oidc" {
        let oidc = auth.oidc.clone().unwrap_or_default();
        if oidc.client_id.is_empty() {
            errors.push("spec.auth.oidc.clientID: required when spec.auth.method is oidc".to_string());
        }
        if oidc.token_endpoint_url.is_empty() {
            errors.push(
                "spec.auth.oidc.tokenEndpointURL: required when spec.auth.method is oidc".to_string(),
            );
        } else if url::Url::parse(&oidc.token_endpoint_url).is_err() {
            errors.push("spec.auth.oidc.tokenEndpointURL: not a valid URL".to_string());
        }
    }
    for scope in auth.additional_scopes.iter().flatten() {
        if !SUPPORTED_AUTH_SCOPES.contains(&scope.as_str()) {
            errors.push(format!(
                "spec.auth.additionalScopes: unsupported scope {scope:?}, expected a subset of {SUPPORTED_AUTH_SCOPES:?}"
            ));
        }
    }

    let transport = &spec.transport;
    let protocol = transport.protocol.as_deref().unwrap_or_default();
    if !SUPPORTED_PROTOCOLS.contains(&protocol) {
        errors.push(format!(
            "spec.transport.protocol: unsupported value {protocol:?}, expected one of {SUPPORTED_PROTOCOLS:?}"
        ));
    }
    if let (Some(interval), Some(timeout)) = (transport.heartbeat_interval, transport.heartbeat_timeout) {
        if interval > 0 && timeout > 0 && timeout < interval {
            errors.push(format!(
                "spec.transport.heartbeatTimeout: {timeout} must not be less than heartbeatInterval {interval}"
            ));
        }
    }
    if let Some(proxy_url) = transport.proxy_url.as_deref().filter(|u| !u.is_empty()) {
        match url::Url::parse(proxy_url) {
            Ok(url) if matches!(url.scheme(), "http" | "socks5") => {}
            Ok(url) => errors.push(format!(
                "spec.transport.proxyURL: unsupported scheme {:?}",
                url.scheme()
            )),
            Err(err) => errors.push(format!("spec.transport.proxyURL: {err}")),
        }
    }
    if let Some(local_ip) = transport.connect_server_local_ip.as_deref().filter(|ip| !ip.is_empty()) {
        if local_ip.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("spec.transport.connectServerLocalIP: {local_ip:?} is not an IP"));
        }
    }
    if let Some(secret_ref) = &raw.transport.tls.secret_ref {
        if secret_ref.namespace.is_empty() != secret_ref.name.is_empty() {
            errors.push(
                "spec.transport.tls.secretRef: namespace and name must be set together".to_string(),
            );
        }
    }

    findings
}

fn request_from(review: AdmissionReview<FrpServer>) -> Result<AdmissionRequest<FrpServer>, AdmissionResponse> {
    review.try_into().map_err(|err: kube::core::admission::ConvertAdmissionReviewError| {
        error!("invalid admission review: {err}");
        AdmissionResponse::invalid(err.to_string())
    })
}

pub async fn mutate_handler(
    Json(review): Json<AdmissionReview<FrpServer>>,
) -> Json<AdmissionReview<kube::core::DynamicObject>> {
    let response = match request_from(review) {
        Ok(req) => mutate(&req),
        Err(response) => response,
    };
    Json(response.into_review())
}

pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<FrpServer>>,
) -> Json<AdmissionReview<kube::core::DynamicObject>> {
    let response = match request_from(review) {
        Ok(req) => validate(&state, &req).await,
        Err(response) => response,
    };
    Json(response.into_review())
}

/// Fills defaulted fields by replacing `/spec` wholesale, which stays valid
/// however sparse the submitted object is.
pub fn mutate(req: &AdmissionRequest<FrpServer>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(server) = &req.object else {
        return response;
    };

    let mut spec = server.spec.clone();
    spec.apply_defaults();
    if spec == server.spec {
        return response;
    }
    let value = match serde_json::to_value(&spec) {
        Ok(value) => value,
        Err(err) => return response.deny(format!("serializing frp server spec failed: {err}")),
    };
    let patch = json_patch::Patch(vec![PatchOperation::Replace(ReplaceOperation {
        path: "/spec".to_string(),
        value,
    })]);
    match response.clone().with_patch(patch) {
        Ok(patched) => patched,
        Err(err) => response.deny(format!("serializing patch failed: {err}")),
    }
}

pub async fn validate(state: &WebhookState, req: &AdmissionRequest<FrpServer>) -> AdmissionResponse {
    match req.operation {
        Operation::Create | Operation::Update => match &req.object {
            Some(server) => validate_upsert(state, req, server).await,
            None => AdmissionResponse::from(req),
        },
        Operation::Delete => match &req.old_object {
            Some(server) => validate_delete(state, req, server).await,
            None => AdmissionResponse::from(req),
        },
        Operation::Connect => AdmissionResponse::from(req),
    }
}

fn with_warnings(mut response: AdmissionResponse, warnings: Vec<String>) -> AdmissionResponse {
    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    response
}

async fn validate_upsert(
    state: &WebhookState,
    req: &AdmissionRequest<FrpServer>,
    server: &FrpServer,
) -> AdmissionResponse {
    let name = server.name_any();
    let findings = validate_spec(&server.spec);
    let response = with_warnings(AdmissionResponse::from(req), findings.warnings);
    if !findings.errors.is_empty() {
        info!("rejecting frp server {name}: {}", findings.errors.join("; "));
        return response.deny(findings.errors.join("; "));
    }

    match state.prober.probe(server).await {
        Ok(()) => response,
        Err(failure) => {
            info!("frp server {name} failed its login probe: {}", failure.message());
            response.deny(format!(
                "spec: login to {}:{} failed ({}): {}",
                server.spec.server_addr,
                server.spec.server_port.unwrap_or(crate::crd::DEFAULT_SERVER_PORT),
                failure.reason(),
                failure.message()
            ))
        }
    }
}

async fn validate_delete(
    state: &WebhookState,
    req: &AdmissionRequest<FrpServer>,
    server: &FrpServer,
) -> AdmissionResponse {
    let name = server.name_any();
    let references = server
        .status
        .as_ref()
        .map(|status| status.service_references.clone())
        .unwrap_or_default();

    let mut in_use = Vec::new();
    for reference in references {
        let (Some(namespace), Some(svc_name)) = (reference.namespace, reference.name) else {
            continue;
        };
        match state.services.get(&namespace, &svc_name).await {
            Ok(svc) if frp_server_name(&svc) == Some(name.as_str()) => {
                in_use.push(format!("{namespace}/{svc_name}"));
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                return AdmissionResponse::from(req)
                    .deny(format!("checking service {namespace}/{svc_name} failed: {err}"));
            }
        }
    }

    if in_use.is_empty() {
        return AdmissionResponse::from(req);
    }
    let message = format!("frp server {name} is still used by services {}", in_use.join(", "));
    if state.deny_delete_when_referenced {
        AdmissionResponse::from(req).deny(message)
    } else {
        warn!("{message}");
        with_warnings(AdmissionResponse::from(req), vec![message])
    }
}
