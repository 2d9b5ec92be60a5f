//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::{api::Api, ResourceExt};
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::Module;

use super::dto::{
    ErrorResponse, HealthResponse, ModuleDetailResponse, ModuleListResponse, ModuleSummary,
    ReadyResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Liveness endpoint
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness endpoint, ready once the API server answers
#[instrument(skip(state))]
pub async fn readyz(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ReadyResponse>, ApiError> {
    match state.client.apiserver_version().await {
        Ok(_) => Ok(Json(ReadyResponse {
            status: "ready".to_string(),
            leader: state.is_leader.load(Ordering::Relaxed),
        })),
        Err(e) => {
            error!("API server unreachable: {:?}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new("not_ready", &e.to_string())),
            ))
        }
    }
}

fn summary(m: &Module) -> ModuleSummary {
    let status = m.status.clone().unwrap_or_default();
    ModuleSummary {
        name: m.name_any(),
        namespace: m.namespace().unwrap_or_default(),
        selector: m.spec.selector.clone(),
        desired_number: status.module_loader.desired_number,
        available_number: status.module_loader.available_number,
        device_plugin: m.spec.device_plugin.is_some(),
    }
}

/// List all Modules
#[instrument(skip(state))]
pub async fn list_modules(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ModuleListResponse>, ApiError> {
    let api: Api<Module> = Api::all(state.client.clone());

    match api.list(&Default::default()).await {
        Ok(modules) => {
            let items: Vec<ModuleSummary> = modules.items.iter().map(summary).collect();
            let total = items.len();
            Ok(Json(ModuleListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list modules: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Get a specific Module
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_module(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ModuleDetailResponse>, ApiError> {
    let api: Api<Module> = Api::namespaced(state.client.clone(), &namespace);

    match api.get(&name).await {
        Ok(module) => Ok(Json(ModuleDetailResponse {
            name: module.name_any(),
            namespace: module.namespace().unwrap_or_default(),
            module_name: module.spec.module_loader.container.modprobe.module_name.clone(),
            kernel_mappings: module.spec.module_loader.container.kernel_mappings.len(),
            in_cluster_build: module.spec.is_build_capable(),
            in_cluster_sign: module.spec.is_sign_capable(),
            status: module.status.clone().unwrap_or_default(),
            created_at: module.metadata.creation_timestamp.map(|t| t.0.to_rfc3339()),
        })),
        Err(kube::Error::Api(e)) if e.code == 404 => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("Module {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get module {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}
