//! Response bodies of the REST API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crd::ModuleStatus;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: String,
    /// Whether this replica currently reconciles Modules
    pub leader: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSummary {
    pub name: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
    pub desired_number: i32,
    pub available_number: i32,
    pub device_plugin: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleListResponse {
    pub items: Vec<ModuleSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDetailResponse {
    pub name: String,
    pub namespace: String,
    pub module_name: String,
    pub kernel_mappings: usize,
    pub in_cluster_build: bool,
    pub in_cluster_sign: bool,
    pub status: ModuleStatus,
    pub created_at: Option<String>,
}
