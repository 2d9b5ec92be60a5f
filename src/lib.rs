//! KMM Operator: builds, signs and loads out-of-tree kernel modules
//!
//! This crate provides a Kubernetes operator that, for every kernel version
//! found among the nodes a Module targets, makes sure a module image exists
//! (building and signing it in-cluster when asked to) and runs a DaemonSet
//! loading the module on exactly those nodes.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod module;
pub mod registry;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
