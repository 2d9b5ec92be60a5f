//! Custom Resource Definitions for the KMM operator
//!
//! This module defines the Module CRD and the types it is composed of.

mod module;
pub mod types;

pub use module::{Module, ModuleSpec, ModuleStatus};
pub use types::*;
