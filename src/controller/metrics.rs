//! Prometheus metrics for the KMM operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `kmm_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `kmm_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `kmm_module_num` (gauge): number of Modules in the cluster.
//! - `kmm_in_cluster_build_num` (gauge): Modules declaring an in-cluster build.
//! - `kmm_in_cluster_sign_num` (gauge): Modules declaring in-cluster signing.
//! - `kmm_device_plugin_num` (gauge): Modules declaring a device plugin.
//! - `kmm_modprobe_args` / `kmm_modprobe_raw_args` (gauge): modprobe load arguments per Module.
//! - `kmm_stage_results_total` (counter): build and sign outcomes labeled by stage and result.
//! - `kmm_garbage_collected_total` (counter): objects deleted by garbage collection, by kind.

use std::sync::atomic::{AtomicI64, AtomicU64};

use kube::ResourceExt;
use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::Module;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "module"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see [`crate::Error::kind`]
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModprobeLabels {
    pub namespace: String,
    pub name: String,
    pub args: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    /// "build" or "sign"
    pub stage: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GcLabels {
    /// "daemonset", "build" or "sign"
    pub kind: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static MODULE_NUM: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static IN_CLUSTER_BUILD_NUM: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static IN_CLUSTER_SIGN_NUM: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static DEVICE_PLUGIN_NUM: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

pub static MODPROBE_ARGS: Lazy<Family<ModprobeLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static MODPROBE_RAW_ARGS: Lazy<Family<ModprobeLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static STAGE_RESULTS_TOTAL: Lazy<Family<StageLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static GARBAGE_COLLECTED_TOTAL: Lazy<Family<GcLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    // counters get their `_total` suffix from the encoder

    registry.register(
        "kmm_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "kmm_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry.register(
        "kmm_module_num",
        "Number of existing KMM Modules",
        MODULE_NUM.clone(),
    );
    registry.register(
        "kmm_in_cluster_build_num",
        "Number of KMM Modules with in-cluster build defined",
        IN_CLUSTER_BUILD_NUM.clone(),
    );
    registry.register(
        "kmm_in_cluster_sign_num",
        "Number of KMM Modules with in-cluster sign defined",
        IN_CLUSTER_SIGN_NUM.clone(),
    );
    registry.register(
        "kmm_device_plugin_num",
        "Number of KMM Modules with a device plugin defined",
        DEVICE_PLUGIN_NUM.clone(),
    );
    registry.register(
        "kmm_modprobe_args",
        "modprobe load arguments of a Module",
        MODPROBE_ARGS.clone(),
    );
    registry.register(
        "kmm_modprobe_raw_args",
        "modprobe raw load arguments of a Module",
        MODPROBE_RAW_ARGS.clone(),
    );

    registry.register(
        "kmm_stage_results",
        "Build and sign stage outcomes",
        STAGE_RESULTS_TOTAL.clone(),
    );
    registry.register(
        "kmm_garbage_collected",
        "Objects deleted by garbage collection",
        GARBAGE_COLLECTED_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_stage_result(stage: &str, result: &str) {
    let labels = StageLabels {
        stage: stage.to_string(),
        result: result.to_string(),
    };
    STAGE_RESULTS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_garbage_collected(kind: &str, count: usize) {
    let labels = GcLabels {
        kind: kind.to_string(),
    };
    GARBAGE_COLLECTED_TOTAL
        .get_or_create(&labels)
        .inc_by(count as u64);
}

/// Inventory counts over a set of Modules
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ModuleInventory {
    pub modules: i64,
    pub with_build: i64,
    pub with_sign: i64,
    pub with_device_plugin: i64,
}

impl ModuleInventory {
    pub fn from_modules(modules: &[Module]) -> Self {
        let mut inventory = Self {
            modules: modules.len() as i64,
            ..Default::default()
        };
        for module in modules {
            if module.spec.is_build_capable() {
                inventory.with_build += 1;
            }
            if module.spec.is_sign_capable() {
                inventory.with_sign += 1;
            }
            if module.spec.device_plugin.is_some() {
                inventory.with_device_plugin += 1;
            }
        }
        inventory
    }
}

/// Refresh the Module inventory gauges
pub fn set_module_inventory(modules: &[Module]) {
    let inventory = ModuleInventory::from_modules(modules);
    MODULE_NUM.set(inventory.modules);
    IN_CLUSTER_BUILD_NUM.set(inventory.with_build);
    IN_CLUSTER_SIGN_NUM.set(inventory.with_sign);
    DEVICE_PLUGIN_NUM.set(inventory.with_device_plugin);

    MODPROBE_ARGS.clear();
    MODPROBE_RAW_ARGS.clear();
    for module in modules {
        let modprobe = &module.spec.module_loader.container.modprobe;
        let labels = |args: &[String]| ModprobeLabels {
            namespace: module.namespace().unwrap_or_default(),
            name: module.name_any(),
            args: args.join(","),
        };
        if let Some(args) = &modprobe.args {
            MODPROBE_ARGS.get_or_create(&labels(&args.load)).set(1);
        }
        if let Some(raw) = &modprobe.raw_args {
            MODPROBE_RAW_ARGS.get_or_create(&labels(&raw.load)).set(1);
        }
    }
}
