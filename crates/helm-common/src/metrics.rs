//! Metrics registry for controller observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile outcomes and latency per controller
//! - Requeues by reason (dependency, error, scheduled)
//! - Busy workers per controller
//! - Leadership status

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;

/// Global meter for controller metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("helm-controller"));

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Counter of completed reconciles
///
/// Labels:
/// - `controller`: registration name
/// - `result`: success, error, requeue
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("helm_controller_reconcile_total")
        .with_description("Total number of reconciles per controller")
        .with_unit("{reconciles}")
        .build()
});

/// Histogram of reconcile duration
///
/// Labels:
/// - `controller`: registration name
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("helm_controller_reconcile_duration_seconds")
        .with_description("Duration of reconciles in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `controller`: registration name
/// - `retryable`: true, false
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("helm_controller_reconcile_errors_total")
        .with_description("Total number of reconcile errors per controller")
        .with_unit("{errors}")
        .build()
});

/// Counter of requeues
///
/// Labels:
/// - `controller`: registration name
/// - `reason`: dependency, error, scheduled
pub static REQUEUES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("helm_controller_requeues_total")
        .with_description("Total number of delayed requeues per controller")
        .with_unit("{requeues}")
        .build()
});

// ============================================================================
// Runtime Metrics
// ============================================================================

/// Number of workers currently running a reconcile
///
/// Labels:
/// - `controller`: registration name
pub static ACTIVE_WORKERS: Lazy<UpDownCounter<i64>> = Lazy::new(|| {
    METER
        .i64_up_down_counter("helm_controller_active_workers")
        .with_description("Number of workers currently reconciling")
        .with_unit("{workers}")
        .build()
});

/// 1 while this replica holds leadership, 0 otherwise
pub static LEADER: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("helm_controller_leader")
        .with_description("Whether this replica is the leader")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Why a key was scheduled again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// A dependency was not ready yet
    Dependency,
    /// The reconcile failed with a retryable error
    Error,
    /// The reconciler asked to be revisited after an interval
    Scheduled,
}

impl RequeueReason {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dependency => "dependency",
            Self::Error => "error",
            Self::Scheduled => "scheduled",
        }
    }
}

/// Outcome label of a finished reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Reconcile succeeded and awaits the next change
    Success,
    /// Reconcile succeeded and asked to be requeued
    Requeue,
    /// Reconcile failed
    Error,
}

impl ReconcileResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Requeue => "requeue",
            Self::Error => "error",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Times one reconcile and keeps the active worker count while alive
pub struct ReconcileTimer {
    controller: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile for a controller
    pub fn start(controller: impl Into<String>) -> Self {
        let controller = controller.into();
        ACTIVE_WORKERS.add(1, &[KeyValue::new("controller", controller.clone())]);
        Self {
            controller,
            start: std::time::Instant::now(),
        }
    }

    /// Record completion with the given outcome
    pub fn finish(self, result: ReconcileResult) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("controller", self.controller.clone())],
        );
        RECONCILE_TOTAL.add(
            1,
            &[
                KeyValue::new("controller", self.controller.clone()),
                KeyValue::new("result", result.as_str()),
            ],
        );
    }
}

impl Drop for ReconcileTimer {
    fn drop(&mut self) {
        ACTIVE_WORKERS.add(-1, &[KeyValue::new("controller", self.controller.clone())]);
    }
}

/// Record a reconcile error
pub fn record_reconcile_error(controller: &str, retryable: bool) {
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("retryable", retryable.to_string()),
        ],
    );
}

/// Record a delayed requeue
pub fn record_requeue(controller: &str, reason: RequeueReason) {
    REQUEUES.add(
        1,
        &[
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("reason", reason.as_str()),
        ],
    );
}

/// Update the leadership gauge
pub fn set_leader(is_leader: bool) {
    LEADER.record(i64::from(is_leader), &[]);
}
