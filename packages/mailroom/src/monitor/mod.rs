//! Observability: metrics collection, health probing, and alerting.

pub mod alerts;
pub mod health;
pub mod metrics;

pub use alerts::{
    AlertEvaluator, AlertEvent, AlertLevel, AlertManager, AlertRule, AlertTransition,
    EvalContext, LogNotifier, Notifier, RuleKind,
};
pub use health::{HealthMonitor, HealthSettings, SharedHealth, SystemHealth};
pub use metrics::{CounterSnapshot, EventKind, MetricsCollector, MetricsSnapshot, ProcessingEvent};
