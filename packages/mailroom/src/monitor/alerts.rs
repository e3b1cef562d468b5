//! Alert rules, the per-rule trigger/resolve state machine, and the
//! periodic evaluator.
//!
//! Rules are evaluated against the latest metrics snapshot and health
//! probe. A predicate must hold continuously for the rule's evaluation
//! period before it triggers; a rule fires once on becoming active and
//! once more on resolving, and a cooldown window after each transition
//! suppresses re-triggering. Notification delivery is fire-and-forget and
//! never blocks evaluation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::service::Service;
use crate::monitor::health::SharedHealth;
use crate::monitor::metrics::MetricsCollector;
use crate::store::{HealthLevel, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// What a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// 24 h failure rate above `threshold` (fraction).
    FailureRate,
    /// Queue depth above `threshold` (jobs).
    QueueBacklog,
    /// Process probe at Warning or worse.
    CpuPressure,
    /// Overall health Critical.
    ServiceCritical,
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub level: AlertLevel,
    pub kind: RuleKind,
    pub threshold: f64,
    /// How long the predicate must hold before the rule triggers. Zero
    /// fires on the first tick the predicate is true.
    pub evaluation_period: Duration,
    pub cooldown: Duration,
    pub enabled: bool,
}

/// Inputs one evaluation tick runs against.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub failure_rate: f64,
    pub queue_depth: i64,
    pub process_level: HealthLevel,
    pub overall_health: HealthLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertTransition {
    Triggered,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub rule_id: String,
    pub rule_name: String,
    pub level: AlertLevel,
    pub transition: AlertTransition,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
struct RuleState {
    active: bool,
    /// Start of the current unbroken run of true evaluations.
    firing_since: Option<DateTime<Utc>>,
    last_transition: Option<DateTime<Utc>>,
}

/// Notification sink. Failures are logged by the dispatcher, never raised.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}

/// Default sink: structured log lines.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        match event.transition {
            AlertTransition::Triggered => {
                warn!(rule = %event.rule_id, level = ?event.level, message = %event.message, "alert triggered");
            }
            AlertTransition::Resolved => {
                info!(rule = %event.rule_id, message = %event.message, "alert resolved");
            }
        }
        Ok(())
    }
}

pub struct AlertManager {
    rules: Mutex<Vec<AlertRule>>,
    states: Mutex<HashMap<String, RuleState>>,
    notifier: Arc<dyn Notifier>,
}

impl AlertManager {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            rules: Mutex::new(default_rules()),
            states: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace a rule by id, or add it.
    pub fn upsert_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Run the state machine for every enabled rule; returns the transitions
    /// this tick produced.
    pub fn evaluate(&self, ctx: &EvalContext, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut events = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            let (firing, observed) = predicate(rule, ctx);
            let state = states.entry(rule.id.clone()).or_default();

            if firing {
                // firing && active: remain active, no duplicate notification.
                if state.active {
                    continue;
                }

                let since = *state.firing_since.get_or_insert(now);
                let held_for_period = now - since
                    >= chrono::Duration::from_std(rule.evaluation_period)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                if !held_for_period {
                    continue;
                }

                let in_cooldown = state.last_transition.map_or(false, |at| {
                    now - at < chrono::Duration::from_std(rule.cooldown)
                        .unwrap_or_else(|_| chrono::Duration::zero())
                });
                if in_cooldown {
                    continue;
                }

                state.active = true;
                state.last_transition = Some(now);
                events.push(AlertEvent {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    level: rule.level,
                    transition: AlertTransition::Triggered,
                    message: format!(
                        "{}: observed {:.3}, threshold {:.3}",
                        rule.name, observed, rule.threshold
                    ),
                    at: now,
                });
            } else {
                // Any false evaluation breaks the sustained-predicate run.
                state.firing_since = None;
                if state.active {
                    state.active = false;
                    state.last_transition = Some(now);
                    events.push(AlertEvent {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        level: rule.level,
                        transition: AlertTransition::Resolved,
                        message: format!("{}: back below threshold", rule.name),
                        at: now,
                    });
                }
            }
        }

        events
    }

    /// Hand events to the notifier without blocking the evaluation loop.
    pub fn dispatch(&self, events: Vec<AlertEvent>) {
        for event in events {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&event).await {
                    error!(rule = %event.rule_id, error = %e, "alert notification failed");
                }
            });
        }
    }
}

fn predicate(rule: &AlertRule, ctx: &EvalContext) -> (bool, f64) {
    match rule.kind {
        RuleKind::FailureRate => (ctx.failure_rate > rule.threshold, ctx.failure_rate),
        RuleKind::QueueBacklog => (
            ctx.queue_depth as f64 > rule.threshold,
            ctx.queue_depth as f64,
        ),
        RuleKind::CpuPressure => (
            ctx.process_level >= HealthLevel::Warning,
            ctx.process_level as i16 as f64,
        ),
        RuleKind::ServiceCritical => (
            ctx.overall_health == HealthLevel::Critical,
            ctx.overall_health as i16 as f64,
        ),
    }
}

fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            id: "high_failure_rate".to_string(),
            name: "High failure rate".to_string(),
            level: AlertLevel::Warning,
            kind: RuleKind::FailureRate,
            threshold: 0.10,
            evaluation_period: Duration::from_secs(10 * 60),
            cooldown: Duration::from_secs(30 * 60),
            enabled: true,
        },
        AlertRule {
            id: "queue_backlog".to_string(),
            name: "Queue backlog".to_string(),
            level: AlertLevel::Warning,
            kind: RuleKind::QueueBacklog,
            threshold: 1000.0,
            evaluation_period: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(15 * 60),
            enabled: true,
        },
        AlertRule {
            id: "cpu_pressure".to_string(),
            name: "CPU pressure".to_string(),
            level: AlertLevel::Warning,
            kind: RuleKind::CpuPressure,
            threshold: 0.0,
            evaluation_period: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(15 * 60),
            enabled: true,
        },
        // An outright critical service fires on the first sighting.
        AlertRule {
            id: "service_critical".to_string(),
            name: "Service critical".to_string(),
            level: AlertLevel::Critical,
            kind: RuleKind::ServiceCritical,
            threshold: 0.0,
            evaluation_period: Duration::ZERO,
            cooldown: Duration::from_secs(10 * 60),
            enabled: true,
        },
    ]
}

// ============================================================================
// Evaluator service
// ============================================================================

pub struct AlertEvaluator {
    manager: Arc<AlertManager>,
    store: Arc<dyn Store>,
    metrics: Arc<MetricsCollector>,
    health: SharedHealth,
    interval: Duration,
}

impl AlertEvaluator {
    pub fn new(
        manager: Arc<AlertManager>,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsCollector>,
        health: SharedHealth,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            store,
            metrics,
            health,
            interval,
        }
    }

    /// One evaluation pass. Failures are logged; the loop always survives.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let snapshot = self.metrics.snapshot(now);
        let queue_depth = match self.store.queue_stats(now).await {
            Ok(stats) => stats.depth(),
            Err(e) => {
                error!(error = %e, "alert evaluation could not read queue stats");
                return;
            }
        };

        let (process_level, overall_health) = {
            let latest = self.health.read().unwrap_or_else(|e| e.into_inner());
            match latest.as_ref() {
                Some(health) => (health.process.level, health.overall),
                None => (HealthLevel::Healthy, HealthLevel::Healthy),
            }
        };

        let ctx = EvalContext {
            failure_rate: snapshot.failure_rate(),
            queue_depth,
            process_level,
            overall_health,
        };

        let events = self.manager.evaluate(&ctx, now);
        if !events.is_empty() {
            self.manager.dispatch(events);
        }
    }
}

#[async_trait]
impl Service for AlertEvaluator {
    fn name(&self) -> &'static str {
        "alert-evaluator"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(interval_sec = self.interval.as_secs(), "alert evaluator starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.tick(Utc::now()).await;
        }

        info!("alert evaluator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AlertManager {
        AlertManager::new(Arc::new(LogNotifier))
    }

    fn failing_ctx(rate: f64) -> EvalContext {
        EvalContext {
            failure_rate: rate,
            ..Default::default()
        }
    }

    fn minutes(base: DateTime<Utc>, m: i64) -> DateTime<Utc> {
        base + chrono::Duration::minutes(m)
    }

    #[test]
    fn triggers_once_after_the_evaluation_period() {
        let manager = manager();
        let now = Utc::now();

        // First sighting only starts the sustained-predicate window.
        assert!(manager.evaluate(&failing_ctx(0.15), now).is_empty());

        // Still failing past the 10-minute evaluation period: one trigger.
        let events = manager.evaluate(&failing_ctx(0.15), minutes(now, 12));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, "high_failure_rate");
        assert_eq!(events[0].transition, AlertTransition::Triggered);

        // Re-evaluation while still firing: no duplicate notification.
        assert!(manager
            .evaluate(&failing_ctx(0.20), minutes(now, 14))
            .is_empty());
    }

    #[test]
    fn short_blips_never_trigger() {
        let manager = manager();
        let now = Utc::now();

        assert!(manager.evaluate(&failing_ctx(0.15), now).is_empty());
        // A single healthy evaluation breaks the run.
        assert!(manager.evaluate(&failing_ctx(0.02), minutes(now, 2)).is_empty());
        // The window restarts from scratch.
        assert!(manager.evaluate(&failing_ctx(0.15), minutes(now, 4)).is_empty());
        assert!(manager.evaluate(&failing_ctx(0.15), minutes(now, 12)).is_empty());
    }

    #[test]
    fn resolves_when_the_predicate_clears() {
        let manager = manager();
        let now = Utc::now();
        manager.evaluate(&failing_ctx(0.15), now);
        manager.evaluate(&failing_ctx(0.15), minutes(now, 12));

        let events = manager.evaluate(&failing_ctx(0.02), minutes(now, 20));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transition, AlertTransition::Resolved);
    }

    #[test]
    fn cooldown_suppresses_rapid_retrigger() {
        let manager = manager();
        let now = Utc::now();
        manager.evaluate(&failing_ctx(0.15), now);
        manager.evaluate(&failing_ctx(0.15), minutes(now, 12));
        manager.evaluate(&failing_ctx(0.02), minutes(now, 14));

        // A new sustained run completes inside the 30-minute cooldown of
        // the resolution: suppressed.
        assert!(manager.evaluate(&failing_ctx(0.15), minutes(now, 16)).is_empty());
        assert!(manager.evaluate(&failing_ctx(0.15), minutes(now, 28)).is_empty());

        // Past the cooldown, the still-held predicate triggers again.
        let fired = manager.evaluate(&failing_ctx(0.15), minutes(now, 50));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].transition, AlertTransition::Triggered);
    }

    #[test]
    fn disabled_rules_never_fire() {
        let manager = manager();
        assert!(manager.set_rule_enabled("high_failure_rate", false));

        let now = Utc::now();
        assert!(manager.evaluate(&failing_ctx(0.99), now).is_empty());
        assert!(manager.evaluate(&failing_ctx(0.99), minutes(now, 30)).is_empty());
    }

    #[test]
    fn backlog_rule_watches_queue_depth() {
        let manager = manager();
        let now = Utc::now();
        let ctx = EvalContext {
            queue_depth: 5000,
            ..Default::default()
        };

        assert!(manager.evaluate(&ctx, now).is_empty());

        // Sustained past the 5-minute evaluation period.
        let events = manager.evaluate(&ctx, minutes(now, 6));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, "queue_backlog");
    }

    #[test]
    fn critical_health_fires_the_service_rule_immediately() {
        let manager = manager();
        let ctx = EvalContext {
            overall_health: HealthLevel::Critical,
            process_level: HealthLevel::Healthy,
            ..Default::default()
        };

        // Zero evaluation period: first sighting fires.
        let events = manager.evaluate(&ctx, Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule_id, "service_critical");
        assert_eq!(events[0].level, AlertLevel::Critical);
    }

    #[test]
    fn upsert_replaces_rule_settings() {
        let manager = manager();
        let mut rule = manager
            .rules()
            .into_iter()
            .find(|r| r.id == "queue_backlog")
            .unwrap();
        rule.threshold = 10.0;
        rule.evaluation_period = Duration::ZERO;
        manager.upsert_rule(rule);

        let ctx = EvalContext {
            queue_depth: 50,
            ..Default::default()
        };
        let events = manager.evaluate(&ctx, Utc::now());
        assert_eq!(events.len(), 1);
    }
}
