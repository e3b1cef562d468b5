//! In-process metrics: monotonic counters plus a 24-hour ring of
//! processing events.
//!
//! Ingest is lock-free on the counters; the event ring takes a short mutex.
//! Snapshots aggregate the ring under a single lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::store::JobPriority;

/// Events older than this are evicted from the ring.
const WINDOW_HOURS: i64 = 24;
/// Template usage reports the busiest N templates.
const TOP_TEMPLATES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    EmailSent,
    EmailFailed,
    BatchProcessed,
    TemplateProcessed,
    HealthCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingEvent {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
    pub priority: Option<JobPriority>,
    pub template_id: Option<Uuid>,
}

#[derive(Default)]
struct Counters {
    emails_sent: AtomicU64,
    emails_failed: AtomicU64,
    batches_processed: AtomicU64,
    templates_rendered: AtomicU64,
    health_checks: AtomicU64,
}

/// Point-in-time copy of the cumulative counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CounterSnapshot {
    pub emails_sent: u64,
    pub emails_failed: u64,
    pub batches_processed: u64,
    pub templates_rendered: u64,
    pub health_checks: u64,
}

/// Aggregates over the 24-hour event window plus cumulative counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub emails_sent: u64,
    pub emails_failed: u64,
    pub success_rate: f64,
    pub avg_processing_ms: f64,
    pub emails_last_hour: u64,
    pub peak_hourly_rate: u64,
    pub priority_distribution: Vec<(JobPriority, u64)>,
    pub template_usage: Vec<(Uuid, u64)>,
    pub counters: CounterSnapshot,
}

impl MetricsSnapshot {
    pub fn total_processed(&self) -> u64 {
        self.emails_sent + self.emails_failed
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            0.0
        } else {
            self.emails_failed as f64 / total as f64
        }
    }
}

pub struct MetricsCollector {
    counters: Counters,
    events: Mutex<VecDeque<ProcessingEvent>>,
    started_at: DateTime<Utc>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            events: Mutex::new(VecDeque::new()),
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record_email_sent(
        &self,
        duration: Duration,
        priority: JobPriority,
        template_id: Option<Uuid>,
    ) {
        self.counters.emails_sent.fetch_add(1, Ordering::Relaxed);
        self.record_event(ProcessingEvent {
            kind: EventKind::EmailSent,
            at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            priority: Some(priority),
            template_id,
        });
    }

    pub fn record_email_failed(
        &self,
        duration: Duration,
        priority: JobPriority,
        template_id: Option<Uuid>,
    ) {
        self.counters.emails_failed.fetch_add(1, Ordering::Relaxed);
        self.record_event(ProcessingEvent {
            kind: EventKind::EmailFailed,
            at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            priority: Some(priority),
            template_id,
        });
    }

    pub fn record_batch(&self, _size: usize) {
        self.counters
            .batches_processed
            .fetch_add(1, Ordering::Relaxed);
        self.record_event(ProcessingEvent {
            kind: EventKind::BatchProcessed,
            at: Utc::now(),
            duration_ms: 0,
            priority: None,
            template_id: None,
        });
    }

    pub fn record_template_processed(&self) {
        self.counters
            .templates_rendered
            .fetch_add(1, Ordering::Relaxed);
        self.record_event(ProcessingEvent {
            kind: EventKind::TemplateProcessed,
            at: Utc::now(),
            duration_ms: 0,
            priority: None,
            template_id: None,
        });
    }

    pub fn record_health_check(&self) {
        self.counters.health_checks.fetch_add(1, Ordering::Relaxed);
        self.record_event(ProcessingEvent {
            kind: EventKind::HealthCheck,
            at: Utc::now(),
            duration_ms: 0,
            priority: None,
            template_id: None,
        });
    }

    /// Append an event and eagerly evict everything past the window.
    pub fn record_event(&self, event: ProcessingEvent) {
        let cutoff = event.at - ChronoDuration::hours(WINDOW_HOURS);
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        while events.front().map_or(false, |e| e.at < cutoff) {
            events.pop_front();
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            emails_sent: self.counters.emails_sent.load(Ordering::Relaxed),
            emails_failed: self.counters.emails_failed.load(Ordering::Relaxed),
            batches_processed: self.counters.batches_processed.load(Ordering::Relaxed),
            templates_rendered: self.counters.templates_rendered.load(Ordering::Relaxed),
            health_checks: self.counters.health_checks.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let window_start = now - ChronoDuration::hours(WINDOW_HOURS);
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());

        let mut sent = 0u64;
        let mut failed = 0u64;
        let mut duration_total = 0u64;
        let mut last_hour = 0u64;
        let mut hourly = [0u64; WINDOW_HOURS as usize];
        let mut priorities: HashMap<JobPriority, u64> = HashMap::new();
        let mut templates: HashMap<Uuid, u64> = HashMap::new();

        for event in events.iter().filter(|e| e.at >= window_start && e.at <= now) {
            let outcome = match event.kind {
                EventKind::EmailSent => {
                    sent += 1;
                    true
                }
                EventKind::EmailFailed => {
                    failed += 1;
                    true
                }
                _ => false,
            };

            if outcome {
                duration_total += event.duration_ms;
                let age_hours = (now - event.at).num_hours().clamp(0, WINDOW_HOURS - 1);
                hourly[age_hours as usize] += 1;
                if age_hours == 0 {
                    last_hour += 1;
                }
                if let Some(priority) = event.priority {
                    *priorities.entry(priority).or_default() += 1;
                }
                if let Some(template_id) = event.template_id {
                    *templates.entry(template_id).or_default() += 1;
                }
            }
        }

        let total = sent + failed;
        let mut priority_distribution: Vec<(JobPriority, u64)> =
            priorities.into_iter().collect();
        priority_distribution.sort_by(|a, b| b.0.cmp(&a.0));

        let mut template_usage: Vec<(Uuid, u64)> = templates.into_iter().collect();
        template_usage.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        template_usage.truncate(TOP_TEMPLATES);

        MetricsSnapshot {
            taken_at: now,
            emails_sent: sent,
            emails_failed: failed,
            success_rate: if total == 0 {
                1.0
            } else {
                sent as f64 / total as f64
            },
            avg_processing_ms: if total == 0 {
                0.0
            } else {
                duration_total as f64 / total as f64
            },
            emails_last_hour: last_hour,
            peak_hourly_rate: hourly.iter().copied().max().unwrap_or(0),
            priority_distribution,
            template_usage,
            counters: self.counters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(kind: EventKind, at: DateTime<Utc>, priority: JobPriority) -> ProcessingEvent {
        ProcessingEvent {
            kind,
            at,
            duration_ms: 100,
            priority: Some(priority),
            template_id: None,
        }
    }

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_email_sent(Duration::from_millis(10), JobPriority::Normal, None);
        metrics.record_email_sent(Duration::from_millis(10), JobPriority::High, None);
        metrics.record_email_failed(Duration::from_millis(10), JobPriority::Normal, None);
        metrics.record_batch(5);
        metrics.record_health_check();

        let counters = metrics.counters();
        assert_eq!(counters.emails_sent, 2);
        assert_eq!(counters.emails_failed, 1);
        assert_eq!(counters.batches_processed, 1);
        assert_eq!(counters.health_checks, 1);
    }

    #[test]
    fn snapshot_computes_success_rate_and_average() {
        let metrics = MetricsCollector::new();
        let now = Utc::now();
        for _ in 0..3 {
            metrics.record_email_sent(Duration::from_millis(100), JobPriority::Normal, None);
        }
        metrics.record_email_failed(Duration::from_millis(100), JobPriority::Normal, None);

        let snapshot = metrics.snapshot(now + ChronoDuration::seconds(1));
        assert_eq!(snapshot.emails_sent, 3);
        assert_eq!(snapshot.emails_failed, 1);
        assert!((snapshot.success_rate - 0.75).abs() < 1e-9);
        assert!((snapshot.failure_rate() - 0.25).abs() < 1e-9);
        assert!((snapshot.avg_processing_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_reports_full_success() {
        let metrics = MetricsCollector::new();
        let snapshot = metrics.snapshot(Utc::now());
        assert_eq!(snapshot.total_processed(), 0);
        assert!((snapshot.success_rate - 1.0).abs() < 1e-9);
        assert_eq!(snapshot.failure_rate(), 0.0);
    }

    #[test]
    fn old_events_are_evicted() {
        let metrics = MetricsCollector::new();
        let now = Utc::now();
        metrics.record_event(event_at(
            EventKind::EmailSent,
            now - ChronoDuration::hours(30),
            JobPriority::Normal,
        ));
        // The next append triggers eviction of the stale entry.
        metrics.record_event(event_at(EventKind::EmailSent, now, JobPriority::Normal));

        let snapshot = metrics.snapshot(now);
        assert_eq!(snapshot.emails_sent, 1);
    }

    #[test]
    fn priority_distribution_counts_outcomes() {
        let metrics = MetricsCollector::new();
        let now = Utc::now();
        metrics.record_event(event_at(EventKind::EmailSent, now, JobPriority::Critical));
        metrics.record_event(event_at(EventKind::EmailSent, now, JobPriority::Critical));
        metrics.record_event(event_at(EventKind::EmailFailed, now, JobPriority::Low));

        let snapshot = metrics.snapshot(now);
        assert_eq!(
            snapshot.priority_distribution,
            vec![(JobPriority::Critical, 2), (JobPriority::Low, 1)]
        );
    }

    #[test]
    fn peak_hourly_rate_finds_the_busiest_hour() {
        let metrics = MetricsCollector::new();
        let now = Utc::now();
        for _ in 0..5 {
            metrics.record_event(event_at(
                EventKind::EmailSent,
                now - ChronoDuration::hours(2),
                JobPriority::Normal,
            ));
        }
        metrics.record_event(event_at(EventKind::EmailSent, now, JobPriority::Normal));

        let snapshot = metrics.snapshot(now);
        assert_eq!(snapshot.peak_hourly_rate, 5);
        assert_eq!(snapshot.emails_last_hour, 1);
    }

    #[test]
    fn template_usage_reports_top_templates() {
        let metrics = MetricsCollector::new();
        let now = Utc::now();
        let busy = Uuid::now_v7();
        let quiet = Uuid::now_v7();
        for _ in 0..3 {
            metrics.record_email_sent(Duration::from_millis(1), JobPriority::Normal, Some(busy));
        }
        metrics.record_email_sent(Duration::from_millis(1), JobPriority::Normal, Some(quiet));

        let snapshot = metrics.snapshot(now + ChronoDuration::seconds(1));
        assert_eq!(snapshot.template_usage[0], (busy, 3));
        assert_eq!(snapshot.template_usage[1], (quiet, 1));
    }
}
