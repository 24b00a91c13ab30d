//! Drift detection and alert fan-out.
//!
//! A pure read-then-compare over the run history: the latest run (by
//! timestamp) is measured against the best historical run (by tracked
//! metric, the latest included). Alerts fan out to independent channels
//! only when drift is detected, and every channel outcome is recorded
//! separately so one broken channel never silences the others.

use crate::error::Result;
use crate::persistence::{RunHistory, RunRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Computed drift comparison for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub model_name: String,
    pub latest_run_id: i64,
    pub best_run_id: i64,
    pub latest_metric: f64,
    pub best_metric: f64,
    /// `best_metric - latest_metric`; negative when the latest run is the
    /// best so far.
    pub drop: f64,
    pub threshold: f64,
    /// True iff `drop` strictly exceeds the threshold.
    pub has_drifted: bool,
    pub latest_timestamp: DateTime<Utc>,
}

/// Drift check outcome. `NoData` is a first-class verdict, not an error:
/// a model with no recorded runs cannot have drifted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DriftVerdict {
    NoData { model_name: String },
    Computed(DriftReport),
}

impl DriftVerdict {
    pub fn has_drifted(&self) -> bool {
        match self {
            DriftVerdict::NoData { .. } => false,
            DriftVerdict::Computed(report) => report.has_drifted,
        }
    }

    pub fn report(&self) -> Option<&DriftReport> {
        match self {
            DriftVerdict::NoData { .. } => None,
            DriftVerdict::Computed(report) => Some(report),
        }
    }
}

/// Alert-channel collaborator. `send` reports success as a boolean and
/// must capture its own failures; it is never allowed to abort the fan-out.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, report: &DriftReport) -> bool;
}

/// Drift check plus per-channel alert outcomes.
#[derive(Debug)]
pub struct DriftOutcome {
    pub verdict: DriftVerdict,
    /// `(channel name, delivered)` for every configured channel.
    /// Empty when no drift was detected.
    pub alerts: Vec<(String, bool)>,
}

/// Compares the latest run against the historical best.
pub struct DriftDetector {
    threshold: f64,
}

impl DriftDetector {
    /// A detector with the given metric-drop threshold (e.g. 0.05).
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Check one model against its run history.
    pub fn check_drift(&self, history: &dyn RunHistory, model_name: &str) -> Result<DriftVerdict> {
        let mut runs = history.runs_for_model(model_name)?;
        if runs.is_empty() {
            return Ok(DriftVerdict::NoData {
                model_name: model_name.to_string(),
            });
        }

        // Newest first; don't trust the collaborator's ordering
        runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let latest = &runs[0];
        // Ties on the maximum metric resolve to the most recent run
        let best = runs
            .iter()
            .fold(&runs[0], |best, run| {
                if run.metric > best.metric { run } else { best }
            });

        let metric_drop = best.metric - latest.metric;

        Ok(DriftVerdict::Computed(DriftReport {
            model_name: model_name.to_string(),
            latest_run_id: latest.run_id,
            best_run_id: best.run_id,
            latest_metric: latest.metric,
            best_metric: best.metric,
            drop: metric_drop,
            threshold: self.threshold,
            has_drifted: metric_drop > self.threshold,
            latest_timestamp: latest.timestamp,
        }))
    }

    /// Check one model and, if it drifted, fan the report out to every
    /// alert channel. Channel failures are recorded, never propagated.
    pub async fn process(
        &self,
        history: &dyn RunHistory,
        model_name: &str,
        channels: &[Box<dyn AlertChannel>],
    ) -> Result<DriftOutcome> {
        let verdict = self.check_drift(history, model_name)?;

        let mut alerts = Vec::new();
        match verdict.report() {
            Some(report) if report.has_drifted => {
                warn!(
                    model = model_name,
                    drop = report.drop,
                    threshold = report.threshold,
                    "drift detected"
                );
                for channel in channels {
                    let delivered = channel.send(report).await;
                    if delivered {
                        info!(channel = channel.name(), "alert delivered");
                    } else {
                        warn!(channel = channel.name(), "alert delivery failed");
                    }
                    alerts.push((channel.name().to_string(), delivered));
                }
            }
            Some(_) => info!(model = model_name, "no drift detected"),
            None => info!(model = model_name, "no runs recorded for model"),
        }

        Ok(DriftOutcome { verdict, alerts })
    }
}

/// Generic HTTP webhook channel: posts the report as JSON.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, report: &DriftReport) -> bool {
        let result = self
            .client
            .post(&self.url)
            .json(report)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "webhook alert rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "webhook alert failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemHistory {
        runs: Vec<RunRecord>,
    }

    impl RunHistory for MemHistory {
        fn runs_for_model(&self, model_name: &str) -> Result<Vec<RunRecord>> {
            Ok(self
                .runs
                .iter()
                .filter(|r| r.model_name == model_name)
                .cloned()
                .collect())
        }
    }

    fn record(run_id: i64, age_secs: i64, metric: f64) -> RunRecord {
        RunRecord {
            run_id,
            model_name: "gpt-4o".to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000 - age_secs, 0).unwrap(),
            metric,
        }
    }

    #[test]
    fn test_no_runs_is_a_no_data_verdict() {
        let detector = DriftDetector::new(0.05);
        let history = MemHistory { runs: Vec::new() };

        let verdict = detector.check_drift(&history, "gpt-4o").unwrap();
        assert!(matches!(verdict, DriftVerdict::NoData { .. }));
        assert!(!verdict.has_drifted());
    }

    #[test]
    fn test_drop_beyond_threshold_is_drift() {
        let detector = DriftDetector::new(0.05);
        let history = MemHistory {
            runs: vec![record(1, 100, 0.90), record(2, 0, 0.80)],
        };

        let verdict = detector.check_drift(&history, "gpt-4o").unwrap();
        let report = verdict.report().unwrap();
        assert!((report.drop - 0.10).abs() < 1e-12);
        assert!(report.has_drifted);
        assert_eq!(report.best_run_id, 1);
        assert_eq!(report.latest_run_id, 2);
    }

    #[test]
    fn test_drop_exactly_at_threshold_is_not_drift() {
        let detector = DriftDetector::new(0.05);
        let history = MemHistory {
            runs: vec![record(1, 100, 0.90), record(2, 0, 0.85)],
        };

        let verdict = detector.check_drift(&history, "gpt-4o").unwrap();
        assert!(!verdict.has_drifted());

        // One epsilon past the threshold tips it over
        let history = MemHistory {
            runs: vec![record(1, 100, 0.90), record(2, 0, 0.85 - 1e-9)],
        };
        let verdict = detector.check_drift(&history, "gpt-4o").unwrap();
        assert!(verdict.has_drifted());
    }

    #[test]
    fn test_latest_run_being_best_gives_negative_drop() {
        let detector = DriftDetector::new(0.05);
        let history = MemHistory {
            runs: vec![record(1, 100, 0.70), record(2, 0, 0.95)],
        };

        let report = detector
            .check_drift(&history, "gpt-4o")
            .unwrap()
            .report()
            .cloned()
            .unwrap();
        assert!(report.drop < 0.0);
        assert!(!report.has_drifted);
        assert_eq!(report.best_run_id, 2);
    }

    #[test]
    fn test_unsorted_history_is_handled() {
        let detector = DriftDetector::new(0.05);
        // Latest run listed first despite being newest-by-timestamp last
        let history = MemHistory {
            runs: vec![record(3, 0, 0.60), record(1, 200, 0.90), record(2, 100, 0.70)],
        };

        let report = detector
            .check_drift(&history, "gpt-4o")
            .unwrap()
            .report()
            .cloned()
            .unwrap();
        assert_eq!(report.latest_run_id, 3);
        assert_eq!(report.best_run_id, 1);
        assert!((report.drop - 0.30).abs() < 1e-12);
    }

    struct FixedChannel {
        name: &'static str,
        ok: bool,
        sends: std::sync::Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AlertChannel for FixedChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _report: &DriftReport) -> bool {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.ok
        }
    }

    #[tokio::test]
    async fn test_alerts_fan_out_with_per_channel_outcomes() {
        let detector = DriftDetector::new(0.05);
        let history = MemHistory {
            runs: vec![record(1, 100, 0.90), record(2, 0, 0.70)],
        };

        let webhook_sends = std::sync::Arc::new(AtomicUsize::new(0));
        let discord_sends = std::sync::Arc::new(AtomicUsize::new(0));
        let channels: Vec<Box<dyn AlertChannel>> = vec![
            Box::new(FixedChannel {
                name: "webhook",
                ok: true,
                sends: std::sync::Arc::clone(&webhook_sends),
            }),
            Box::new(FixedChannel {
                name: "discord",
                ok: false,
                sends: std::sync::Arc::clone(&discord_sends),
            }),
        ];

        let outcome = detector.process(&history, "gpt-4o", &channels).await.unwrap();
        assert!(outcome.verdict.has_drifted());
        assert_eq!(
            outcome.alerts,
            vec![("webhook".to_string(), true), ("discord".to_string(), false)]
        );
        assert_eq!(webhook_sends.load(Ordering::SeqCst), 1);
        assert_eq!(discord_sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_alerts_when_healthy() {
        let detector = DriftDetector::new(0.05);
        let history = MemHistory {
            runs: vec![record(1, 100, 0.90), record(2, 0, 0.89)],
        };

        let sends = std::sync::Arc::new(AtomicUsize::new(0));
        let channels: Vec<Box<dyn AlertChannel>> = vec![Box::new(FixedChannel {
            name: "webhook",
            ok: true,
            sends: std::sync::Arc::clone(&sends),
        })];

        let outcome = detector.process(&history, "gpt-4o", &channels).await.unwrap();
        assert!(!outcome.verdict.has_drifted());
        assert!(outcome.alerts.is_empty());
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }
}
