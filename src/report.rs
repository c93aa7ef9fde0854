//! Run reports: what each stage did and which items failed.

use crate::config::Stage;
use crate::error::{FailureKind, ItemError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal result of one unit of work.
///
/// `value` and `error` are both set when the item degraded to a fallback
/// (an enrichment that exhausted its retries): the output is usable and the
/// failure is still reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome<T> {
    pub item: String,
    pub value: Option<T>,
    pub error: Option<ItemError>,
}

impl<T> ItemOutcome<T> {
    pub fn ok(item: impl Into<String>, value: T) -> Self {
        Self {
            item: item.into(),
            value: Some(value),
            error: None,
        }
    }

    pub fn degraded(item: impl Into<String>, value: T, error: ItemError) -> Self {
        Self {
            item: item.into(),
            value: Some(value),
            error: Some(error),
        }
    }

    pub fn failed(item: impl Into<String>, error: ItemError) -> Self {
        Self {
            item: item.into(),
            value: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-stage counts and failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Items the stage attempted (pages, records, nodes).
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failures that still produced fallback output. Included in `failed`.
    #[serde(default)]
    pub degraded: usize,
    /// Items not attempted: already done by an earlier run, or enrichment
    /// disabled.
    pub skipped: usize,
    /// Named output counts, e.g. `"table"`/`"text"` records or nodes per type.
    pub produced: BTreeMap<String, usize>,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub failures: Vec<ItemError>,
    pub duration_ms: u64,
    /// False when the stage stopped early (cancellation or timeout).
    pub completed: bool,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            total: 0,
            succeeded: 0,
            failed: 0,
            degraded: 0,
            skipped: 0,
            produced: BTreeMap::new(),
            failures_by_kind: BTreeMap::new(),
            failures: Vec::new(),
            duration_ms: 0,
            completed: true,
        }
    }

    pub fn record_success(&mut self) {
        self.total += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, error: ItemError) {
        self.total += 1;
        self.failed += 1;
        if matches!(error, ItemError::Cancelled { .. }) {
            self.completed = false;
        }
        *self.failures_by_kind.entry(error.kind()).or_default() += 1;
        self.failures.push(error);
    }

    /// A failure whose item still has usable fallback output.
    pub fn record_degraded(&mut self, error: ItemError) {
        self.degraded += 1;
        self.record_failure(error);
    }

    /// Count an outcome as a success, a degraded item or a failure.
    pub fn record<T>(&mut self, outcome: &ItemOutcome<T>) {
        match (&outcome.value, &outcome.error) {
            (_, None) => self.record_success(),
            (Some(_), Some(e)) => self.record_degraded(e.clone()),
            (None, Some(e)) => self.record_failure(e.clone()),
        }
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn add_produced(&mut self, name: impl Into<String>, count: usize) {
        *self.produced.entry(name.into()).or_default() += count;
    }

    fn cancelled(&self) -> usize {
        self.failures_by_kind
            .get(&FailureKind::Cancelled)
            .copied()
            .unwrap_or(0)
    }

    /// Items the stage actually tried, cancellations excluded.
    pub fn attempted(&self) -> usize {
        self.total.saturating_sub(self.cancelled())
    }

    /// Items left without any output, as a fraction of attempted items.
    /// Cancelled and degraded items are left out.
    pub fn failure_rate(&self) -> f64 {
        match self.attempted() {
            0 => 0.0,
            attempted => self.real_failures() as f64 / attempted as f64,
        }
    }

    /// Failures that left their item without output.
    pub fn real_failures(&self) -> usize {
        self.failed.saturating_sub(self.cancelled() + self.degraded)
    }
}

/// Summary of a whole run, persisted as `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub document_id: String,
    pub source_file: String,
    pub stages: Vec<StageReport>,
    /// Generation calls enrichment would make; set by dry runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_generation_calls: Option<usize>,
    pub cancelled: bool,
    pub total_duration_ms: u64,
}

impl RunReport {
    pub fn new(document_id: impl Into<String>, source_file: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            source_file: source_file.into(),
            stages: Vec::new(),
            planned_generation_calls: None,
            cancelled: false,
            total_duration_ms: 0,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn total_failures(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }

    /// Failure counts summed across stages, by kind.
    pub fn failures_by_kind(&self) -> BTreeMap<FailureKind, usize> {
        let mut out = BTreeMap::new();
        for stage in &self.stages {
            for (kind, n) in &stage.failures_by_kind {
                *out.entry(*kind).or_default() += n;
            }
        }
        out
    }

    /// Stages run to completion.
    pub fn completed_stages(&self) -> Vec<Stage> {
        self.stages.iter().filter(|s| s.completed).map(|s| s.stage).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_ignores_cancellations() {
        let mut r = StageReport::new(Stage::Enrich);
        r.record_success();
        r.record_failure(ItemError::Enrichment {
            item: "tables:p1:0".into(),
            attempts: 4,
            detail: "503".into(),
        });
        r.record_failure(ItemError::Cancelled {
            item: "tables:p2:0".into(),
        });
        assert_eq!(r.total, 3);
        assert_eq!(r.failed, 2);
        assert_eq!(r.real_failures(), 1);
        assert!((r.failure_rate() - 0.5).abs() < f64::EPSILON);
        assert!(!r.completed);
    }

    #[test]
    fn run_report_aggregates_kinds() {
        let mut extract = StageReport::new(Stage::Extract);
        extract.record_failure(ItemError::Extraction {
            page: 2,
            detail: "x".into(),
        });
        let mut embed = StageReport::new(Stage::Embed);
        embed.record_failure(ItemError::Embedding {
            node_id: "n".into(),
            detail: "y".into(),
        });
        embed.record_failure(ItemError::Embedding {
            node_id: "m".into(),
            detail: "y".into(),
        });
        let mut run = RunReport::new("doc", "doc.pdf");
        run.stages = vec![extract, embed];
        assert_eq!(run.total_failures(), 3);
        let kinds = run.failures_by_kind();
        assert_eq!(kinds[&FailureKind::Extraction], 1);
        assert_eq!(kinds[&FailureKind::Embedding], 2);
        assert_eq!(run.completed_stages(), vec![Stage::Extract, Stage::Embed]);
    }

    #[test]
    fn degraded_outcome_is_reported_but_not_rated() {
        let mut r = StageReport::new(Stage::Enrich);
        r.record(&ItemOutcome::ok("a", 1));
        r.record(&ItemOutcome::degraded(
            "b",
            2,
            ItemError::Enrichment {
                item: "b".into(),
                attempts: 4,
                detail: "timeout".into(),
            },
        ));
        assert_eq!((r.succeeded, r.failed, r.degraded), (1, 1, 1));
        assert_eq!(r.failures_by_kind[&FailureKind::Enrichment], 1);
        assert_eq!(r.real_failures(), 0);
        assert_eq!(r.failure_rate(), 0.0);
        assert!(r.completed);

        r.record::<i32>(&ItemOutcome::failed(
            "c",
            ItemError::Enrichment {
                item: "c".into(),
                attempts: 4,
                detail: "timeout".into(),
            },
        ));
        assert_eq!(r.real_failures(), 1);
        assert!((r.failure_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_stage_has_zero_rate() {
        assert_eq!(StageReport::new(Stage::Index).failure_rate(), 0.0);
    }
}
