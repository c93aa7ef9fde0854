//! Progress-callback trait for stage and item events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as each stage works through its items. The CLI uses this to drive
//! its progress bar; services can forward events to a channel or a job table.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2nodes::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl PipelineProgressCallback for Counter {
//!     fn on_item_complete(&self, _stage: Stage, _item: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::config::Stage;
use crate::report::StageReport;
use std::sync::Arc;

/// Called by the pipeline as it processes each stage.
///
/// Items within a stage run concurrently, so `on_item_*` may be called from
/// several tasks at once. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage is about to process `total_items` items.
    fn on_stage_start(&self, stage: Stage, total_items: usize) {
        let _ = (stage, total_items);
    }

    /// One item finished successfully (or with a stored fallback).
    fn on_item_complete(&self, stage: Stage, item: &str) {
        let _ = (stage, item);
    }

    /// One item failed; the stage continues.
    fn on_item_error(&self, stage: Stage, item: &str, error: &str) {
        let _ = (stage, item, error);
    }

    /// A stage finished; `report` holds its counts.
    fn on_stage_complete(&self, stage: Stage, report: &StageReport) {
        let _ = (stage, report);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Tracking {
        started: Mutex<Vec<(Stage, usize)>>,
        completes: AtomicUsize,
        errors: AtomicUsize,
        finished: AtomicUsize,
    }

    impl PipelineProgressCallback for Tracking {
        fn on_stage_start(&self, stage: Stage, total_items: usize) {
            self.started.lock().unwrap().push((stage, total_items));
        }

        fn on_item_complete(&self, _stage: Stage, _item: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_error(&self, _stage: Stage, _item: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_complete(&self, _stage: Stage, _report: &StageReport) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Extract, 3);
        cb.on_item_complete(Stage::Extract, "page 1");
        cb.on_item_error(Stage::Extract, "page 2", "bad xref");
        cb.on_stage_complete(Stage::Extract, &StageReport::new(Stage::Extract));
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = Tracking::default();
        tracker.on_stage_start(Stage::Embed, 2);
        tracker.on_item_complete(Stage::Embed, "a");
        tracker.on_item_error(Stage::Embed, "b", "rejected");
        tracker.on_stage_complete(Stage::Embed, &StageReport::new(Stage::Embed));

        assert_eq!(*tracker.started.lock().unwrap(), vec![(Stage::Embed, 2)]);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_start(Stage::Index, 10);
    }
}
