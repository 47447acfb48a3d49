use tracing::trace;

// Metric events are emitted as trace-level tracing events so a subscriber
// can aggregate them without the pipeline depending on a metrics backend.

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "insights.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn batch_outcome(stage: &'static str, succeeded: usize, failed: usize) {
    trace!(
        target = "insights.metrics",
        stage = stage,
        succeeded = succeeded as u64,
        failed = failed as u64,
        "batch_outcome"
    );
}
