use tracing::trace;

// Trace-level counters; a scraper can turn these into metrics without extra deps.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "reconciler.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "reconciler.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn cycle_finished(total: usize, processed: usize, failed: usize, elapsed_ms: u128) {
    trace!(
        target = "reconciler.metrics",
        total = total,
        processed = processed,
        failed = failed,
        elapsed_ms = elapsed_ms as u64,
        "cycle_finished"
    );
}
