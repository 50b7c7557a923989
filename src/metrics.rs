use tracing::trace;

// Counters and timings are emitted as trace events; the exporter only
// serves the scrape endpoint.

pub fn inc_trigger(route: &'static str) {
    trace!(target = "harvest.metrics", route = route, "triggers_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "harvest.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
