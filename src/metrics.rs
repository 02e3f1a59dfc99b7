use tracing::trace;

// Trace-level counters; the Prometheus endpoint renders whatever recorder is installed.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "imagery.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "imagery.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn candidate_rejected(reason: &'static str) {
    trace!(
        target = "imagery.metrics",
        reason = reason,
        "candidates_rejected_inc"
    );
}

pub fn image_accepted(bytes: usize) {
    trace!(
        target = "imagery.metrics",
        bytes = bytes as u64,
        "images_accepted_inc"
    );
}
