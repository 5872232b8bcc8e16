//! Environment knobs, read once.

use std::sync::OnceLock;

static STREAMS: OnceLock<Option<usize>> = OnceLock::new();

/// Default command-stream count for new contexts, `PEREGRINE_STREAMS` if
/// set to a positive integer, otherwise 1.
pub(crate) fn default_streams() -> usize {
    STREAMS
        .get_or_init(|| {
            std::env::var("PEREGRINE_STREAMS")
                .ok()
                .and_then(|raw| raw.trim().parse::<usize>().ok())
                .filter(|&count| count >= 1)
        })
        .unwrap_or(1)
}
