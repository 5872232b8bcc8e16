//! Observation hooks.
//!
//! A [`TraceSink`] registered on the context receives structured records as
//! compilation and runs progress. Sinks are passive; the engine never
//! changes behavior based on their presence.

use std::time::Duration;

use serde::Serialize;

use crate::device::StreamId;

/// Receiver for engine events. All methods default to no-ops so sinks
/// implement only what they care about.
pub trait TraceSink: Send + Sync {
    fn compile_finished(&self, _stats: &CompileStats) {}

    /// Called after each kernel launch is issued, before its completion.
    fn kernel_launched(&self, _record: &LaunchRecord<'_>) {}

    fn run_finished(&self, _stats: &RunStats) {}
}

/// Summary of one successful compilation.
#[derive(Debug, Clone, Serialize)]
pub struct CompileStats {
    pub layers: usize,
    /// Logical values the plan tracks (input plus one per layer).
    pub slots: usize,
    /// Physical blocks backing those values after reuse.
    pub physical_buffers: usize,
    /// High-water mark of intermediate bytes a run will hold at once.
    pub peak_bytes: usize,
    pub weight_bytes: usize,
    pub streams_used: usize,
    pub duration: Duration,
}

/// Summary of one run, reported after the final synchronization.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub launches: usize,
    pub bytes_uploaded: usize,
    pub bytes_downloaded: usize,
    /// Cross-stream joins plus the final readback barrier.
    pub sync_points: usize,
    pub duration: Duration,
}

/// One issued kernel launch.
#[derive(Debug, Clone)]
pub struct LaunchRecord<'a> {
    pub step: usize,
    pub layer: &'a str,
    pub stream: StreamId,
    pub grid: [u32; 3],
    pub block: [u32; 3],
}
