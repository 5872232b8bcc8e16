//! Execution context: the device, its arena, and the command streams a
//! graph compiles and runs against.
//!
//! All engine state is carried in the context a caller constructs; there
//! are no process-global device handles.

use std::sync::Arc;

use crate::device::{Device, HostDevice, StreamId};
use crate::env;
use crate::error::{Error, Result};
use crate::memory::Arena;
use crate::trace::TraceSink;

/// Construction options for [`ExecContext`].
#[derive(Clone)]
pub struct ContextOptions {
    /// Command streams to create. Values below 1 are clamped to 1.
    pub streams: usize,
    pub trace: Option<Arc<dyn TraceSink>>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            streams: env::default_streams(),
            trace: None,
        }
    }
}

/// Everything a graph needs to compile and run: device handle, memory
/// arena, command streams, and an optional trace sink.
pub struct ExecContext<D: Device = HostDevice> {
    device: Arc<D>,
    arena: Arena<D>,
    streams: Vec<StreamId>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl ExecContext<HostDevice> {
    /// Context over a fresh in-process reference device.
    pub fn host() -> Result<Self> {
        ExecContext::new(Arc::new(HostDevice::new()))
    }
}

impl<D: Device> ExecContext<D> {
    pub fn new(device: Arc<D>) -> Result<Self> {
        ExecContext::with_options(device, ContextOptions::default())
    }

    pub fn with_options(device: Arc<D>, options: ContextOptions) -> Result<Self> {
        let count = options.streams.max(1);
        let mut streams = Vec::with_capacity(count);
        for _ in 0..count {
            let stream = device
                .create_stream()
                .map_err(|err| Error::launch("create_stream", err.to_string()))?;
            streams.push(stream);
        }
        Ok(ExecContext {
            arena: Arena::new(Arc::clone(&device)),
            device,
            streams,
            trace: options.trace,
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn arena(&self) -> &Arena<D> {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena<D> {
        &mut self.arena
    }

    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    pub fn trace(&self) -> Option<&Arc<dyn TraceSink>> {
        self.trace.as_ref()
    }

    pub fn set_trace(&mut self, sink: Option<Arc<dyn TraceSink>>) {
        self.trace = sink;
    }

    /// Splits the context into independently borrowed parts.
    pub(crate) fn parts(
        &mut self,
    ) -> (
        &Arc<D>,
        &mut Arena<D>,
        &[StreamId],
        Option<&Arc<dyn TraceSink>>,
    ) {
        (
            &self.device,
            &mut self.arena,
            &self.streams,
            self.trace.as_ref(),
        )
    }
}
