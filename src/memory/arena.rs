//! The allocation arena.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::device::{BufferView, Device, DeviceError, Download, Event, StreamId, TensorSpec};
use crate::error::{Error, Result};
use crate::tensor::{DType, DeviceTensor, HostTensor, Shape};

use super::AllocId;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(0);

struct Entry<B> {
    buffer: B,
    len: usize,
    /// Bumped on every reuse of the block; handles carry the generation
    /// they were issued with and stale ones are rejected.
    generation: u64,
    in_use: bool,
}

/// Allocation counters, readable at any point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Allocations that went to the device.
    pub device_allocs: u64,
    /// Acquisitions served from the free list.
    pub reuses: u64,
    pub live_bytes: usize,
    pub peak_live_bytes: usize,
}

/// Owner of all device allocations for one context.
///
/// Blocks are recycled by exact byte size: an acquisition first pops a
/// same-size free block (bumping its generation), and only asks the device
/// for memory when no exact match is free. There is no splitting, merging
/// or defragmentation.
pub struct Arena<D: Device> {
    device: Arc<D>,
    entries: Vec<Entry<D::Buffer>>,
    free: BTreeMap<usize, Vec<AllocId>>,
    stats: ArenaStats,
    id: u64,
}

impl<D: Device> Arena<D> {
    pub fn new(device: Arc<D>) -> Self {
        Arena {
            device,
            entries: Vec::new(),
            free: BTreeMap::new(),
            stats: ArenaStats::default(),
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Identity of this arena. Compiled plans are bound to the arena they
    /// were produced with.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// Acquires a block for one tensor and returns the handle viewing all
    /// of it.
    pub fn allocate(&mut self, shape: &Shape, dtype: DType) -> Result<DeviceTensor> {
        let spec = TensorSpec::new(dtype, shape.clone());
        let len = spec.byte_len().ok_or(Error::OutOfMemory {
            requested: usize::MAX,
            in_use: self.stats.live_bytes,
            capacity: self.device.props().memory_bytes,
        })?;
        let (alloc, generation) = self.acquire_raw(len)?;
        Ok(DeviceTensor::new(spec, alloc, generation, 0))
    }

    /// Acquires a raw block of exactly `len` bytes: free-list first, device
    /// second. An out-of-memory answer from the device is surfaced as-is;
    /// nothing is evicted to retry.
    pub(crate) fn acquire_raw(&mut self, len: usize) -> Result<(AllocId, u64)> {
        if let Some(bucket) = self.free.get_mut(&len) {
            if let Some(id) = bucket.pop() {
                if bucket.is_empty() {
                    self.free.remove(&len);
                }
                let entry = &mut self.entries[id.index()];
                entry.generation += 1;
                entry.in_use = true;
                let generation = entry.generation;
                self.stats.reuses += 1;
                self.note_live(len);
                return Ok((id, generation));
            }
        }
        let buffer = self.device.alloc(len).map_err(|err| match err {
            DeviceError::OutOfMemory {
                requested,
                in_use,
                capacity,
            } => Error::OutOfMemory {
                requested,
                in_use,
                capacity,
            },
            other => Error::launch("alloc", other.to_string()),
        })?;
        let id = AllocId(self.entries.len() as u32);
        self.entries.push(Entry {
            buffer,
            len,
            generation: 0,
            in_use: true,
        });
        self.stats.device_allocs += 1;
        self.note_live(len);
        Ok((id, 0))
    }

    fn note_live(&mut self, len: usize) {
        self.stats.live_bytes += len;
        if self.stats.live_bytes > self.stats.peak_live_bytes {
            self.stats.peak_live_bytes = self.stats.live_bytes;
        }
    }

    /// Returns a tensor's block to the free list. The handle must be
    /// current; releasing through a stale or already-released handle is a
    /// caller bug and panics.
    pub fn release(&mut self, tensor: &DeviceTensor) {
        self.release_raw(tensor.alloc_id(), tensor.generation());
    }

    pub(crate) fn release_raw(&mut self, id: AllocId, generation: u64) {
        let entry = &mut self.entries[id.index()];
        assert_eq!(
            entry.generation, generation,
            "release of {id} through a stale handle"
        );
        assert!(entry.in_use, "double release of {id}");
        entry.in_use = false;
        self.free.entry(entry.len).or_default().push(id);
        self.stats.live_bytes -= entry.len;
    }

    /// Resolves a handle to the device buffer region it names. Panics on a
    /// stale handle.
    pub(crate) fn view(&self, tensor: &DeviceTensor) -> BufferView<D::Buffer> {
        let id = tensor.alloc_id();
        let entry = &self.entries[id.index()];
        assert_eq!(
            entry.generation,
            tensor.generation(),
            "view of {id} through a stale handle"
        );
        assert!(entry.in_use, "view of released {id}");
        BufferView {
            buffer: entry.buffer.clone(),
            offset: tensor.offset(),
            spec: tensor.spec().clone(),
        }
    }

    /// Copies a host tensor into fresh device memory and waits for the
    /// transfer. The block is released again if the copy fails.
    pub fn upload(&mut self, host: &HostTensor, stream: StreamId) -> Result<DeviceTensor> {
        let (tensor, _) = self.upload_async(host, stream)?;
        let device = Arc::clone(&self.device);
        if let Err(err) = device.synchronize(stream) {
            self.release(&tensor);
            return Err(Error::launch("upload", err.to_string()));
        }
        Ok(tensor)
    }

    /// Enqueues the copy without waiting; the event completes when the
    /// bytes are on the device.
    pub fn upload_async(
        &mut self,
        host: &HostTensor,
        stream: StreamId,
    ) -> Result<(DeviceTensor, Event)> {
        let tensor = self.allocate(host.shape(), host.dtype())?;
        let device = Arc::clone(&self.device);
        let view = self.view(&tensor);
        let issued = device
            .copy_to_device(stream, host.bytes().to_vec(), &view.buffer, view.offset)
            .and_then(|_| device.record_event(stream));
        match issued {
            Ok(event) => Ok((tensor, event)),
            Err(err) => {
                self.release(&tensor);
                Err(Error::launch("upload", err.to_string()))
            }
        }
    }

    /// Copies a device tensor back to the host and waits for the bytes.
    pub fn download(&self, tensor: &DeviceTensor, stream: StreamId) -> Result<HostTensor> {
        let pending = self.download_async(tensor, stream)?;
        let bytes = pending
            .wait()
            .map_err(|err| Error::launch("download", err.to_string()))?;
        HostTensor::from_bytes(tensor.shape().clone(), tensor.dtype(), bytes)
            .map_err(|err| Error::launch("download", err.to_string()))
    }

    pub fn download_async(&self, tensor: &DeviceTensor, stream: StreamId) -> Result<Download> {
        let view = self.view(tensor);
        self.device
            .copy_to_host(stream, &view.buffer, view.offset, tensor.byte_len())
            .map_err(|err| Error::launch("download", err.to_string()))
    }

    /// Opens a scope that releases everything acquired through it unless
    /// committed. Ties acquisitions to one control-flow region so early
    /// returns cannot leak blocks.
    pub fn scope(&mut self) -> ArenaScope<'_, D> {
        ArenaScope {
            arena: self,
            held: Vec::new(),
            committed: false,
        }
    }
}

/// RAII over a batch of acquisitions. Dropping the scope releases them in
/// reverse acquisition order; [`ArenaScope::commit`] keeps them alive.
pub struct ArenaScope<'a, D: Device> {
    arena: &'a mut Arena<D>,
    held: Vec<(AllocId, u64)>,
    committed: bool,
}

impl<'a, D: Device> ArenaScope<'a, D> {
    pub fn allocate(&mut self, shape: &Shape, dtype: DType) -> Result<DeviceTensor> {
        let tensor = self.arena.allocate(shape, dtype)?;
        self.held.push((tensor.alloc_id(), tensor.generation()));
        Ok(tensor)
    }

    pub fn upload(&mut self, host: &HostTensor, stream: StreamId) -> Result<DeviceTensor> {
        let tensor = self.arena.upload(host, stream)?;
        self.held.push((tensor.alloc_id(), tensor.generation()));
        Ok(tensor)
    }

    pub(crate) fn acquire_bytes(&mut self, len: usize) -> Result<(AllocId, u64)> {
        let acquired = self.arena.acquire_raw(len)?;
        self.held.push(acquired);
        Ok(acquired)
    }

    pub fn arena(&self) -> &Arena<D> {
        self.arena
    }

    /// Keeps every acquisition made through this scope.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<'a, D: Device> Drop for ArenaScope<'a, D> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some((id, generation)) = self.held.pop() {
            self.arena.release_raw(id, generation);
        }
    }
}
