use std::{mem, sync::Arc};

use bytemuck::Pod;
use wgpu::{
    Buffer, BufferAddress, BufferAsyncError, BufferDescriptor, BufferUsages, CommandEncoder,
    CommandEncoderDescriptor, Maintain, MapMode,
};

use crate::{
    buffer::{CopyRegion, ReadbackCallback, ReadbackHandle},
    mode::HerdContext,
    setup::GpuContext,
    util::typedefs::SsoString,
    ModeData, ReadbackError,
};

type MapReceiver = flume::Receiver<Result<(), BufferAsyncError>>;

enum ReadbackSource<T> {
    /// Copy of the mirror taken at request time. Used in cpu mode and for empty buffers.
    Snapshot(Vec<T>),
    Mapped { staging: Buffer, receiver: MapReceiver },
}

struct PendingReadback<T> {
    handle: ReadbackHandle,
    callbacks: Vec<ReadbackCallback<T>>,
    write_back: bool,
    source: ReadbackSource<T>,
}

/// A GPU buffer of `T` mirrored by a CPU side array.
///
/// Mutations go to the mirror and mark it dirty; [`update_buffer_data`](Self::update_buffer_data)
/// uploads. The GPU buffer, when it exists, always holds exactly [`len`](Self::len) elements.
/// In cpu mode the mirror is the only copy and kernels write into it directly.
pub struct GpuDataBuffer<T: Pod> {
    label: SsoString,
    context: HerdContext,
    usage: BufferUsages,
    data: Vec<T>,
    buffer: Option<Arc<Buffer>>,
    dirty: bool,
    readback: Option<PendingReadback<T>>,
    round_trips: u64,
    generation: u64,
}

impl<T: Pod> GpuDataBuffer<T> {
    const STRIDE: BufferAddress = mem::size_of::<T>() as BufferAddress;

    /// `usage` is added on top of storage and copy usages.
    pub fn new(label: &str, context: HerdContext, usage: BufferUsages) -> Self {
        Self::with_data(label, context, usage, Vec::new())
    }

    pub fn with_data(label: &str, context: HerdContext, usage: BufferUsages, data: Vec<T>) -> Self {
        Self {
            label: SsoString::from(label),
            context,
            usage: usage | BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            dirty: !data.is_empty(),
            data,
            buffer: None,
            readback: None,
            round_trips: 0,
            generation: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bumped by every change to the contents, wherever it happened.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        self.mark_dirty();
        &mut self.data
    }

    /// Mirror access for cpu kernels. The result is the authoritative copy in cpu mode,
    /// so nothing needs uploading.
    pub(crate) fn kernel_output(&mut self) -> &mut [T] {
        self.generation += 1;
        &mut self.data
    }

    /// The GPU buffer, if one has been uploaded.
    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffer.as_ref()
    }

    /// True if the GPU holds the same data as the mirror.
    pub fn is_resident(&self) -> bool {
        self.buffer.is_some() && !self.dirty
    }

    pub fn add(&mut self, value: T) -> usize {
        self.data.push(value);
        self.mark_dirty();
        self.data.len() - 1
    }

    /// Writes `value` at `index`, growing with zeroes if needed.
    pub fn add_or_set(&mut self, index: usize, value: T) {
        if index >= self.data.len() {
            self.data.resize(index + 1, T::zeroed());
        }
        self.data[index] = value;
        self.mark_dirty();
    }

    pub fn set_range(&mut self, start: usize, values: &[T]) {
        let end = start + values.len();
        if end > self.data.len() {
            self.data.resize(end, T::zeroed());
        }
        self.data[start..end].copy_from_slice(values);
        self.mark_dirty();
    }

    /// Resizes the mirror. Existing elements are kept, new ones are zeroed.
    pub fn resize(&mut self, len: usize) {
        if len != self.data.len() {
            self.data.resize(len, T::zeroed());
            self.mark_dirty();
        }
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
        self.mark_dirty();
    }

    fn create_buffer(&self, ctx: &GpuContext, len: usize) -> Arc<Buffer> {
        Arc::new(ctx.device.create_buffer(&BufferDescriptor {
            label: Some(&self.label),
            size: len as BufferAddress * Self::STRIDE,
            usage: self.usage,
            mapped_at_creation: false,
        }))
    }

    /// Uploads the mirror if it is dirty or `force` is set, recreating the GPU
    /// buffer when its length changed. Returns true if anything was uploaded.
    pub fn update_buffer_data(&mut self, force: bool) -> bool {
        if !self.dirty && !force {
            return false;
        }
        self.dirty = false;

        let ModeData::Gpu(ref ctx) = self.context else {
            return true;
        };

        if self.data.is_empty() {
            self.buffer = None;
            return true;
        }

        let size = self.data.len() as BufferAddress * Self::STRIDE;
        let buffer = match self.buffer {
            Some(ref buffer) if buffer.size() == size => Arc::clone(buffer),
            _ => {
                log::debug!("{}: creating gpu buffer of {} elements", self.label, self.data.len());
                let buffer = self.create_buffer(ctx, self.data.len());
                self.buffer = Some(Arc::clone(&buffer));
                buffer
            }
        };
        ctx.queue.write_buffer(&buffer, 0, bytemuck::cast_slice(&self.data));
        true
    }

    /// Rebuilds the buffer at `new_len`, carrying `regions` over from the old contents.
    /// Everything not covered by a region starts zeroed.
    ///
    /// When the GPU copy is current the regions are copied GPU side into a fresh
    /// buffer, otherwise the rebuilt mirror is uploaded on the next update.
    pub fn remap(&mut self, new_len: usize, regions: &[CopyRegion]) {
        self.remap_filled(new_len, regions, T::zeroed());
    }

    /// [`remap`](Self::remap), with `fill` written to everything not covered by a region.
    ///
    /// Kernel written buffers stay GPU side: only the uncovered ranges are uploaded.
    pub fn remap_filled(&mut self, new_len: usize, regions: &[CopyRegion], fill: T) {
        profiling::scope!("GpuDataBuffer::remap");

        let mut data = vec![fill; new_len];
        for region in regions {
            data[region.dst..region.dst + region.len]
                .copy_from_slice(&self.data[region.src..region.src + region.len]);
        }

        let gpu_copy = match (&self.context, &self.buffer) {
            (ModeData::Gpu(ctx), Some(old)) if !self.dirty && new_len > 0 => {
                let new = self.create_buffer(ctx, new_len);
                for gap in CopyRegion::uncovered(new_len, regions) {
                    ctx.queue.write_buffer(
                        &new,
                        gap.start as BufferAddress * Self::STRIDE,
                        bytemuck::cast_slice(&data[gap]),
                    );
                }
                let mut encoder = ctx.device.create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("GpuDataBuffer remap"),
                });
                for region in regions.iter().filter(|r| r.len > 0) {
                    encoder.copy_buffer_to_buffer(
                        old,
                        region.src as BufferAddress * Self::STRIDE,
                        &new,
                        region.dst as BufferAddress * Self::STRIDE,
                        region.len as BufferAddress * Self::STRIDE,
                    );
                }
                ctx.queue.submit(Some(encoder.finish()));
                Some(new)
            }
            _ => None,
        };

        self.data = data;
        self.generation += 1;
        match gpu_copy {
            Some(buffer) => self.buffer = Some(buffer),
            None => self.mark_dirty(),
        }
    }

    /// Writes `values` at `start` GPU side too, without marking the rest of the mirror for upload.
    ///
    /// Falls back to [`set_range`](Self::set_range) when the GPU copy is not current.
    pub fn write_range(&mut self, start: usize, values: &[T]) {
        let end = start + values.len();
        match (&self.context, &self.buffer) {
            (ModeData::Gpu(ctx), Some(buffer)) if !self.dirty && end <= self.data.len() => {
                self.data[start..end].copy_from_slice(values);
                self.generation += 1;
                ctx.queue
                    .write_buffer(buffer, start as BufferAddress * Self::STRIDE, bytemuck::cast_slice(values));
            }
            _ => self.set_range(start, values),
        }
    }

    /// Makes this buffer a copy of `src`, GPU side if both are current and the same size.
    pub fn copy_from(&mut self, encoder: Option<&mut CommandEncoder>, src: &GpuDataBuffer<T>) {
        self.generation += 1;
        let same_len = self.data.len() == src.data.len();
        if same_len {
            self.data.copy_from_slice(&src.data);
        } else {
            self.data.clone_from(&src.data);
        }

        match (encoder, &self.buffer, &src.buffer) {
            (Some(encoder), Some(dst_buffer), Some(src_buffer)) if same_len && !self.dirty && !src.dirty => {
                encoder.copy_buffer_to_buffer(src_buffer, 0, dst_buffer, 0, src_buffer.size());
            }
            _ => self.mark_dirty(),
        }
    }

    /// Zeroes every element, GPU side when the buffer is current.
    pub fn clear(&mut self, encoder: Option<&mut CommandEncoder>) {
        self.generation += 1;
        self.data.fill(T::zeroed());
        match (encoder, &self.buffer) {
            (Some(encoder), Some(buffer)) if !self.dirty => encoder.clear_buffer(buffer, 0, None),
            _ => self.mark_dirty(),
        }
    }

    fn read_gpu(ctx: &GpuContext, staging: &Buffer, receiver: &MapReceiver, block: bool) -> Option<Result<Vec<T>, ReadbackError>> {
        ctx.device.poll(if block { Maintain::Wait } else { Maintain::Poll });

        let received = if block {
            receiver.recv().ok()
        } else {
            match receiver.try_recv() {
                Ok(result) => Some(result),
                Err(flume::TryRecvError::Empty) => return None,
                Err(flume::TryRecvError::Disconnected) => None,
            }
        };

        Some(match received {
            Some(Ok(())) => {
                let data = {
                    let view = staging.slice(..).get_mapped_range();
                    bytemuck::pod_collect_to_vec::<u8, T>(&view)
                };
                staging.unmap();
                Ok(data)
            }
            Some(Err(e)) => Err(ReadbackError::MapFailed(e)),
            None => Err(ReadbackError::MapFailed(BufferAsyncError)),
        })
    }

    fn begin_map(&self, ctx: &GpuContext, buffer: &Buffer) -> (Buffer, MapReceiver) {
        let staging = ctx.device.create_buffer(&BufferDescriptor {
            label: Some(&self.label),
            size: buffer.size(),
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("GpuDataBuffer readback"),
        });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, buffer.size());
        ctx.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = flume::bounded(1);
        staging.slice(..).map_async(MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        (staging, receiver)
    }

    /// Synchronous readback. Blocks until the GPU is done; keep it off the per-frame path.
    ///
    /// The mirror is refreshed with what the GPU holds. Only a dirty mirror is
    /// uploaded first so results written by kernels are not overwritten.
    pub fn get_buffer_data(&mut self) -> Result<&[T], ReadbackError> {
        profiling::scope!("GpuDataBuffer::get_buffer_data");

        self.update_buffer_data(false);

        if let (ModeData::Gpu(ctx), Some(buffer)) = (&self.context, &self.buffer) {
            let (staging, receiver) = self.begin_map(ctx, buffer);
            let data = Self::read_gpu(ctx, &staging, &receiver, true)
                .unwrap_or(Err(ReadbackError::MapFailed(BufferAsyncError)))?;
            if data.len() != self.data.len() {
                return Err(ReadbackError::SizeMismatch {
                    expected: self.data.len(),
                    actual: data.len(),
                });
            }
            self.data = data;
            self.generation += 1;
        }

        Ok(&self.data)
    }

    /// Issues a non-blocking readback, delivering the result to `callback`.
    ///
    /// While a readback is in flight further requests join it: their callback is
    /// queued and no new round trip is made. `write_back` copies the result into
    /// the mirror once it arrives, provided the length still matches.
    pub fn async_data_request(
        &mut self,
        callback: impl FnOnce(Result<&[T], ReadbackError>) + Send + 'static,
        write_back: bool,
    ) -> ReadbackHandle {
        if let Some(ref mut pending) = self.readback {
            pending.callbacks.push(Box::new(callback));
            pending.write_back |= write_back;
            return pending.handle.clone();
        }

        self.update_buffer_data(false);

        let source = match (&self.context, &self.buffer) {
            (ModeData::Gpu(ctx), Some(buffer)) => {
                let (staging, receiver) = self.begin_map(ctx, buffer);
                ReadbackSource::Mapped { staging, receiver }
            }
            _ => ReadbackSource::Snapshot(self.data.clone()),
        };
        self.round_trips += 1;

        let handle = ReadbackHandle::new();
        self.readback = Some(PendingReadback {
            handle: handle.clone(),
            callbacks: vec![Box::new(callback)],
            write_back,
            source,
        });
        handle
    }

    pub fn has_pending_readback(&self) -> bool {
        self.readback.is_some()
    }

    /// Amount of GPU round trips issued by [`async_data_request`](Self::async_data_request).
    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    fn resolve(&self, source: &ReadbackSource<T>, block: bool) -> Option<Result<Vec<T>, ReadbackError>> {
        match (source, &self.context) {
            (ReadbackSource::Snapshot(data), _) => Some(Ok(data.clone())),
            (ReadbackSource::Mapped { staging, receiver }, ModeData::Gpu(ctx)) => {
                Self::read_gpu(ctx, staging, receiver, block)
            }
            (ReadbackSource::Mapped { .. }, ModeData::Cpu(())) => Some(Err(ReadbackError::MapFailed(BufferAsyncError))),
        }
    }

    fn poll_inner(&mut self, block: bool) -> Result<bool, ReadbackError> {
        let Some(pending) = self.readback.take() else {
            return Ok(false);
        };

        let Some(result) = self.resolve(&pending.source, block) else {
            self.readback = Some(pending);
            return Ok(false);
        };

        let PendingReadback {
            handle,
            callbacks,
            write_back,
            ..
        } = pending;

        if !handle.complete() {
            for callback in callbacks {
                callback(Err(ReadbackError::Invalidated));
            }
            return Ok(false);
        }

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                log::error!("{}: readback failed: {e}", self.label);
                for callback in callbacks {
                    callback(Err(e.clone()));
                }
                return Err(e);
            }
        };

        let mut outcome = Ok(true);
        if write_back {
            if data.len() == self.data.len() {
                self.data.copy_from_slice(&data);
                self.generation += 1;
            } else {
                log::error!(
                    "{}: readback of {} elements does not match the mirror's {}, skipping write back",
                    self.label,
                    data.len(),
                    self.data.len()
                );
                outcome = Err(ReadbackError::SizeMismatch {
                    expected: self.data.len(),
                    actual: data.len(),
                });
            }
        }

        for callback in callbacks {
            callback(Ok(&data));
        }

        outcome
    }

    /// Completes the in-flight readback if its data has arrived.
    ///
    /// Returns true if a readback completed during this call.
    pub fn poll_readback(&mut self) -> Result<bool, ReadbackError> {
        self.poll_inner(false)
    }

    /// Blocks until the in-flight readback, if any, has completed.
    pub fn wait_readback(&mut self) -> Result<bool, ReadbackError> {
        self.poll_inner(true)
    }

    /// Frees the GPU buffer and the mirror.
    ///
    /// An in-flight readback is waited on, then invalidated: its callbacks get
    /// [`ReadbackError::Invalidated`] and nothing is written back.
    pub fn release_buffers(&mut self) {
        if let Some(pending) = self.readback.take() {
            // Let the copy land before the staging buffer goes away.
            let _ = self.resolve(&pending.source, true);
            pending.handle.invalidate();
            for callback in pending.callbacks {
                callback(Err(ReadbackError::Invalidated));
            }
        }

        if self.buffer.is_some() {
            log::debug!("{}: releasing gpu buffer", self.label);
        }
        self.buffer = None;
        self.data = Vec::new();
        self.dirty = false;
    }
}

impl<T: Pod> Drop for GpuDataBuffer<T> {
    fn drop(&mut self) {
        if let Some(pending) = self.readback.take() {
            pending.handle.invalidate();
            for callback in pending.callbacks {
                callback(Err(ReadbackError::Invalidated));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use wgpu::BufferUsages;

    use super::GpuDataBuffer;
    use crate::{
        buffer::{CopyRegion, ReadbackState},
        ModeData, ReadbackError,
    };

    fn cpu_buffer(data: Vec<u32>) -> GpuDataBuffer<u32> {
        GpuDataBuffer::with_data("test", ModeData::Cpu(()), BufferUsages::empty(), data)
    }

    #[test]
    fn mutations_mark_dirty() {
        let mut buffer = cpu_buffer(Vec::new());
        assert!(!buffer.is_dirty());
        assert_eq!(buffer.add(3), 0);
        assert!(buffer.is_dirty());
        assert!(buffer.update_buffer_data(false));
        assert!(!buffer.update_buffer_data(false));
        assert!(buffer.update_buffer_data(true));

        let generation = buffer.generation();
        buffer.add_or_set(3, 9);
        assert_eq!(buffer.data(), &[3, 0, 0, 9]);
        assert!(buffer.generation() > generation);
        let generation = buffer.generation();
        buffer.update_buffer_data(false);
        assert_eq!(buffer.generation(), generation);
        buffer.resize(2);
        assert_eq!(buffer.data(), &[3, 0]);
    }

    #[test]
    fn remap_keeps_regions() {
        let mut buffer = cpu_buffer((0..8).collect());
        buffer.remap(10, &[CopyRegion::new(0, 0, 3), CopyRegion::new(5, 7, 3)]);
        assert_eq!(buffer.data(), &[0, 1, 2, 0, 0, 0, 0, 5, 6, 7]);

        buffer.remap_filled(6, &[CopyRegion::new(7, 0, 2)], u32::MAX);
        assert_eq!(buffer.data(), &[5, 6, u32::MAX, u32::MAX, u32::MAX, u32::MAX]);
    }

    #[test]
    fn concurrent_requests_share_one_round_trip() {
        let mut buffer = cpu_buffer(vec![1, 2, 3]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen1 = Arc::clone(&seen);
        let first = buffer.async_data_request(move |r| seen1.lock().push(r.map(<[u32]>::to_vec)), false);
        let seen2 = Arc::clone(&seen);
        let second = buffer.async_data_request(move |r| seen2.lock().push(r.map(<[u32]>::to_vec)), false);

        assert!(first.same_request(&second));
        assert_eq!(buffer.round_trips(), 1);
        assert!(seen.lock().is_empty());

        assert_eq!(buffer.poll_readback(), Ok(true));
        assert_eq!(first.state(), ReadbackState::Completed);
        assert_eq!(*seen.lock(), vec![Ok(vec![1, 2, 3]), Ok(vec![1, 2, 3])]);
        assert_eq!(buffer.poll_readback(), Ok(false));
    }

    #[test]
    fn write_back_requires_matching_length() {
        let mut buffer = cpu_buffer(vec![1, 2, 3]);
        buffer.async_data_request(|_| {}, true);
        buffer.resize(4);
        assert_eq!(
            buffer.poll_readback(),
            Err(ReadbackError::SizeMismatch { expected: 4, actual: 3 })
        );
        assert_eq!(buffer.data(), &[1, 2, 3, 0]);

        buffer.async_data_request(|_| {}, false);
        buffer.data_mut()[0] = 7;
        // A later request asking for write back upgrades the pending one.
        buffer.async_data_request(|_| {}, true);
        assert_eq!(buffer.poll_readback(), Ok(true));
        assert_eq!(buffer.data(), &[1, 2, 3, 0]);
    }

    #[test]
    fn release_invalidates_pending_readback() {
        let mut buffer = cpu_buffer(vec![5; 4]);
        let result = Arc::new(Mutex::new(None));
        let result2 = Arc::clone(&result);
        let handle = buffer.async_data_request(move |r| *result2.lock() = Some(r.map(<[u32]>::to_vec)), true);

        buffer.release_buffers();
        assert_eq!(handle.state(), ReadbackState::Invalidated);
        assert_eq!(*result.lock(), Some(Err(ReadbackError::Invalidated)));
        assert!(buffer.is_empty());
        assert_eq!(buffer.poll_readback(), Ok(false));
        assert!(buffer.is_empty());
    }
}
