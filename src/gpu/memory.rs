// gpu/memory.rs: Storage buffers and host↔device copies.
//
// wgpu has no pitched allocation call. A pitched batch is a plain storage
// buffer whose rows are `pitch` bytes apart, with the pitch rounded up to
// `wgpu::COPY_BYTES_PER_ROW_ALIGNMENT` (256) by the buffer guard. Only the
// guard knows about rows; this file moves whole byte ranges.
//
// TRANSFERS
// ─────────
// Upload:   host bytes → staging buffer (COPY_SRC, initialised at creation)
//           → copy_buffer_to_buffer → storage buffer
// Download: storage buffer → copy_buffer_to_buffer → readback buffer
//           (MAP_READ | COPY_DST) → map_async → poll(Wait) → host bytes
//
// ERROR DETECTION
// ───────────────
// wgpu reports most failures asynchronously through error scopes rather
// than return values. Every operation here pushes a scope, does its work,
// and pops the scope; a captured error becomes the typed ConvError for that
// step. Allocation pushes two scopes (OutOfMemory, then Validation) and pops
// them in reverse order.
//
// NEW RUST CONCEPTS
// ──────────────────
// - `wgpu::BufferUsages::MAP_READ | COPY_DST`: the combination needed to
//   map a buffer back to CPU for readback. `MAP_READ` alone is insufficient.
// - `buffer.slice(..).map_async(MapMode::Read, cb)`: asynchronous map
//   request. We poll the device until the callback fires.

use wgpu::util::DeviceExt;

use crate::error::ConvError;
use crate::gpu::device::GpuDevice;

/// Usage of every batch buffer: bound as storage, written by uploads, read
/// by downloads.
const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_DST)
    .union(wgpu::BufferUsages::COPY_SRC);

impl GpuDevice {
    /// Allocate a storage buffer of at least `bytes` bytes.
    pub(crate) fn create_storage(&self, bytes: usize) -> Result<wgpu::Buffer, ConvError> {
        let size = wgpu::util::align_to(bytes as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        let limits = self.device.limits();
        let max = limits.max_buffer_size.min(u64::from(limits.max_storage_buffer_binding_size));
        if size > max {
            return Err(ConvError::AllocationFailure {
                bytes: size,
                reason: format!("exceeds the device's {max} B storage buffer limit"),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("batchconv::storage"),
            size,
            usage: STORAGE_USAGE,
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());

        match oom.or(validation) {
            Some(e) => {
                buffer.destroy();
                Err(ConvError::AllocationFailure { bytes: size, reason: e.to_string() })
            }
            None => Ok(buffer),
        }
    }

    /// Overwrite the first `data.len()` bytes of `buffer`.
    pub(crate) fn write_storage(&self, buffer: &wgpu::Buffer, data: &[u8]) -> Result<(), ConvError> {
        check_range(buffer, data.len()).map_err(ConvError::upload)?;
        if data.is_empty() {
            return Ok(());
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("batchconv::upload"),
            contents: data,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("batchconv::upload"),
            });
        encoder.copy_buffer_to_buffer(&staging, 0, buffer, 0, data.len() as u64);
        self.queue.submit(std::iter::once(encoder.finish()));

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(ConvError::upload(e.to_string())),
            None => Ok(()),
        }
    }

    /// Copy the first `out.len()` bytes of `buffer` to `out`.
    ///
    /// Blocks until the copy has completed.
    pub(crate) fn read_storage(&self, buffer: &wgpu::Buffer, out: &mut [u8]) -> Result<(), ConvError> {
        check_range(buffer, out.len()).map_err(ConvError::download)?;
        if out.is_empty() {
            return Ok(());
        }
        let size = out.len() as u64;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("batchconv::readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("batchconv::readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &readback, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ConvError::download(e.to_string()));
        }

        // Map the buffer: async in wgpu's API; we block via poll(Wait).
        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| ConvError::download("map callback never fired"))?
            .map_err(|e| ConvError::download(e.to_string()))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        readback.unmap();
        Ok(())
    }

    pub(crate) fn destroy_storage(&self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }
}

/// Copies must stay inside the buffer and move whole 4-byte words.
fn check_range(buffer: &wgpu::Buffer, len: usize) -> Result<(), String> {
    let len = len as u64;
    if len > buffer.size() {
        return Err(format!("{len} B does not fit a {} B buffer", buffer.size()));
    }
    if len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
        return Err(format!(
            "{len} B is not a multiple of {} B",
            wgpu::COPY_BUFFER_ALIGNMENT
        ));
    }
    Ok(())
}
