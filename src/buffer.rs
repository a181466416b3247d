// buffer.rs: Device buffer guards.
//
// A `DeviceBuffer` owns exactly one device allocation and knows how it is
// laid out:
//
//   host (packed):    row0 row1 row2 ... (width_bytes apart)
//   device (pitched): row0 ░░ row1 ░░ row2 ░░ ... (pitch bytes apart)
//
// `upload_batch` and `download_batch` do the translation through a staging
// vector; the backend only ever sees whole allocations. With a linear
// allocation the pitch equals `width_bytes` and no staging copy is made.
//
// RELEASE
// ───────
// The allocation is an `Option`. `release` takes it, so releasing twice, or
// releasing a buffer whose allocation failed, is a no-op. `Drop` calls
// `release`, so an early `?` return can never leak device memory.
//
// `DeviceScope` is the per-call arena. It records every buffer a call tried
// to allocate, including ones whose allocation failed, and `release_all`
// walks that list in allocation order.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info};

use crate::accel::{align_to, Accelerator, Extent, ELEMENT_BYTES};
use crate::error::ConvError;

/// How rows are spaced in a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLayout {
    /// Rows padded to the accelerator's pitch alignment.
    Pitched,
    /// Rows packed back to back.
    Linear,
}

// ---------------------------------------------------------------------------
// DeviceBuffer
// ---------------------------------------------------------------------------

/// One device allocation, released on drop.
pub struct DeviceBuffer<'a, A: Accelerator> {
    accel: &'a A,
    memory: Option<A::Memory>,
    extent: Extent,
    /// Bytes between the starts of consecutive rows.
    pitch: usize,
    label: &'static str,
}

impl<A: Accelerator> std::fmt::Debug for DeviceBuffer<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("allocated", &self.memory.is_some())
            .field("extent", &self.extent)
            .field("pitch", &self.pitch)
            .field("label", &self.label)
            .finish()
    }
}

impl<'a, A: Accelerator> DeviceBuffer<'a, A> {
    /// Allocate a pitched region for `extent`. The pitch is `width_bytes`
    /// rounded up to the accelerator's pitch alignment.
    pub fn allocate_pitched(
        accel: &'a A,
        extent: Extent,
        label: &'static str,
    ) -> Result<Self, ConvError> {
        Self::allocate(accel, BufferLayout::Pitched, extent, label)
    }

    /// Allocate a packed region for `extent` (pitch == width_bytes).
    pub fn allocate_linear(
        accel: &'a A,
        extent: Extent,
        label: &'static str,
    ) -> Result<Self, ConvError> {
        Self::allocate(accel, BufferLayout::Linear, extent, label)
    }

    pub fn allocate(
        accel: &'a A,
        layout: BufferLayout,
        extent: Extent,
        label: &'static str,
    ) -> Result<Self, ConvError> {
        let mut buf = Self::unallocated(accel, layout, extent, label);
        buf.memory = Some(buf.try_allocate()?);
        Ok(buf)
    }

    /// A guard with no allocation behind it.
    fn unallocated(accel: &'a A, layout: BufferLayout, extent: Extent, label: &'static str) -> Self {
        let pitch = match layout {
            BufferLayout::Pitched => align_to(extent.width_bytes, accel.pitch_alignment()),
            BufferLayout::Linear => extent.width_bytes,
        };
        DeviceBuffer { accel, memory: None, extent, pitch, label }
    }

    fn try_allocate(&self) -> Result<A::Memory, ConvError> {
        let bytes = self.allocation_bytes();
        let result = if self.extent.is_empty() {
            Err(ConvError::AllocationFailure {
                bytes: 0,
                reason: format!("{} extent {} is empty", self.label, self.extent),
            })
        } else if self.extent.width_bytes % ELEMENT_BYTES != 0 {
            Err(ConvError::AllocationFailure {
                bytes: bytes as u64,
                reason: format!(
                    "{} row of {} B is not a whole number of {ELEMENT_BYTES}-byte elements",
                    self.label, self.extent.width_bytes
                ),
            })
        } else {
            self.accel.allocate(bytes)
        };
        match &result {
            Ok(_) => info!(
                "allocate {}: {} pitch {} B, {} B on {}",
                self.label,
                self.extent,
                self.pitch,
                bytes,
                self.accel.describe()
            ),
            Err(e) => error!("allocate {}: {e}", self.label),
        }
        result
    }

    #[inline]
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Row pitch in bytes.
    #[inline]
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Row pitch in elements.
    #[inline]
    pub fn pitch_elements(&self) -> usize {
        self.pitch / ELEMENT_BYTES
    }

    /// Bytes the allocation spans, pitch padding included.
    #[inline]
    pub fn allocation_bytes(&self) -> usize {
        self.pitch * self.extent.total_rows()
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.memory.is_some()
    }

    #[inline]
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn memory(&self) -> Option<&A::Memory> {
        self.memory.as_ref()
    }

    #[inline]
    fn is_packed(&self) -> bool {
        self.pitch == self.extent.width_bytes
    }

    fn check_transfer(&self, host_len: usize, extent: Extent) -> Result<&A::Memory, String> {
        if extent != self.extent {
            return Err(format!(
                "{} extent {} does not match allocation {}",
                self.label, extent, self.extent
            ));
        }
        if extent.width_bytes % ELEMENT_BYTES != 0 {
            return Err(format!(
                "{} row of {} B is not a whole number of {ELEMENT_BYTES}-byte elements",
                self.label, extent.width_bytes
            ));
        }
        if host_len * ELEMENT_BYTES != extent.bytes() {
            return Err(format!(
                "{} host buffer holds {} elements, extent {} needs {}",
                self.label,
                host_len,
                extent,
                extent.bytes() / ELEMENT_BYTES
            ));
        }
        self.memory
            .as_ref()
            .ok_or_else(|| format!("{} has no device allocation", self.label))
    }

    /// Copy a packed host batch into the device allocation.
    ///
    /// `extent` must equal the allocation's extent and `host` must hold
    /// exactly `extent.bytes()` bytes of i32s.
    pub fn upload_batch(&self, host: &[i32], extent: Extent) -> Result<(), ConvError> {
        let result = self
            .check_transfer(host.len(), extent)
            .map_err(ConvError::upload)
            .and_then(|memory| {
                if self.is_packed() {
                    self.accel.write(memory, bytemuck::cast_slice(host))
                } else {
                    let staged = self.stage_pitched(host);
                    self.accel.write(memory, bytemuck::cast_slice(&staged))
                }
            });
        match &result {
            Ok(()) => info!("upload {}: {} B host→device", self.label, extent.bytes()),
            Err(e) => error!("upload {}: {e}", self.label),
        }
        result
    }

    /// Copy the device allocation back into a packed host batch.
    pub fn download_batch(&self, host: &mut [i32], extent: Extent) -> Result<(), ConvError> {
        let result = self
            .check_transfer(host.len(), extent)
            .map_err(ConvError::download)
            .and_then(|memory| {
                if self.is_packed() {
                    self.accel.read(memory, bytemuck::cast_slice_mut(host))
                } else {
                    let mut staged = vec![0i32; self.allocation_bytes() / ELEMENT_BYTES];
                    self.accel.read(memory, bytemuck::cast_slice_mut(&mut staged))?;
                    self.unstage_pitched(&staged, host);
                    Ok(())
                }
            });
        match &result {
            Ok(()) => info!("download {}: {} B device→host", self.label, extent.bytes()),
            Err(e) => error!("download {}: {e}", self.label),
        }
        result
    }

    /// Packed rows → pitched rows. Padding is zero.
    fn stage_pitched(&self, host: &[i32]) -> Vec<i32> {
        let row = self.extent.row_elements();
        let pitch = self.pitch_elements();
        let mut staged = vec![0i32; pitch * self.extent.total_rows()];
        for (dst, src) in staged.chunks_exact_mut(pitch).zip(host.chunks_exact(row)) {
            dst[..row].copy_from_slice(src);
        }
        staged
    }

    /// Pitched rows → packed rows.
    fn unstage_pitched(&self, staged: &[i32], host: &mut [i32]) {
        let row = self.extent.row_elements();
        let pitch = self.pitch_elements();
        for (dst, src) in host.chunks_exact_mut(row).zip(staged.chunks_exact(pitch)) {
            dst.copy_from_slice(&src[..row]);
        }
    }

    /// Free the allocation. Returns whether anything was freed.
    pub fn release(&mut self) -> bool {
        match self.memory.take() {
            Some(memory) => {
                self.accel.free(memory);
                debug!("release {}: {} B", self.label, self.allocation_bytes());
                true
            }
            None => false,
        }
    }
}

impl<A: Accelerator> Drop for DeviceBuffer<'_, A> {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// DeviceScope
// ---------------------------------------------------------------------------

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(0);

/// Handle of a buffer inside the `DeviceScope` that allocated it.
///
/// Only a scope creates ids, and each id names its scope, so an id used
/// with any other scope finds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    scope: u64,
    index: usize,
}

/// Every device buffer touched by one convolution call.
pub struct DeviceScope<'a, A: Accelerator> {
    accel: &'a A,
    id: u64,
    buffers: Vec<DeviceBuffer<'a, A>>,
}

impl<'a, A: Accelerator> DeviceScope<'a, A> {
    pub fn new(accel: &'a A) -> Self {
        let id = NEXT_SCOPE.fetch_add(1, Ordering::Relaxed);
        DeviceScope { accel, id, buffers: Vec::new() }
    }

    /// Allocate a buffer and register it. A failed allocation is registered
    /// too, as an unallocated guard, before the error is returned.
    pub fn allocate(
        &mut self,
        layout: BufferLayout,
        extent: Extent,
        label: &'static str,
    ) -> Result<BufferId, ConvError> {
        let mut buf = DeviceBuffer::unallocated(self.accel, layout, extent, label);
        let id = BufferId { scope: self.id, index: self.buffers.len() };
        match buf.try_allocate() {
            Ok(memory) => {
                buf.memory = Some(memory);
                self.buffers.push(buf);
                Ok(id)
            }
            Err(e) => {
                self.buffers.push(buf);
                Err(e)
            }
        }
    }

    /// The buffer registered under `id`, `None` if `id` belongs to another
    /// scope.
    pub fn get(&self, id: BufferId) -> Option<&DeviceBuffer<'a, A>> {
        if id.scope != self.id {
            return None;
        }
        self.buffers.get(id.index)
    }

    /// Buffers registered so far, allocated or not.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffers currently holding device memory.
    pub fn live(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_allocated()).count()
    }

    /// Release every registered buffer. Returns how many allocations were
    /// actually freed.
    pub fn release_all(&mut self) -> usize {
        let freed = self.buffers.iter_mut().map(|b| b.release()).filter(|&f| f).count();
        if !self.buffers.is_empty() {
            debug!("scope released {freed} of {} buffers", self.buffers.len());
        }
        freed
    }
}

impl<A: Accelerator> Drop for DeviceScope<'_, A> {
    fn drop(&mut self) {
        self.release_all();
    }
}
