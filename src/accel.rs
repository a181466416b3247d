// accel.rs: The device seam.
//
// Everything above this trait (buffer guards, dispatcher, engine) is written
// once against `Accelerator`; everything below it is a backend:
//
//   gpu::GpuDevice        wgpu storage buffers + the conv2d compute shader
//   host::HostAccelerator host memory, same addressing, fault injection
//
// The trait is deliberately byte-oriented. Pitch translation (host rows are
// packed, device rows are `pitch` bytes apart) happens once, in buffer.rs,
// so a backend only ever sees whole allocations.
//
// NEW RUST CONCEPTS:
// - Associated type `Memory`: each backend names its own handle type
//   (`wgpu::Buffer`, `HostMemory`). `free` takes it by value, so a handle
//   cannot be used after it has been released.

use std::fmt;

use crate::convolution::{ConvDims, Filter3x3};
use crate::error::ConvError;
use crate::layout::BatchShape;

/// Size in bytes of one device element (i32).
pub const ELEMENT_BYTES: usize = std::mem::size_of::<i32>();

/// Round `value` up to the next multiple of `alignment`.
///
///   align_to(100, 256) = 256
///   align_to(256, 256) = 256
///   align_to(257, 256) = 512
#[inline]
pub fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

// ---------------------------------------------------------------------------
// Extent
// ---------------------------------------------------------------------------

/// Logical size of a batch on the device: `depth` samples of `height` rows,
/// each row `width_bytes` bytes of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width_bytes: usize,
    pub height: usize,
    pub depth: usize,
}

impl Extent {
    pub const fn new(width_bytes: usize, height: usize, depth: usize) -> Self {
        Extent { width_bytes, height, depth }
    }

    /// Extent of an i32 batch of the given shape.
    pub const fn of_batch(shape: BatchShape) -> Self {
        Extent::new(shape.cols * ELEMENT_BYTES, shape.rows, shape.count)
    }

    /// Elements of payload per row.
    #[inline]
    pub const fn row_elements(&self) -> usize {
        self.width_bytes / ELEMENT_BYTES
    }

    /// Number of rows across all samples.
    #[inline]
    pub const fn total_rows(&self) -> usize {
        self.height * self.depth
    }

    /// Payload bytes, excluding any pitch padding.
    #[inline]
    pub const fn bytes(&self) -> usize {
        self.width_bytes * self.height * self.depth
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.bytes() == 0
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{} B", self.depth, self.height, self.width_bytes)
    }
}

// ---------------------------------------------------------------------------
// Launch description
// ---------------------------------------------------------------------------

/// Workgroup geometry the backend launches with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchLimits {
    pub workgroup_x: u32,
    pub workgroup_y: u32,
    /// Largest workgroup count accepted in any one grid dimension.
    pub max_workgroups_per_dimension: u32,
}

/// Everything one conv2d launch needs. Pitches are in bytes.
#[derive(Debug)]
pub struct KernelArgs<'m, M> {
    pub input: &'m M,
    pub input_pitch: usize,
    pub output: &'m M,
    pub output_pitch: usize,
    pub dims: ConvDims,
    pub filter: Filter3x3,
    /// Workgroups in x, y, z.
    pub grid: [u32; 3],
}

// ---------------------------------------------------------------------------
// Accelerator
// ---------------------------------------------------------------------------

/// A device that can hold i32 batches and run the conv2d kernel over them.
///
/// All operations are blocking from the caller's point of view except
/// `launch`, which may return before the kernel has finished; callers must
/// `synchronize` before reading the output.
pub trait Accelerator {
    /// Handle to one device allocation.
    type Memory;

    /// Human-readable description for diagnostics.
    fn describe(&self) -> String;

    /// Row pitch alignment in bytes for pitched allocations. A power of two
    /// and a multiple of `ELEMENT_BYTES`.
    fn pitch_alignment(&self) -> usize;

    fn launch_limits(&self) -> LaunchLimits;

    /// Allocate `bytes` bytes. Contents are unspecified.
    fn allocate(&self, bytes: usize) -> Result<Self::Memory, ConvError>;

    /// Overwrite the first `data.len()` bytes of `memory`.
    fn write(&self, memory: &Self::Memory, data: &[u8]) -> Result<(), ConvError>;

    /// Copy the first `out.len()` bytes of `memory` into `out`.
    fn read(&self, memory: &Self::Memory, out: &mut [u8]) -> Result<(), ConvError>;

    /// Enqueue one conv2d pass. Errors detectable at launch time are
    /// reported here.
    fn launch(&self, args: &KernelArgs<'_, Self::Memory>) -> Result<(), ConvError>;

    /// Block until all launched work has completed.
    fn synchronize(&self) -> Result<(), ConvError>;

    fn free(&self, memory: Self::Memory);
}
