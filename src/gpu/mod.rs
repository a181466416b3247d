// gpu/mod.rs: wgpu backend for the convolution engine.
//
// `GpuDevice` implements `Accelerator`:
//
//   allocate    → storage buffer, error-scoped          (memory.rs)
//   write/read  → staging copies                        (memory.rs)
//   launch      → conv2d dispatch, error-scoped         (kernel.rs)
//   synchronize → wait for queue completion + lost flag (kernel.rs)
//
// The host implementation in `convolution::convolve_pitched` is the
// reference: every GPU result is checked against it element for element.

pub mod device;
pub(crate) mod kernel;
mod memory;

pub use device::{
    AdapterSelection, DeviceProfile, DeviceProperties, GpuConfig, GpuDevice, GpuError,
    WorkgroupSize,
};

use crate::accel::{Accelerator, KernelArgs, LaunchLimits};
use crate::error::ConvError;

impl Accelerator for GpuDevice {
    type Memory = wgpu::Buffer;

    fn describe(&self) -> String {
        self.properties().name.clone()
    }

    fn pitch_alignment(&self) -> usize {
        wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize
    }

    fn launch_limits(&self) -> LaunchLimits {
        LaunchLimits {
            workgroup_x: self.workgroup_size.x,
            workgroup_y: self.workgroup_size.y,
            max_workgroups_per_dimension: self.properties().max_workgroups_per_dimension,
        }
    }

    fn allocate(&self, bytes: usize) -> Result<wgpu::Buffer, ConvError> {
        self.create_storage(bytes)
    }

    fn write(&self, memory: &wgpu::Buffer, data: &[u8]) -> Result<(), ConvError> {
        self.write_storage(memory, data)
    }

    fn read(&self, memory: &wgpu::Buffer, out: &mut [u8]) -> Result<(), ConvError> {
        self.read_storage(memory, out)
    }

    fn launch(&self, args: &KernelArgs<'_, wgpu::Buffer>) -> Result<(), ConvError> {
        self.launch_conv(args)
    }

    fn synchronize(&self) -> Result<(), ConvError> {
        self.wait_idle()
    }

    fn free(&self, memory: wgpu::Buffer) {
        self.destroy_storage(memory);
    }
}
