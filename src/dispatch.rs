// dispatch.rs: One conv2d pass over a whole batch.
//
// The grid covers the output with one invocation per output pixel:
//
//   x: ceil(cols_out / wg_x)   y: ceil(rows_out / wg_y)   z: count
//
// Invocations past the edge of the output return immediately (the kernel
// guards every coordinate). The z dimension is the sample index, so a batch
// larger than the backend's per-dimension workgroup limit cannot be launched
// and is reported as a LaunchFailure rather than split.
//
// After the launch the launch error is checked, then the host blocks until
// the device is idle. The wall-clock time of launch-plus-wait is returned;
// it is for diagnostics only.

use std::time::{Duration, Instant};

use log::{error, info};

use crate::accel::{Accelerator, Extent, KernelArgs, LaunchLimits};
use crate::buffer::DeviceBuffer;
use crate::convolution::{ConvDims, Filter3x3};
use crate::error::ConvError;

/// Workgroups needed to cover the output of `dims`.
pub fn grid_for(dims: &ConvDims, limits: &LaunchLimits) -> Result<[u32; 3], ConvError> {
    let to_u32 = |v: usize| {
        u32::try_from(v).map_err(|_| ConvError::LaunchFailure(format!("dimension {v} exceeds u32")))
    };
    let gx = to_u32(dims.cols_out.div_ceil(limits.workgroup_x as usize))?;
    let gy = to_u32(dims.rows_out.div_ceil(limits.workgroup_y as usize))?;
    let gz = to_u32(dims.count)?;
    let grid = [gx, gy, gz];
    let max = limits.max_workgroups_per_dimension;
    if grid.iter().any(|&g| g > max) {
        return Err(ConvError::LaunchFailure(format!(
            "grid {gx}×{gy}×{gz} exceeds {max} workgroups per dimension"
        )));
    }
    Ok(grid)
}

fn buffer_memory<'b, A: Accelerator>(
    buf: &'b DeviceBuffer<'_, A>,
    expected: Extent,
) -> Result<&'b A::Memory, ConvError> {
    if buf.extent() != expected {
        return Err(ConvError::LaunchFailure(format!(
            "{} buffer extent {} does not match {}",
            buf.label(),
            buf.extent(),
            expected
        )));
    }
    buf.memory()
        .ok_or_else(|| ConvError::LaunchFailure(format!("{} buffer is not allocated", buf.label())))
}

/// Run `filter` over every sample of `input`, writing `output`.
///
/// Both buffers must have been allocated with the extents implied by `dims`.
/// Returns the time spent in launch plus synchronization.
pub fn run<A: Accelerator>(
    accel: &A,
    input: &DeviceBuffer<'_, A>,
    output: &DeviceBuffer<'_, A>,
    filter: &Filter3x3,
    dims: &ConvDims,
) -> Result<Duration, ConvError> {
    let result = launch_and_wait(accel, input, output, filter, dims);
    match &result {
        Ok(elapsed) => info!(
            "conv2d {}×{}×{} → {}×{}: {:.3} ms",
            dims.count,
            dims.rows,
            dims.cols,
            dims.rows_out,
            dims.cols_out,
            elapsed.as_secs_f64() * 1e3
        ),
        Err(e) => error!("conv2d: {e}"),
    }
    result
}

fn launch_and_wait<A: Accelerator>(
    accel: &A,
    input: &DeviceBuffer<'_, A>,
    output: &DeviceBuffer<'_, A>,
    filter: &Filter3x3,
    dims: &ConvDims,
) -> Result<Duration, ConvError> {
    let args = KernelArgs {
        input: buffer_memory(input, Extent::of_batch(dims.input_shape()))?,
        input_pitch: input.pitch(),
        output: buffer_memory(output, Extent::of_batch(dims.output_shape()))?,
        output_pitch: output.pitch(),
        dims: *dims,
        filter: *filter,
        grid: grid_for(dims, &accel.launch_limits())?,
    };

    let start = Instant::now();
    accel.launch(&args)?;
    accel.synchronize()?;
    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DeviceOp, FaultPlan, HostAccelerator, HostConfig};
    use crate::layout::BatchShape;

    const LIMITS: LaunchLimits = LaunchLimits {
        workgroup_x: 16,
        workgroup_y: 8,
        max_workgroups_per_dimension: 65_535,
    };

    #[test]
    fn test_grid_exact() {
        let dims = ConvDims::same(BatchShape::new(3, 480, 640)).unwrap();
        assert_eq!(grid_for(&dims, &LIMITS).unwrap(), [40, 60, 3]);
    }

    #[test]
    fn test_grid_ceiling() {
        // 100 / 16 → 7, 100 / 8 → 13. The last workgroups hang past the edge.
        let dims = ConvDims::same(BatchShape::new(1, 100, 100)).unwrap();
        assert_eq!(grid_for(&dims, &LIMITS).unwrap(), [7, 13, 1]);
    }

    #[test]
    fn test_grid_too_many_samples() {
        let limits = LaunchLimits { max_workgroups_per_dimension: 4, ..LIMITS };
        let dims = ConvDims::same(BatchShape::new(5, 8, 8)).unwrap();
        let err = grid_for(&dims, &limits).unwrap_err();
        assert!(matches!(err, ConvError::LaunchFailure(_)), "{err}");
    }

    #[test]
    fn test_run_launches_then_synchronizes() {
        let accel = HostAccelerator::default();
        let dims = ConvDims::same(BatchShape::new(1, 4, 4)).unwrap();
        let extent = Extent::of_batch(dims.input_shape());
        let input = DeviceBuffer::allocate_pitched(&accel, extent, "input").unwrap();
        let output = DeviceBuffer::allocate_pitched(&accel, extent, "output").unwrap();
        input.upload_batch(&(0..16).collect::<Vec<_>>(), extent).unwrap();

        run(&accel, &input, &output, &Filter3x3::VERTICAL_SUM, &dims).unwrap();

        let mut out = vec![0; 16];
        output.download_batch(&mut out, extent).unwrap();
        assert_eq!(&out[..4], &[4, 6, 8, 10]);

        let journal = accel.journal();
        let launch = journal.iter().position(|op| matches!(op, DeviceOp::Launch { .. })).unwrap();
        assert_eq!(journal[launch + 1], DeviceOp::Synchronize);
    }

    #[test]
    fn test_run_rejects_wrong_output_extent() {
        let accel = HostAccelerator::default();
        let dims = ConvDims::same(BatchShape::new(1, 4, 4)).unwrap();
        let extent = Extent::of_batch(dims.input_shape());
        let input = DeviceBuffer::allocate_pitched(&accel, extent, "input").unwrap();
        let output =
            DeviceBuffer::allocate_pitched(&accel, Extent::new(8, 2, 1), "output").unwrap();
        let err = run(&accel, &input, &output, &Filter3x3::VERTICAL_SUM, &dims).unwrap_err();
        assert!(matches!(err, ConvError::LaunchFailure(_)), "{err}");
        assert!(!accel.journal().iter().any(|op| matches!(op, DeviceOp::Launch { .. })));
    }

    #[test]
    fn test_synchronize_failure_is_reported() {
        let accel = HostAccelerator::new(HostConfig {
            faults: FaultPlan { fail_synchronize: true, ..FaultPlan::default() },
            ..HostConfig::default()
        });
        let dims = ConvDims::same(BatchShape::new(1, 2, 2)).unwrap();
        let extent = Extent::of_batch(dims.input_shape());
        let input = DeviceBuffer::allocate_linear(&accel, extent, "input").unwrap();
        let output = DeviceBuffer::allocate_linear(&accel, extent, "output").unwrap();
        let err = run(&accel, &input, &output, &Filter3x3::IDENTITY, &dims).unwrap_err();
        assert!(matches!(err, ConvError::SynchronizationFailure(_)), "{err}");
    }
}
