// engine.rs: The public entry point: one convolution call, start to finish.
//
// A call is a fixed sequence of steps, each of which logs its outcome and
// any one of which may end the call:
//
//   1. validate dims             (InvalidBatch / OutputShape, no device work)
//   2. allocate input
//   3. upload input
//   4. allocate output
//   5. upload zeros to output
//   6. launch + synchronize      (timed)
//   7. download output
//
// Steps 2–7 run inside `lifecycle::run_scoped`, so the scope's buffers are
// freed on every exit before the status is returned. Device memory never
// outlives a call; two calls never share a buffer.
//
// Two paths share the sequence:
//   convolve_volume  3D volume in/out, pitched device buffers
//   convolve_flat    1D batch in/out,  linear device buffers

use std::borrow::Cow;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;

use crate::accel::{Accelerator, Extent};
use crate::buffer::{BufferId, BufferLayout, DeviceBuffer, DeviceScope};
use crate::convolution::{ConvDims, Filter3x3};
use crate::dispatch;
use crate::error::ConvError;
use crate::gpu::{GpuConfig, GpuDevice};
use crate::image::{Image, Pixel};
use crate::layout::{self, BatchShape, FlatBatch, Volume};
use crate::lifecycle::{run_scoped, Lifecycle};

/// Output of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvRun<T> {
    pub output: T,
    /// Launch plus synchronization, wall clock.
    pub kernel_time: Duration,
}

pub struct ConvolutionEngine<A: Accelerator> {
    accel: A,
    filter: Filter3x3,
    last: Mutex<Option<Lifecycle>>,
}

impl<A: Accelerator> ConvolutionEngine<A> {
    /// An engine applying `Filter3x3::VERTICAL_SUM`.
    pub fn new(accel: A) -> Self {
        ConvolutionEngine { accel, filter: Filter3x3::VERTICAL_SUM, last: Mutex::new(None) }
    }

    pub fn with_filter(mut self, filter: Filter3x3) -> Self {
        self.filter = filter;
        self
    }

    pub fn filter(&self) -> &Filter3x3 {
        &self.filter
    }

    pub fn accelerator(&self) -> &A {
        &self.accel
    }

    /// Lifecycle of the most recent call.
    pub fn last_lifecycle(&self) -> Option<Lifecycle> {
        self.last.lock().clone()
    }

    /// Convolve a 3D volume through pitched device buffers.
    pub fn convolve_volume(
        &self,
        input: &Volume<i32>,
        rows_out: usize,
        cols_out: usize,
    ) -> Result<ConvRun<Volume<i32>>, ConvError> {
        let host: Cow<'_, [i32]> = if input.is_compact() {
            Cow::Borrowed(input.as_slice())
        } else {
            Cow::Owned(layout::flatten(input).into_vec())
        };
        let (output, kernel_time) =
            self.execute(BufferLayout::Pitched, &host, input.shape(), rows_out, cols_out)?;
        Ok(ConvRun { output: layout::unflatten(&output), kernel_time })
    }

    /// Convolve a flat batch through linear device buffers.
    pub fn convolve_flat(
        &self,
        input: &FlatBatch<i32>,
        rows_out: usize,
        cols_out: usize,
    ) -> Result<ConvRun<FlatBatch<i32>>, ConvError> {
        let (output, kernel_time) =
            self.execute(BufferLayout::Linear, input.as_slice(), input.shape(), rows_out, cols_out)?;
        Ok(ConvRun { output, kernel_time })
    }

    /// Gather `images` into a `rows × cols` volume, convolve it, and split
    /// the result back into one image per sample.
    pub fn convolve_images<P: Pixel>(
        &self,
        images: &[Image<P>],
        rows: usize,
        cols: usize,
        rows_out: usize,
        cols_out: usize,
    ) -> Result<ConvRun<Vec<Image<i32>>>, ConvError> {
        let volume = layout::to_nested_3d(images, rows, cols)
            .map_err(|e| ConvError::InvalidBatch(e.to_string()))?;
        let run = self.convolve_volume(&volume, rows_out, cols_out)?;
        Ok(ConvRun {
            output: layout::split_samples(&layout::flatten(&run.output)),
            kernel_time: run.kernel_time,
        })
    }

    fn execute(
        &self,
        buffers: BufferLayout,
        host_in: &[i32],
        shape: BatchShape,
        rows_out: usize,
        cols_out: usize,
    ) -> Result<(FlatBatch<i32>, Duration), ConvError> {
        let (result, lifecycle) = run_scoped(&self.accel, |scope| {
            let dims = ConvDims::new(shape, rows_out, cols_out)?;
            if host_in.len() != shape.len() {
                return Err(ConvError::InvalidBatch(format!(
                    "host batch holds {} elements, shape {}×{}×{} needs {}",
                    host_in.len(),
                    shape.count,
                    shape.rows,
                    shape.cols,
                    shape.len()
                )));
            }
            self.pass(scope, buffers, host_in, &dims)
        });
        *self.last.lock() = Some(lifecycle);
        result
    }

    fn pass(
        &self,
        scope: &mut DeviceScope<'_, A>,
        buffers: BufferLayout,
        host_in: &[i32],
        dims: &ConvDims,
    ) -> Result<(FlatBatch<i32>, Duration), ConvError> {
        info!(
            "convolve {}×{}×{} → {}×{} ({buffers:?}) on {}",
            dims.count,
            dims.rows,
            dims.cols,
            dims.rows_out,
            dims.cols_out,
            self.accel.describe()
        );
        let out_shape = dims.output_shape();
        let in_extent = Extent::of_batch(dims.input_shape());
        let out_extent = Extent::of_batch(out_shape);

        let input = scope.allocate(buffers, in_extent, "input")?;
        buffer(scope, input)?.upload_batch(host_in, in_extent)?;

        let output = scope.allocate(buffers, out_extent, "output")?;
        let mut host_out = vec![0i32; out_shape.len()];
        buffer(scope, output)?.upload_batch(&host_out, out_extent)?;

        let (src, dst) = (buffer(scope, input)?, buffer(scope, output)?);
        let kernel_time = dispatch::run(&self.accel, src, dst, &self.filter, dims)?;

        dst.download_batch(&mut host_out, out_extent)?;
        let output = FlatBatch::from_vec(out_shape, host_out)
            .map_err(|e| ConvError::InvalidBatch(e.to_string()))?;
        Ok((output, kernel_time))
    }
}

fn buffer<'s, 'a, A: Accelerator>(
    scope: &'s DeviceScope<'a, A>,
    id: BufferId,
) -> Result<&'s DeviceBuffer<'a, A>, ConvError> {
    scope
        .get(id)
        .ok_or_else(|| ConvError::InvalidBatch(format!("{id:?} is not registered in this call")))
}

impl ConvolutionEngine<GpuDevice> {
    /// Open the adapter selected by `config` and build an engine on it.
    pub fn with_gpu(config: &GpuConfig) -> Result<Self, ConvError> {
        let gpu = GpuDevice::with_config(config)?;
        info!("{}", gpu.properties());
        Ok(ConvolutionEngine::new(gpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::host::{DeviceOp, HostAccelerator};
    use crate::lifecycle::Phase;

    fn ramp_volume() -> Volume<i32> {
        let flat = FlatBatch::from_vec(BatchShape::new(1, 4, 4), (0..16).collect()).unwrap();
        layout::unflatten(&flat)
    }

    #[test]
    fn test_volume_vertical_sum() {
        let engine = ConvolutionEngine::new(HostAccelerator::default());
        let run = engine.convolve_volume(&ramp_volume(), 4, 4).unwrap();
        assert_eq!(run.output.row(0, 0), &[4, 6, 8, 10]);
        assert_eq!(run.output.row(0, 3), &[20, 22, 24, 26]);
        let lc = engine.last_lifecycle().unwrap();
        assert_eq!(lc.history(), &[Phase::Running, Phase::Cleanup, Phase::Done]);
        assert_eq!(lc.released(), 2);
    }

    #[test]
    fn test_padded_volume_is_packed_before_upload() {
        let engine = ConvolutionEngine::new(HostAccelerator::default());
        let padded = ramp_volume().restride(9);
        let a = engine.convolve_volume(&padded, 2, 2).unwrap();
        let b = engine.convolve_volume(&ramp_volume(), 2, 2).unwrap();
        assert_eq!(a.output, b.output);
    }

    #[test]
    fn test_output_shape_rejected_without_device_work() {
        let engine = ConvolutionEngine::new(HostAccelerator::default());
        let err = engine.convolve_volume(&ramp_volume(), 3, 4).unwrap_err();
        assert!(matches!(err, ConvError::OutputShape { .. }));
        assert!(engine.accelerator().journal().is_empty());
        assert_eq!(engine.last_lifecycle().unwrap().status(), Status::InvalidInput);
    }

    #[test]
    fn test_step_order() {
        let engine = ConvolutionEngine::new(HostAccelerator::default());
        let flat = FlatBatch::from_vec(BatchShape::new(2, 3, 3), vec![1; 18]).unwrap();
        engine.convolve_flat(&flat, 3, 3).unwrap();
        let kinds: Vec<&str> = engine
            .accelerator()
            .journal()
            .iter()
            .map(|op| match op {
                DeviceOp::Allocate { .. } => "alloc",
                DeviceOp::AllocateFailed { .. } => "alloc-failed",
                DeviceOp::Write { .. } => "write",
                DeviceOp::Read { .. } => "read",
                DeviceOp::Launch { .. } => "launch",
                DeviceOp::Synchronize => "sync",
                DeviceOp::Free { .. } => "free",
            })
            .collect();
        assert_eq!(
            kinds,
            ["alloc", "write", "alloc", "write", "launch", "sync", "read", "free", "free"]
        );
    }
}
