// gpu/kernel.rs: The conv2d compute pipeline, its launch, and the wait.
//
// One invocation per output pixel; the grid's z dimension is the sample
// index. Bindings (must match shaders/conv2d.wgsl):
//
//   0  src      storage, read        pitched input batch
//   1  dst      storage, read_write  pitched output batch
//   2  params   uniform              ConvParams
//   3  weights  storage, read        9 × i32, row-major
//
// Pitches in ConvParams are in elements, not bytes.

use wgpu::util::DeviceExt;

use crate::accel::{KernelArgs, ELEMENT_BYTES};
use crate::error::ConvError;
use crate::gpu::device::{GpuDevice, WorkgroupSize};

// ---------------------------------------------------------------------------
// Uniform params (must match WGSL struct ConvParams exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ConvParams {
    count: u32,
    rows: u32,
    cols: u32,
    rows_out: u32,
    cols_out: u32,
    in_pitch: u32,
    out_pitch: u32,
    pad_rows: u32,
    pad_cols: u32,
    // Uniform structs are sized in multiples of 16 bytes.
    _pad: [u32; 3],
}

impl ConvParams {
    fn new(args: &KernelArgs<'_, wgpu::Buffer>) -> Result<Self, ConvError> {
        let u = |name: &str, v: usize| {
            u32::try_from(v)
                .map_err(|_| ConvError::LaunchFailure(format!("{name} = {v} does not fit in u32")))
        };
        let d = &args.dims;
        Ok(ConvParams {
            count: u("count", d.count)?,
            rows: u("rows", d.rows)?,
            cols: u("cols", d.cols)?,
            rows_out: u("rows_out", d.rows_out)?,
            cols_out: u("cols_out", d.cols_out)?,
            in_pitch: u("input pitch", args.input_pitch / ELEMENT_BYTES)?,
            out_pitch: u("output pitch", args.output_pitch / ELEMENT_BYTES)?,
            pad_rows: u("pad_rows", d.pad_rows)?,
            pad_cols: u("pad_cols", d.pad_cols)?,
            _pad: [0; 3],
        })
    }
}

// ---------------------------------------------------------------------------
// ConvKernel
// ---------------------------------------------------------------------------

pub(crate) struct ConvKernel {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl ConvKernel {
    pub(crate) fn new(device: &wgpu::Device, workgroup: WorkgroupSize) -> Self {
        let shader_template = include_str!("../shaders/conv2d.wgsl");
        let shader_src = shader_template
            .replace("{{WG_X}}", &workgroup.x.to_string())
            .replace("{{WG_Y}}", &workgroup.y.to_string());

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("conv2d.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("conv2d BGL"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(3, true),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("conv2d pipeline layout"),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("conv2d"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "conv2d",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        ConvKernel { pipeline, bgl }
    }
}

impl GpuDevice {
    /// Encode and submit one conv2d dispatch. Does not wait for it.
    pub(crate) fn launch_conv(&self, args: &KernelArgs<'_, wgpu::Buffer>) -> Result<(), ConvError> {
        let params = ConvParams::new(args)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let params_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("conv2d params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let weights_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("conv2d weights"),
            contents: bytemuck::cast_slice(args.filter.weights()),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("conv2d BG"),
            layout: &self.kernel.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: args.input.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: args.output.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: weights_buf.as_entire_binding() },
            ],
        });

        let [gx, gy, gz] = args.grid;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("conv2d dispatch"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("conv2d"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gx, gy, gz);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(ConvError::LaunchFailure(e.to_string())),
            None => Ok(()),
        }
    }

    /// Block until everything submitted so far has finished executing.
    pub(crate) fn wait_idle(&self) -> Result<(), ConvError> {
        let (sender, receiver) = std::sync::mpsc::channel();
        self.queue.on_submitted_work_done(move || {
            let _ = sender.send(());
        });
        self.device.poll(wgpu::Maintain::Wait);

        if self.is_lost() {
            return Err(ConvError::SynchronizationFailure("device lost".into()));
        }
        receiver
            .recv()
            .map_err(|_| ConvError::SynchronizationFailure("queue never reported completion".into()))
    }
}
