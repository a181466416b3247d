// host.rs: An `Accelerator` backed by host memory.
//
// Runs the same pitched addressing and the same kernel arithmetic as the GPU
// backend (the kernel is `convolution::convolve_pitched`), so everything
// above the device seam can be exercised without a GPU. On top of that it can
// misbehave on request:
//
//   capacity_bytes   allocations beyond this many live bytes fail
//   FaultPlan        fail the nth allocation / nth upload, any download,
//                    any launch, or any synchronize
//
// Freed allocations go to a recycle pool and are handed out again without
// being cleared, like a real device allocator. The pool keeps one block per
// size and at most `RECYCLE_SIZES` sizes. Never-used memory is filled with
// `UNINIT_FILL`. Both make it visible when a caller reads memory it never
// wrote.
//
// Every operation is appended to a journal so tests can assert on the exact
// sequence of device work a call performed. The journal keeps the most
// recent `journal_limit` entries.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::accel::{Accelerator, KernelArgs, LaunchLimits, ELEMENT_BYTES};
use crate::convolution::convolve_pitched;
use crate::error::ConvError;

/// Contents of freshly allocated, never-used host device memory.
pub const UNINIT_FILL: i32 = 0x5EAD_BEEF;

/// Distinct allocation sizes the recycle pool holds on to.
pub const RECYCLE_SIZES: usize = 16;

/// Failures to inject. Counters start when the plan is installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail the nth allocation (0-based).
    pub fail_allocation_at: Option<usize>,
    /// Fail the nth host→device write (0-based).
    pub fail_upload_at: Option<usize>,
    pub fail_download: bool,
    pub fail_launch: bool,
    pub fail_synchronize: bool,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Row pitch alignment in bytes. Rounded up to a power of two of at
    /// least `ELEMENT_BYTES`.
    pub pitch_alignment: usize,
    /// Maximum live bytes, `None` for unbounded.
    pub capacity_bytes: Option<usize>,
    pub limits: LaunchLimits,
    pub faults: FaultPlan,
    /// Journal entries kept; older ones are dropped. 0 disables the journal.
    pub journal_limit: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            pitch_alignment: 512,
            capacity_bytes: None,
            limits: LaunchLimits {
                workgroup_x: 16,
                workgroup_y: 8,
                max_workgroups_per_dimension: 65_535,
            },
            faults: FaultPlan::default(),
            journal_limit: 1024,
        }
    }
}

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    Allocate { id: u64, bytes: usize },
    AllocateFailed { bytes: usize },
    Write { id: u64, bytes: usize },
    Read { id: u64, bytes: usize },
    Launch { input: u64, output: u64, grid: [u32; 3] },
    Synchronize,
    Free { id: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub total_allocations: usize,
}

/// Handle to one host-emulated device allocation.
#[derive(Debug)]
pub struct HostMemory {
    id: u64,
    bytes: usize,
}

impl HostMemory {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    memories: HashMap<u64, Vec<i32>>,
    /// Freed storage by length in elements.
    recycled: HashMap<usize, Vec<i32>>,
    faults: FaultPlan,
    allocations_seen: usize,
    uploads_seen: usize,
    journal: VecDeque<DeviceOp>,
    journal_limit: usize,
    stats: HostStats,
}

impl State {
    fn record(&mut self, op: DeviceOp) {
        if self.journal_limit == 0 {
            return;
        }
        if self.journal.len() == self.journal_limit {
            self.journal.pop_front();
        }
        self.journal.push_back(op);
    }

    fn recycle(&mut self, storage: Vec<i32>) {
        if self.recycled.len() < RECYCLE_SIZES || self.recycled.contains_key(&storage.len()) {
            self.recycled.insert(storage.len(), storage);
        }
    }

    fn storage(&self, memory: &HostMemory) -> Result<&Vec<i32>, String> {
        self.memories
            .get(&memory.id)
            .ok_or_else(|| format!("buffer #{} is not allocated", memory.id))
    }
}

pub struct HostAccelerator {
    config: HostConfig,
    state: Mutex<State>,
}

impl HostAccelerator {
    pub fn new(mut config: HostConfig) -> Self {
        config.pitch_alignment = config.pitch_alignment.max(ELEMENT_BYTES).next_power_of_two();
        let state = State {
            faults: config.faults.clone(),
            journal_limit: config.journal_limit,
            ..State::default()
        };
        HostAccelerator { config, state: Mutex::new(state) }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Install a new fault plan and reset its counters.
    pub fn set_faults(&self, faults: FaultPlan) {
        let mut st = self.state.lock();
        st.faults = faults;
        st.allocations_seen = 0;
        st.uploads_seen = 0;
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats
    }

    pub fn journal(&self) -> Vec<DeviceOp> {
        self.state.lock().journal.iter().cloned().collect()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }
}

impl Default for HostAccelerator {
    fn default() -> Self {
        HostAccelerator::new(HostConfig::default())
    }
}

impl Accelerator for HostAccelerator {
    type Memory = HostMemory;

    fn describe(&self) -> String {
        format!("host accelerator (pitch {} B)", self.config.pitch_alignment)
    }

    fn pitch_alignment(&self) -> usize {
        self.config.pitch_alignment
    }

    fn launch_limits(&self) -> LaunchLimits {
        self.config.limits
    }

    fn allocate(&self, bytes: usize) -> Result<HostMemory, ConvError> {
        let mut st = self.state.lock();
        let nth = st.allocations_seen;
        st.allocations_seen += 1;

        let refusal = if st.faults.fail_allocation_at == Some(nth) {
            Some("injected allocation fault".to_string())
        } else {
            match self.config.capacity_bytes {
                Some(cap) if st.stats.live_bytes + bytes > cap => Some(format!(
                    "out of device memory ({} of {cap} B in use)",
                    st.stats.live_bytes
                )),
                _ => None,
            }
        };
        if let Some(reason) = refusal {
            st.record(DeviceOp::AllocateFailed { bytes });
            return Err(ConvError::AllocationFailure { bytes: bytes as u64, reason });
        }

        let words = bytes.div_ceil(ELEMENT_BYTES);
        let storage = match st.recycled.remove(&words) {
            Some(storage) => storage,
            None => vec![UNINIT_FILL; words],
        };
        let id = st.next_id;
        st.next_id += 1;
        st.memories.insert(id, storage);
        st.stats.live_allocations += 1;
        st.stats.live_bytes += bytes;
        st.stats.peak_bytes = st.stats.peak_bytes.max(st.stats.live_bytes);
        st.stats.total_allocations += 1;
        st.record(DeviceOp::Allocate { id, bytes });
        Ok(HostMemory { id, bytes })
    }

    fn write(&self, memory: &HostMemory, data: &[u8]) -> Result<(), ConvError> {
        let mut st = self.state.lock();
        let nth = st.uploads_seen;
        st.uploads_seen += 1;
        if st.faults.fail_upload_at == Some(nth) {
            return Err(ConvError::upload("injected transfer fault"));
        }
        if data.len() > memory.bytes {
            return Err(ConvError::upload(format!(
                "{} B does not fit buffer #{} of {} B",
                data.len(),
                memory.id,
                memory.bytes
            )));
        }
        let storage = st
            .memories
            .get_mut(&memory.id)
            .ok_or_else(|| ConvError::upload(format!("buffer #{} is not allocated", memory.id)))?;
        bytemuck::cast_slice_mut::<i32, u8>(storage)[..data.len()].copy_from_slice(data);
        st.record(DeviceOp::Write { id: memory.id, bytes: data.len() });
        Ok(())
    }

    fn read(&self, memory: &HostMemory, out: &mut [u8]) -> Result<(), ConvError> {
        let mut st = self.state.lock();
        if st.faults.fail_download {
            return Err(ConvError::download("injected transfer fault"));
        }
        if out.len() > memory.bytes {
            return Err(ConvError::download(format!(
                "{} B exceeds buffer #{} of {} B",
                out.len(),
                memory.id,
                memory.bytes
            )));
        }
        let storage = st.storage(memory).map_err(ConvError::download)?;
        out.copy_from_slice(&bytemuck::cast_slice::<i32, u8>(storage)[..out.len()]);
        st.record(DeviceOp::Read { id: memory.id, bytes: out.len() });
        Ok(())
    }

    fn launch(&self, args: &KernelArgs<'_, HostMemory>) -> Result<(), ConvError> {
        let mut st = self.state.lock();
        if st.faults.fail_launch {
            return Err(ConvError::LaunchFailure("injected launch fault".into()));
        }
        let max = self.config.limits.max_workgroups_per_dimension;
        if args.grid.iter().any(|&g| g > max) {
            return Err(ConvError::LaunchFailure(format!(
                "grid {:?} exceeds {max} workgroups per dimension",
                args.grid
            )));
        }

        let dims = &args.dims;
        let in_pitch = args.input_pitch / ELEMENT_BYTES;
        let out_pitch = args.output_pitch / ELEMENT_BYTES;
        let input = st.storage(args.input).map_err(ConvError::LaunchFailure)?.clone();
        if input.len() < dims.count * dims.rows * in_pitch {
            return Err(ConvError::LaunchFailure(format!(
                "input buffer #{} is smaller than {}×{} rows of pitch {} B",
                args.input.id, dims.count, dims.rows, args.input_pitch
            )));
        }
        let output = st
            .memories
            .get_mut(&args.output.id)
            .ok_or_else(|| ConvError::LaunchFailure(format!("buffer #{} is not allocated", args.output.id)))?;
        if output.len() < dims.count * dims.rows_out * out_pitch {
            return Err(ConvError::LaunchFailure(format!(
                "output buffer #{} is smaller than {}×{} rows of pitch {} B",
                args.output.id, dims.count, dims.rows_out, args.output_pitch
            )));
        }
        convolve_pitched(&input, in_pitch, output, out_pitch, dims, &args.filter);
        st.record(DeviceOp::Launch {
            input: args.input.id,
            output: args.output.id,
            grid: args.grid,
        });
        Ok(())
    }

    fn synchronize(&self) -> Result<(), ConvError> {
        let mut st = self.state.lock();
        if st.faults.fail_synchronize {
            return Err(ConvError::SynchronizationFailure("injected synchronization fault".into()));
        }
        st.record(DeviceOp::Synchronize);
        Ok(())
    }

    fn free(&self, memory: HostMemory) {
        let mut st = self.state.lock();
        if let Some(storage) = st.memories.remove(&memory.id) {
            st.recycle(storage);
            st.stats.live_allocations -= 1;
            st.stats.live_bytes -= memory.bytes;
            st.record(DeviceOp::Free { id: memory.id });
        }
    }
}
